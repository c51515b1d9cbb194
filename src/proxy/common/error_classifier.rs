// Error classification for upstream responses
//
// Lookup tables that decide retry / failover / degradation, plus the
// protocol-shaped error bodies written back to clients.

use serde_json::{json, Value};

/// Statuses worth resending unchanged after a backoff.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

/// Statuses that should send the caller to a different account.
pub fn is_failover_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429 | 529) || status >= 500
}

/// Classify a transport error for logging.
pub fn classify_transport_error(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "timeout_error"
    } else if error.is_connect() {
        "connection_error"
    } else if error.is_decode() {
        "decode_error"
    } else if error.is_body() {
        "stream_error"
    } else {
        "unknown_error"
    }
}

/// Pull the human readable message out of an upstream error body.
///
/// Looks at `error.message`, then a top-level `message`. Returns an empty
/// string when the body is not JSON or carries neither.
pub fn extract_upstream_error_message(body: &[u8]) -> String {
    let Ok(payload) = serde_json::from_slice::<Value>(body) else {
        return String::new();
    };

    let nested = payload
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .filter(|m| !m.trim().is_empty());
    if let Some(msg) = nested {
        return msg.to_string();
    }

    payload
        .get("message")
        .and_then(|m| m.as_str())
        .filter(|m| !m.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_default()
}

/// Whether a 400 body is a thinking-signature rejection.
///
/// `patterns` are lowercase substrings; a structural "expected thinking"
/// complaint always matches.
pub fn is_signature_error(body: &[u8], patterns: &[String]) -> bool {
    let mut msg = extract_upstream_error_message(body).trim().to_lowercase();
    if msg.is_empty() {
        msg = String::from_utf8_lossy(body).to_lowercase();
    }

    if patterns
        .iter()
        .filter(|p| !p.is_empty())
        .any(|p| msg.contains(&p.to_lowercase()))
    {
        return true;
    }

    // "Expected `thinking` or `redacted_thinking`, but found `text`"
    msg.contains("expected") && msg.contains("thinking")
}

/// Whether a response means the upstream does not know the model.
///
/// Every 404 counts, with or without a recognizable message.
pub fn is_model_not_found(status: u16, body: &[u8]) -> bool {
    if status != 404 {
        return false;
    }
    let lower = String::from_utf8_lossy(body).to_lowercase();
    let explicit = ["model not found", "unknown model", "not found"]
        .iter()
        .any(|k| lower.contains(k));
    if !explicit {
        tracing::debug!("[Forward] Treating bare 404 as model-not-found");
    }
    true
}

/// Client-facing Claude error for a terminal upstream status.
///
/// Returns (client_status, error_type, message). Upstream bodies are never echoed.
pub fn map_claude_error(upstream_status: u16) -> (u16, &'static str, &'static str) {
    match upstream_status {
        400 => (400, "invalid_request_error", "Invalid request"),
        401 => (502, "authentication_error", "Upstream authentication failed"),
        403 => (502, "permission_error", "Upstream access forbidden"),
        429 => (429, "rate_limit_error", "Upstream rate limit exceeded"),
        529 => (503, "overloaded_error", "Upstream service overloaded"),
        _ => (502, "upstream_error", "Upstream request failed"),
    }
}

pub fn google_status_name(status: u16) -> &'static str {
    match status {
        400 => "INVALID_ARGUMENT",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        500 => "INTERNAL",
        502 | 503 => "UNAVAILABLE",
        _ => "UNKNOWN",
    }
}

pub fn claude_error_body(error_type: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": { "type": error_type, "message": message }
    })
}

pub fn google_error_body(status: u16, message: &str) -> Value {
    json!({
        "error": {
            "code": status,
            "message": message,
            "status": google_status_name(status),
        }
    })
}

/// Google-shaped error for a terminal upstream rejection on the Gemini path.
///
/// A well-formed `{"error": {"message": ..}}` keeps its message; anything
/// else is summarized with a fixed message. The upstream shape is never
/// passed through.
pub fn google_error_from_upstream(status: u16, body: &[u8]) -> Value {
    let message = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("Upstream request failed with status {}", status));
    google_error_body(status, &message)
}
