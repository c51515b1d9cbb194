// Gemini v1internal request wrapping / response unwrapping

use serde_json::{json, Value};

use super::models::V1InternalRequest;

/// `userAgent` field carried inside every envelope
pub const ENVELOPE_USER_AGENT: &str = "antigravity";
/// `requestType` field carried inside every envelope
pub const ENVELOPE_REQUEST_TYPE: &str = "agent";

const DEFAULT_IMAGE_SIZE: &str = "2K";

/// Build a fresh envelope around a Gemini native body.
///
/// Every call gets a new `agent-<uuid>` request id, so envelopes must not be
/// reused across attempts.
pub fn build_envelope(project_id: &str, model: &str, native_body: Value) -> V1InternalRequest {
    V1InternalRequest {
        project: project_id.to_string(),
        request_id: format!("agent-{}", uuid::Uuid::new_v4()),
        user_agent: ENVELOPE_USER_AGENT.to_string(),
        request_type: ENVELOPE_REQUEST_TYPE.to_string(),
        model: model.to_string(),
        request: native_body,
    }
}

/// Wrap a raw Gemini-protocol body for the upstream.
///
/// Cleans `[undefined]` placeholders some clients inject, renames
/// `parametersJsonSchema` to `parameters` on function declarations and makes
/// sure `systemInstruction` carries a role.
pub fn wrap_request(body: &[u8], project_id: &str, mapped_model: &str) -> Result<Value, String> {
    let mut inner: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid request body: {}", e))?;

    deep_clean_undefined(&mut inner, 0);

    if let Some(tools) = inner.get_mut("tools").and_then(|t| t.as_array_mut()) {
        for tool in tools.iter_mut() {
            let Some(decls) = tool
                .get_mut("functionDeclarations")
                .and_then(|d| d.as_array_mut())
            else {
                continue;
            };
            for decl in decls.iter_mut().filter_map(|d| d.as_object_mut()) {
                if let Some(schema) = decl.remove("parametersJsonSchema") {
                    decl.insert("parameters".to_string(), schema);
                }
            }
        }
    }

    if let Some(sys) = inner
        .get_mut("systemInstruction")
        .and_then(|s| s.as_object_mut())
    {
        sys.entry("role").or_insert_with(|| json!("user"));
    }

    let envelope = build_envelope(project_id, mapped_model, inner);
    serde_json::to_value(envelope).map_err(|e| format!("failed to encode envelope: {}", e))
}

/// Unwrap a v1internal response (extract the inner `response` field).
///
/// Bodies without `response` pass through, so unwrapping twice is a no-op.
pub fn unwrap_response(response: &Value) -> Value {
    response.get("response").unwrap_or(response).clone()
}

/// Byte-level variant of [`unwrap_response`]. Non-JSON input is returned as is.
pub fn unwrap_response_bytes(body: &[u8]) -> Vec<u8> {
    let Ok(outer) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };
    match outer.get("response") {
        Some(inner) => serde_json::to_vec(inner).unwrap_or_else(|_| body.to_vec()),
        None => body.to_vec(),
    }
}

/// Requested image size from `generationConfig.imageConfig.imageSize`.
///
/// Only 1K, 2K and 4K are accepted; anything else (or a missing field) is 2K.
pub fn extract_image_size(body: &[u8]) -> String {
    let size = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/generationConfig/imageConfig/imageSize")
                .and_then(|s| s.as_str())
                .map(|s| s.trim().to_uppercase())
        });

    match size.as_deref() {
        Some(s @ ("1K" | "2K" | "4K")) => s.to_string(),
        _ => DEFAULT_IMAGE_SIZE.to_string(),
    }
}

/// Deep clean `[undefined]` strings from client payloads
fn deep_clean_undefined(value: &mut Value, depth: usize) {
    if depth > 10 {
        return;
    }
    match value {
        Value::Object(map) => {
            map.retain(|_, v| v.as_str() != Some("[undefined]"));
            for v in map.values_mut() {
                deep_clean_undefined(v, depth + 1);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                deep_clean_undefined(v, depth + 1);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_envelope_fields() {
        let env = build_envelope("proj", "gemini-3-flash", json!({"contents": []}));
        assert_eq!(env.project, "proj");
        assert_eq!(env.model, "gemini-3-flash");
        assert_eq!(env.request_type, "agent");
        assert_eq!(env.user_agent, ENVELOPE_USER_AGENT);
        assert!(env.request_id.starts_with("agent-"));

        let again = build_envelope("proj", "gemini-3-flash", json!({}));
        assert_ne!(env.request_id, again.request_id);
    }

    #[test]
    fn test_wrap_request_cleans_body() {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "systemInstruction": {"parts": [{"text": "be brief"}]},
            "tools": [{"functionDeclarations": [{
                "name": "lookup",
                "parametersJsonSchema": {"type": "object"}
            }]}],
            "cachedContent": "[undefined]"
        });
        let wrapped = wrap_request(body.to_string().as_bytes(), "p1", "gemini-2.5-flash").unwrap();

        assert_eq!(wrapped["project"], "p1");
        assert_eq!(wrapped["model"], "gemini-2.5-flash");
        let inner = &wrapped["request"];
        assert!(inner.get("cachedContent").is_none());
        assert_eq!(inner["systemInstruction"]["role"], "user");
        let decl = &inner["tools"][0]["functionDeclarations"][0];
        assert!(decl.get("parametersJsonSchema").is_none());
        assert_eq!(decl["parameters"]["type"], "object");
    }

    #[test]
    fn test_wrap_request_rejects_invalid_json() {
        assert!(wrap_request(b"{not json", "p", "m").is_err());
    }

    #[test]
    fn test_unwrap_is_idempotent() {
        let wrapped = json!({"response": {"candidates": [], "usageMetadata": {"promptTokenCount": 1}}});
        let once = unwrap_response(&wrapped);
        let twice = unwrap_response(&once);
        assert_eq!(once, twice);
        assert_eq!(once["usageMetadata"]["promptTokenCount"], 1);

        let bytes = unwrap_response_bytes(wrapped.to_string().as_bytes());
        assert_eq!(unwrap_response_bytes(&bytes), bytes);
        assert_eq!(unwrap_response_bytes(b"plain text"), b"plain text".to_vec());
    }

    #[test]
    fn test_extract_image_size() {
        let body = |size: &str| {
            json!({"generationConfig": {"imageConfig": {"imageSize": size}}}).to_string()
        };
        assert_eq!(extract_image_size(body(" 4k ").as_bytes()), "4K");
        assert_eq!(extract_image_size(body("1K").as_bytes()), "1K");
        assert_eq!(extract_image_size(body("8K").as_bytes()), "2K");
        assert_eq!(extract_image_size(b"{}"), "2K");
        assert_eq!(extract_image_size(b"garbage"), "2K");
    }
}
