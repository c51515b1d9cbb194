// Gemini generateContent entry point

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::proxy::common::error_classifier::{
    google_error_from_upstream, is_failover_status, is_model_not_found,
};
use crate::proxy::common::model_mapping::{
    is_image_generation_model, is_model_supported, normalize_gemini_model, resolve_model,
};
use crate::proxy::common::usage::extract_usage;
use crate::proxy::mappers::gemini::{
    extract_image_size, unwrap_response_bytes, wrap_request, GeminiStreamProcessor,
};
use crate::proxy::relay::relay_stream;
use crate::proxy::sink::write_body;

const GEMINI_SSE_CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";

/// A native Gemini call: `/v1beta/models/{model}:{action}`
#[derive(Debug, Clone, Default)]
pub struct GeminiRequest {
    pub model: String,
    pub action: String,
    /// `alt=sse` or a streaming action
    pub stream: bool,
    pub body: Bytes,
}

impl GeminiRequest {
    pub fn new(model: impl Into<String>, action: impl Into<String>, stream: bool, body: impl Into<Bytes>) -> Self {
        Self {
            model: model.into(),
            action: action.into(),
            stream,
            body: body.into(),
        }
    }
}

fn wrap_bytes(body: &[u8], project_id: &str, model: &str) -> Result<Bytes, String> {
    let envelope = wrap_request(body, project_id, model)?;
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|e| format!("failed to encode envelope: {}", e))
}

impl ForwardService {
    /// Forward a native Gemini request on `account`.
    ///
    /// Writes the response (or a Google-shaped error) into `sink`, except for
    /// failover-eligible rejections and cancellation.
    pub async fn forward_gemini(
        &self,
        account: &Account,
        request: &GeminiRequest,
        sink: &mut dyn ResponseSink,
        cancel: &CancellationToken,
    ) -> Result<ForwardResult, ForwardError> {
        let started = Instant::now();
        let trace_id = new_trace_id("gemini");
        let original_model = normalize_gemini_model(&request.model).to_string();
        let action = request.action.trim();

        if original_model.is_empty() {
            write_google_error(sink, 400, "Missing model in URL").await;
            return Err(ForwardError::InvalidRequest("missing model".to_string()));
        }
        if action.is_empty() {
            write_google_error(sink, 400, "Missing action in URL").await;
            return Err(ForwardError::InvalidRequest("missing action".to_string()));
        }
        if request.body.is_empty() {
            write_google_error(sink, 400, "Request body is empty").await;
            return Err(ForwardError::InvalidRequest("empty body".to_string()));
        }
        if !is_model_supported(&original_model) {
            let message = format!("Unsupported model: {}", original_model);
            write_google_error(sink, 400, &message).await;
            return Err(ForwardError::InvalidRequest(message));
        }

        match action {
            ACTION_GENERATE | ACTION_STREAM => {}
            ACTION_COUNT_TOKENS => {
                // Answered locally, never sent upstream
                if let Err(e) = write_json(sink, 200, HeaderMap::new(), &json!({"totalTokens": 0})).await {
                    tracing::debug!("[{}] Client went away: {}", trace_id, e);
                }
                return Ok(ForwardResult {
                    request_id: String::new(),
                    usage: Default::default(),
                    model: original_model.clone(),
                    upstream_model: original_model,
                    stream: false,
                    duration: started.elapsed(),
                    first_token_ms: None,
                    image_count: 0,
                    image_size: None,
                });
            }
            other => {
                let message = format!("Unsupported action: {}", other);
                write_google_error(sink, 404, &message).await;
                return Err(ForwardError::InvalidRequest(message));
            }
        }

        let mapped_model = resolve_model(Some(account), &original_model);
        let stream = request.stream || action == ACTION_STREAM;
        tracing::info!(
            "[{}] Gemini Request | Account: {} | Model: {} -> {} | Action: {} | Stream: {}",
            trace_id,
            account.name,
            original_model,
            mapped_model,
            action,
            stream
        );

        let call = match self.prepare_call(account, trace_id, cancel).await {
            Ok(c) => c,
            Err(e) => {
                write_google_error(sink, 502, "Failed to get upstream access token").await;
                return Err(e);
            }
        };

        let project_id = account.project_id();
        let body = match wrap_bytes(&request.body, project_id, &mapped_model) {
            Ok(b) => b,
            Err(e) => {
                write_google_error(sink, 400, &e).await;
                return Err(ForwardError::InvalidRequest(e));
            }
        };

        let upstream_action = upstream_action(stream);
        let policy = self.settings.retry_policy();
        let mut retry = RetryContext::new(&policy);

        let reply = match self
            .execute(&call, &mut retry, &policy, &upstream_action, body)
            .await
        {
            Ok(reply) => reply,
            Err(e @ ForwardError::UpstreamUnreachable { .. }) => {
                write_google_error(sink, 502, "Upstream request failed after retries").await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let mut upstream_model = mapped_model.clone();
        let response = match reply {
            Reply::Success(response) => response,
            Reply::Failure(failure) => {
                let fallback = self
                    .try_model_fallback(&call, &mut retry, request, &mapped_model, &upstream_action, &failure)
                    .await?;
                match fallback {
                    Some((fallback_model, response)) => {
                        upstream_model = fallback_model;
                        response
                    }
                    None => return self.fail_gemini(&call, failure, sink).await,
                }
            }
        };

        let (request_id, headers) = request_id_headers(&response.headers);
        let status = response.status;

        let (usage, first_token_ms) = if stream {
            let content_type = response
                .header_str(CONTENT_TYPE.as_str())
                .filter(|v| !v.is_empty())
                .unwrap_or(GEMINI_SSE_CONTENT_TYPE)
                .to_string();
            sink.head(status, sse_headers(headers, &content_type))
                .await
                .map_err(|_| head_write_failed())?;
            let mut transcoder = GeminiStreamProcessor::new();
            let outcome = relay_stream(
                response.body,
                &mut transcoder,
                sink,
                &self.relay_options(&call.trace_id),
                cancel,
                started,
            )
            .await
            .map_err(|e| {
                tracing::warn!("[{}] status=stream_error error={}", call.trace_id, e);
                relay_error(e)
            })?;
            (outcome.usage, outcome.first_token_ms)
        } else {
            let mut response = response;
            let body = match read_body_cancellable(&mut response, SUCCESS_BODY_LIMIT, cancel).await {
                Ok(b) => b,
                Err(SendFailure::Canceled) => {
                    tracing::info!("[{}] Client canceled while reading response", call.trace_id);
                    return Err(ForwardError::Canceled);
                }
                Err(SendFailure::Transport(e)) => {
                    write_google_error(sink, 502, "Failed to read upstream response").await;
                    return Err(ForwardError::UpstreamUnreachable {
                        attempts: retry.attempt,
                        message: e.to_string(),
                    });
                }
            };
            let unwrapped = unwrap_response_bytes(&body);
            let usage = serde_json::from_slice::<Value>(&unwrapped)
                .ok()
                .and_then(|v| extract_usage(&v))
                .unwrap_or_default();
            if let Err(e) = write_body(sink, status, headers, "application/json", Bytes::from(unwrapped)).await {
                tracing::debug!("[{}] Client went away before response: {}", call.trace_id, e);
            }
            (usage, None)
        };

        let is_image = is_image_generation_model(&upstream_model);
        tracing::info!(
            "[{}] Gemini done | In: {} | Out: {} | Attempts: {}",
            call.trace_id,
            usage.input_tokens,
            usage.output_tokens,
            retry.attempt
        );

        Ok(ForwardResult {
            request_id,
            usage,
            model: original_model,
            upstream_model,
            stream,
            duration: started.elapsed(),
            first_token_ms,
            image_count: u32::from(is_image),
            image_size: is_image.then(|| extract_image_size(&request.body)),
        })
    }

    /// Retry once with the configured fallback model when upstream does not
    /// know the mapped one. Returns the fallback model and its response.
    async fn try_model_fallback(
        &self,
        call: &Call<'_>,
        retry: &mut RetryContext,
        request: &GeminiRequest,
        mapped_model: &str,
        action: &str,
        failure: &FailedResponse,
    ) -> Result<Option<(String, UpstreamResponse)>, ForwardError> {
        if !self.settings.model_fallback_enabled() || !is_model_not_found(failure.status, &failure.body) {
            return Ok(None);
        }
        let fallback_model = self.settings.fallback_model(mapped_model);
        if fallback_model.is_empty() || fallback_model == mapped_model {
            return Ok(None);
        }

        tracing::warn!(
            "[{}] Model not found ({}), retrying with fallback model {} (account: {})",
            call.trace_id,
            mapped_model,
            fallback_model,
            call.account.name
        );
        let body = match wrap_bytes(&request.body, call.account.project_id(), &fallback_model) {
            Ok(b) => b,
            Err(_) => return Ok(None),
        };

        retry.attempt += 1;
        match self.send_once(call, action, body).await {
            Ok(response) if response.status < 400 => Ok(Some((fallback_model, response))),
            Ok(response) => {
                tracing::warn!(
                    "[{}] Fallback model {} also failed with {}",
                    call.trace_id,
                    fallback_model,
                    response.status
                );
                Ok(None)
            }
            Err(SendFailure::Canceled) => Err(ForwardError::Canceled),
            Err(SendFailure::Transport(e)) => {
                tracing::warn!("[{}] Fallback request failed: {}", call.trace_id, e);
                Ok(None)
            }
        }
    }

    /// Terminal Gemini failure: failover, or a Google-shaped error for the client.
    async fn fail_gemini(
        &self,
        call: &Call<'_>,
        failure: FailedResponse,
        sink: &mut dyn ResponseSink,
    ) -> Result<ForwardResult, ForwardError> {
        self.record_upstream_error(call, &failure).await;

        if is_failover_status(failure.status) {
            tracing::warn!("[{}] Upstream {}, failover", call.trace_id, failure.status);
            return Err(ForwardError::UpstreamRejected {
                status: failure.status,
                failover: true,
            });
        }

        let (_, headers) = request_id_headers(&failure.headers);
        let unwrapped = unwrap_response_bytes(&failure.body);
        let body = google_error_from_upstream(failure.status, &unwrapped);
        if let Err(e) = write_json(sink, failure.status, headers, &body).await {
            tracing::debug!("[{}] Client went away before error: {}", call.trace_id, e);
        }
        Err(ForwardError::UpstreamRejected {
            status: failure.status,
            failover: false,
        })
    }
}
