// Claude Messages entry point

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::proxy::common::error_classifier::{is_failover_status, is_signature_error, map_claude_error};
use crate::proxy::common::model_mapping::{is_model_supported, resolve_model};
use crate::proxy::mappers::claude::{
    transform_claude_request, transform_response, ClaudeRequest, ClaudeStreamProcessor,
    DegradeStage, TransformOptions,
};
use crate::proxy::relay::relay_stream;

const CLAUDE_SSE_CONTENT_TYPE: &str = "text/event-stream";

/// Decode a Claude Messages body. Untyped or malformed blocks are rejected here.
pub fn decode_claude_request(body: &[u8]) -> Result<ClaudeRequest, ForwardError> {
    serde_json::from_slice(body)
        .map_err(|e| ForwardError::InvalidRequest(format!("Invalid request body: {}", e)))
}

impl ForwardService {
    fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            enable_identity_patch: self.settings.identity_patch_enabled(),
            identity_patch: self.settings.identity_patch(),
        }
    }

    fn claude_body(
        request: &ClaudeRequest,
        project_id: &str,
        mapped_model: &str,
        options: &TransformOptions,
    ) -> Result<Bytes, String> {
        let envelope = transform_claude_request(request, project_id, mapped_model, options)?;
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| format!("failed to encode request: {}", e))
    }

    /// Forward a Claude Messages request on `account`.
    ///
    /// Writes the response (or a Claude-shaped error) into `sink`, except for
    /// failover-eligible rejections and cancellation.
    pub async fn forward_claude(
        &self,
        account: &Account,
        request: &ClaudeRequest,
        sink: &mut dyn ResponseSink,
        cancel: &CancellationToken,
    ) -> Result<ForwardResult, ForwardError> {
        let started = Instant::now();
        let trace_id = new_trace_id("claude");

        if request.model.trim().is_empty() {
            write_claude_error(sink, 400, "invalid_request_error", "Missing model").await;
            return Err(ForwardError::InvalidRequest("missing model".to_string()));
        }
        if !is_model_supported(&request.model) {
            let message = format!("Unsupported model: {}", request.model);
            write_claude_error(sink, 400, "invalid_request_error", &message).await;
            return Err(ForwardError::InvalidRequest(message));
        }

        let original_model = request.model.clone();
        let mapped_model = resolve_model(Some(account), &original_model);
        tracing::info!(
            "[{}] Claude Request | Account: {} | Model: {} -> {} | Stream: {} | Messages: {}",
            trace_id,
            account.name,
            original_model,
            mapped_model,
            request.stream,
            request.messages.len()
        );

        let call = match self.prepare_call(account, trace_id, cancel).await {
            Ok(c) => c,
            Err(e) => {
                write_claude_error(sink, 502, "api_error", "Failed to get upstream access token").await;
                return Err(e);
            }
        };

        let options = self.transform_options();
        let project_id = account.project_id();
        let body = match Self::claude_body(request, project_id, &mapped_model, &options) {
            Ok(b) => b,
            Err(e) => {
                write_claude_error(sink, 400, "invalid_request_error", &e).await;
                return Err(ForwardError::InvalidRequest(e));
            }
        };

        let action = upstream_action(request.stream);
        let policy = self.settings.retry_policy();
        let mut retry = RetryContext::new(&policy);

        let reply = match self.execute(&call, &mut retry, &policy, &action, body).await {
            Ok(reply) => reply,
            Err(e @ ForwardError::UpstreamUnreachable { .. }) => {
                write_claude_error(sink, 502, "upstream_error", "Upstream request failed after retries").await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let reply = match reply {
            Reply::Failure(failure)
                if failure.status == 400
                    && is_signature_error(&failure.body, &self.settings.signature_error_patterns()) =>
            {
                self.run_signature_ladder(&call, &mut retry, request, &mapped_model, &options, &action, failure)
                    .await?
            }
            other => other,
        };

        let response = match reply {
            Reply::Success(response) => response,
            Reply::Failure(failure) => {
                self.record_upstream_error(&call, &failure).await;
                if is_failover_status(failure.status) {
                    tracing::warn!(
                        "[{}] Upstream {} after {} attempt(s), failover",
                        call.trace_id,
                        failure.status,
                        retry.attempt
                    );
                    return Err(ForwardError::UpstreamRejected {
                        status: failure.status,
                        failover: true,
                    });
                }
                let (status, error_type, message) = map_claude_error(failure.status);
                write_claude_error(sink, status, error_type, message).await;
                return Err(ForwardError::UpstreamRejected {
                    status: failure.status,
                    failover: false,
                });
            }
        };

        let (request_id, headers) = request_id_headers(&response.headers);

        let (usage, first_token_ms) = if request.stream {
            sink.head(200, sse_headers(headers, CLAUDE_SSE_CONTENT_TYPE))
                .await
                .map_err(|_| head_write_failed())?;
            let mut transcoder = ClaudeStreamProcessor::new(&original_model);
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
                    write_claude_error(sink, 502, "upstream_error", "Failed to read upstream response").await;
                    return Err(ForwardError::UpstreamUnreachable {
                        attempts: retry.attempt,
                        message: e.to_string(),
                    });
                }
            };
            let (claude_response, usage) = match transform_response(&body, &original_model) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("[{}] Failed to parse upstream response: {}", call.trace_id, e);
                    write_claude_error(sink, 502, "upstream_error", "Failed to parse upstream response").await;
                    return Err(ForwardError::MalformedResponse(e));
                }
            };
            let value = serde_json::to_value(&claude_response)
                .map_err(|e| ForwardError::MalformedResponse(e.to_string()))?;
            if let Err(e) = write_json(sink, 200, headers, &value).await {
                tracing::debug!("[{}] Client went away before response: {}", call.trace_id, e);
            }
            (usage, None)
        };

        tracing::info!(
            "[{}] Claude done | In: {} | Out: {} | Attempts: {} | Stage: {}",
            call.trace_id,
            usage.input_tokens,
            usage.output_tokens,
            retry.attempt,
            retry.stage.map(|s| s.as_str()).unwrap_or("none")
        );

        Ok(ForwardResult {
            request_id,
            usage,
            model: original_model,
            upstream_model: mapped_model,
            stream: request.stream,
            duration: started.elapsed(),
            first_token_ms,
            image_count: 0,
            image_size: None,
        })
    }

    /// Retry a signature-rejected request with progressively degraded history.
    ///
    /// Each stage starts from the client's request and runs at most once.
    /// Returns the first success, or the last failure seen.
    #[allow(clippy::too_many_arguments)]
    async fn run_signature_ladder(
        &self,
        call: &Call<'_>,
        retry: &mut RetryContext,
        request: &ClaudeRequest,
        mapped_model: &str,
        options: &TransformOptions,
        action: &str,
        mut last: FailedResponse,
    ) -> Result<Reply, ForwardError> {
        let patterns = self.settings.signature_error_patterns();

        for stage in DegradeStage::LADDER {
            let mut degraded = request.clone();
            if !stage.apply(&mut degraded) {
                tracing::debug!("[{}] Degrade stage {} is a no-op, skipping", call.trace_id, stage.as_str());
                continue;
            }
            let body = match Self::claude_body(&degraded, call.account.project_id(), mapped_model, options) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!("[{}] Degrade stage {} transform failed: {}", call.trace_id, stage.as_str(), e);
                    continue;
                }
            };

            tracing::info!(
                "[{}] Signature-related 400, retrying once ({})",
                call.trace_id,
                stage.as_str()
            );
            retry.attempt += 1;
            retry.stage = Some(stage);

            let response = match self.send_once(call, action, body).await {
                Ok(r) => r,
                Err(SendFailure::Canceled) => return Err(ForwardError::Canceled),
                Err(SendFailure::Transport(e)) => {
                    tracing::warn!(
                        "[{}] Signature retry request failed ({}): {}",
                        call.trace_id,
                        stage.as_str(),
                        e
                    );
                    continue;
                }
            };

            if response.status < 400 {
                return Ok(Reply::Success(response));
            }

            let failure = FailedResponse::read(response, call.cancel).await?;
            let still_signature = failure.status == 400 && is_signature_error(&failure.body, &patterns);
            last = failure;
            if !still_signature {
                break;
            }
        }

        Ok(Reply::Failure(last))
    }
}
