// Common handler utilities - account failover and response bridging
//
// Each attempt runs the forward engine on its own task writing into a
// channel-backed sink. The first response head wins; a task that ends
// without one either failed over (try the next account) or hit an error the
// engine could not answer itself.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Body,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::models::Account;
use crate::proxy::common::error_classifier::{claude_error_body, google_error_body};
use crate::proxy::forward::{ForwardError, ForwardResult, ForwardService};
use crate::proxy::sink::{channel_sink, ChannelSink, ChannelSinkReceiver, ResponseHead};

/// Body chunks buffered between the forward task and hyper
pub const RESPONSE_CHANNEL_CAPACITY: usize = 32;

/// Wire protocol of the calling client, decides error envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Claude,
    Gemini,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Claude => "claude",
            Protocol::Gemini => "gemini",
        }
    }

    fn error_body(&self, status: u16, claude_type: &str, message: &str) -> Value {
        match self {
            Protocol::Claude => claude_error_body(claude_type, message),
            Protocol::Gemini => google_error_body(status, message),
        }
    }
}

/// Protocol-shaped JSON error response
pub fn error_response(protocol: Protocol, status: u16, claude_type: &str, message: &str) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (code, Json(protocol.error_body(status, claude_type, message))).into_response()
}

/// 503 once every candidate account is exhausted or locked
pub fn unavailable_response(protocol: Protocol, message: &str) -> Response {
    error_response(protocol, 503, "overloaded_error", message)
}

/// Build a streaming response from a head and the sink's body channel.
///
/// The guard rides along with the body: dropping the response (client gone)
/// cancels the forward task.
fn stream_response(head: ResponseHead, mut body_rx: mpsc::Receiver<Bytes>, guard: DropGuard) -> Response {
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(chunk) = body_rx.recv().await {
            yield Ok::<Bytes, std::convert::Infallible>(chunk);
        }
    };

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY);
    *response.headers_mut() = head.headers;
    response
}

/// Run `run` against each candidate account until one produces a response.
pub async fn dispatch<F, Fut>(state: &AppState, protocol: Protocol, model: &str, run: F) -> Response
where
    F: Fn(Arc<ForwardService>, Account, ChannelSink, CancellationToken) -> Fut,
    Fut: Future<Output = Result<ForwardResult, ForwardError>> + Send + 'static,
{
    let candidates = state.selector.candidates(model);
    if candidates.is_empty() {
        warn!("[{}] No available accounts for {}", protocol.as_str(), model);
        return unavailable_response(protocol, "No available accounts");
    }

    let pool_size = candidates.len();
    let mut last_error: Option<ForwardError> = None;

    for (index, account) in candidates.into_iter().enumerate() {
        let account_id = account.id.clone();
        let account_name = account.name.clone();
        debug!(
            "[{}] Attempt {}/{} on account {}",
            protocol.as_str(),
            index + 1,
            pool_size,
            account_name
        );

        let (sink, receiver) = channel_sink(RESPONSE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();

        let selector = state.selector.clone();
        let work = run(state.forward.clone(), account, sink, cancel);
        let task = tokio::spawn(async move {
            let result = work.await;
            match &result {
                Ok(r) => {
                    selector.mark_success(&account_id);
                    info!(
                        "[{}] Served by {} | {} -> {} | In: {} | Out: {} | {}ms",
                        protocol.as_str(),
                        account_id,
                        r.model,
                        r.upstream_model,
                        r.usage.input_tokens,
                        r.usage.output_tokens,
                        r.duration.as_millis()
                    );
                }
                Err(e) => debug!("[{}] Account {} finished with {}", protocol.as_str(), account_id, e),
            }
            result
        });

        let ChannelSinkReceiver { head, body } = receiver;
        match head.await {
            Ok(head) => return stream_response(head, body, guard),
            Err(_) => {
                // Sink dropped without a head: the task is done
                match task.await {
                    Ok(Err(e)) if e.is_failover() => {
                        warn!(
                            "[{}] Account {} failed over ({}), {} left",
                            protocol.as_str(),
                            account_name,
                            e,
                            pool_size - index - 1
                        );
                        last_error = Some(e);
                        continue;
                    }
                    Ok(Err(e)) => {
                        warn!("[{}] Request ended without response: {}", protocol.as_str(), e);
                        return error_response(protocol, 502, "api_error", "Upstream request failed");
                    }
                    Ok(Ok(_)) => return StatusCode::OK.into_response(),
                    Err(e) => {
                        error!("[{}] Forward task failed: {}", protocol.as_str(), e);
                        return error_response(protocol, 500, "api_error", "Internal error");
                    }
                }
            }
        }
    }

    let message = match last_error.and_then(|e| e.status()) {
        Some(status) => format!("All accounts are unavailable (last upstream status {})", status),
        None => "All accounts are unavailable".to_string(),
    };
    unavailable_response(protocol, &message)
}
