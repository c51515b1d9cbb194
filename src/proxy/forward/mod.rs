// Forward engine - retry / degrade / failover around one upstream call
//
// `ForwardService` owns no mutable state; collaborators are injected as
// trait objects. Every outcome writes a client response except failover
// rejections and cancellation, which leave the sink untouched so the caller
// can route the request to another account.

mod claude;
mod errors;
mod gemini;

pub use errors::{ForwardError, ForwardResult};
pub use claude::decode_claude_request;
pub use gemini::GeminiRequest;

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::models::Account;
use crate::proxy::common::error_classifier::{
    claude_error_body, google_error_body, is_retryable_status,
};
use crate::proxy::config::SettingsProvider;
use crate::proxy::rate_limit::{
    default_rate_limit_window, parse_rate_limit_reset, AccountStore, RateLimitTracker,
};
use crate::proxy::relay::{AbortReason, RelayError, RelayOptions, StreamAbort};
use crate::proxy::sink::{write_json, ResponseSink};
use crate::proxy::token_manager::TokenProvider;
use crate::proxy::upstream::{
    build_url, HttpUpstream, RetryContext, RetryPolicy, UpstreamError, UpstreamRequest,
    UpstreamResponse,
};

/// Cap for buffered success bodies
pub const SUCCESS_BODY_LIMIT: usize = 8 << 20;
/// Cap for buffered error bodies
pub const ERROR_BODY_LIMIT: usize = 2 << 20;

pub const ACTION_GENERATE: &str = "generateContent";
pub const ACTION_STREAM: &str = "streamGenerateContent";
pub const ACTION_COUNT_TOKENS: &str = "countTokens";
const SSE_SUFFIX: &str = "?alt=sse";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-call data resolved once before the first attempt
pub(crate) struct Call<'a> {
    pub account: &'a Account,
    pub access_token: String,
    pub proxy_url: Option<String>,
    pub trace_id: String,
    pub cancel: &'a CancellationToken,
    pub base_url: String,
    pub user_agent: String,
}

/// Buffered terminal error response
#[derive(Debug)]
pub(crate) struct FailedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FailedResponse {
    /// Buffer an error response; an unreadable body becomes empty.
    async fn read(mut response: UpstreamResponse, cancel: &CancellationToken) -> Result<Self, ForwardError> {
        let body = match read_body_cancellable(&mut response, ERROR_BODY_LIMIT, cancel).await {
            Ok(b) => b,
            Err(SendFailure::Canceled) => return Err(ForwardError::Canceled),
            Err(SendFailure::Transport(_)) => Bytes::new(),
        };
        Ok(Self {
            status: response.status,
            headers: response.headers,
            body,
        })
    }
}

/// Bounded buffered read racing cancellation.
pub(crate) async fn read_body_cancellable(
    response: &mut UpstreamResponse,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Bytes, SendFailure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SendFailure::Canceled),
        result = response.read_body(limit) => result.map_err(SendFailure::Transport),
    }
}

pub(crate) enum Reply {
    Success(UpstreamResponse),
    Failure(FailedResponse),
}

pub(crate) enum SendFailure {
    Transport(UpstreamError),
    Canceled,
}

pub struct ForwardService {
    upstream: Arc<dyn HttpUpstream>,
    tokens: Arc<dyn TokenProvider>,
    accounts: Arc<dyn AccountStore>,
    rate_limits: Arc<dyn RateLimitTracker>,
    settings: Arc<dyn SettingsProvider>,
}

impl ForwardService {
    pub fn new(
        upstream: Arc<dyn HttpUpstream>,
        tokens: Arc<dyn TokenProvider>,
        accounts: Arc<dyn AccountStore>,
        rate_limits: Arc<dyn RateLimitTracker>,
        settings: Arc<dyn SettingsProvider>,
    ) -> Self {
        Self {
            upstream,
            tokens,
            accounts,
            rate_limits,
            settings,
        }
    }

    pub fn settings(&self) -> &Arc<dyn SettingsProvider> {
        &self.settings
    }

    /// Resolve token and routing details shared by every attempt.
    pub(crate) async fn prepare_call<'a>(
        &self,
        account: &'a Account,
        trace_id: String,
        cancel: &'a CancellationToken,
    ) -> Result<Call<'a>, ForwardError> {
        let access_token = self
            .tokens
            .get_access_token(account)
            .await
            .map_err(|e| {
                tracing::error!("[{}] Failed to get access token for {}: {}", trace_id, account.name, e);
                ForwardError::TokenUnavailable(e)
            })?;

        Ok(Call {
            account,
            access_token,
            proxy_url: account
                .proxy_url
                .clone()
                .filter(|p| !p.trim().is_empty()),
            trace_id,
            cancel,
            base_url: self.settings.upstream_base_url(),
            user_agent: self.settings.user_agent(),
        })
    }

    /// One upstream call racing cancellation.
    pub(crate) async fn send_once(
        &self,
        call: &Call<'_>,
        action: &str,
        body: Bytes,
    ) -> Result<UpstreamResponse, SendFailure> {
        if call.cancel.is_cancelled() {
            return Err(SendFailure::Canceled);
        }
        let request = UpstreamRequest {
            url: build_url(&call.base_url, action),
            access_token: call.access_token.clone(),
            user_agent: call.user_agent.clone(),
            body,
        };
        tokio::select! {
            biased;
            _ = call.cancel.cancelled() => Err(SendFailure::Canceled),
            result = self.upstream.send(
                request,
                call.proxy_url.as_deref(),
                &call.account.id,
                call.account.concurrency,
            ) => result.map_err(SendFailure::Transport),
        }
    }

    /// Attempt loop: transport errors and retryable statuses back off and
    /// retry until the budget runs out.
    pub(crate) async fn execute(
        &self,
        call: &Call<'_>,
        retry: &mut RetryContext,
        policy: &RetryPolicy,
        action: &str,
        body: Bytes,
    ) -> Result<Reply, ForwardError> {
        let max_attempts = policy.max_attempts;

        for attempt in 1..=max_attempts {
            retry.attempt += 1;

            let response = match self.send_once(call, action, body.clone()).await {
                Ok(r) => r,
                Err(SendFailure::Canceled) => {
                    tracing::info!("[{}] Client canceled before attempt {}", call.trace_id, attempt);
                    return Err(ForwardError::Canceled);
                }
                Err(SendFailure::Transport(e)) => {
                    if attempt < max_attempts {
                        tracing::warn!(
                            "[{}] Upstream request failed, attempt {}/{}: {}",
                            call.trace_id,
                            attempt,
                            max_attempts,
                            e
                        );
                        self.backoff(call, retry, policy, attempt).await?;
                        continue;
                    }
                    tracing::error!(
                        "[{}] Upstream request failed, retries exhausted: {}",
                        call.trace_id,
                        e
                    );
                    return Err(ForwardError::UpstreamUnreachable {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            };

            if response.status < 400 {
                return Ok(Reply::Success(response));
            }

            let failure = FailedResponse::read(response, call.cancel).await?;
            if is_retryable_status(failure.status) && attempt < max_attempts {
                tracing::warn!(
                    "[{}] Upstream {} on attempt {}/{}, retrying",
                    call.trace_id,
                    failure.status,
                    attempt,
                    max_attempts
                );
                self.backoff(call, retry, policy, attempt).await?;
                continue;
            }
            return Ok(Reply::Failure(failure));
        }

        // Budget of zero attempts is clamped by RetryPolicy
        Err(ForwardError::UpstreamUnreachable {
            attempts: 0,
            message: "no attempts made".to_string(),
        })
    }

    async fn backoff(
        &self,
        call: &Call<'_>,
        retry: &mut RetryContext,
        policy: &RetryPolicy,
        attempt: u32,
    ) -> Result<(), ForwardError> {
        match policy.sleep_backoff(attempt, call.cancel).await {
            Some(delay) => {
                tracing::debug!("[{}] Backed off {}ms", call.trace_id, delay.as_millis());
                retry.record_backoff(delay);
                Ok(())
            }
            None => {
                tracing::info!("[{}] Client canceled during backoff", call.trace_id);
                Err(ForwardError::Canceled)
            }
        }
    }

    /// Rate-limit bookkeeping for a terminal upstream error.
    pub(crate) async fn record_upstream_error(&self, call: &Call<'_>, failure: &FailedResponse) {
        if failure.status == 429 {
            let reset_at = match parse_rate_limit_reset(&failure.body) {
                Some(at) => at,
                None => {
                    let window = default_rate_limit_window(&failure.body);
                    tracing::warn!(
                        "[{}] status=429 rate_limited reset_in={}s (fallback)",
                        call.trace_id,
                        window.num_seconds()
                    );
                    Utc::now() + window
                }
            };
            self.accounts
                .set_rate_limited(&call.account.id, reset_at)
                .await;
            return;
        }

        let disable = self
            .rate_limits
            .handle_upstream_error(call.account, failure.status, &failure.headers, &failure.body)
            .await;
        if disable {
            tracing::warn!(
                "[{}] status={} account {} marked_error",
                call.trace_id,
                failure.status,
                call.account.name
            );
        }
    }

    pub(crate) fn relay_options(&self, trace_id: &str) -> RelayOptions {
        RelayOptions {
            idle_timeout: self.settings.stream_idle_timeout(),
            max_line_size: self.settings.max_line_size(),
            trace_id: trace_id.to_string(),
        }
    }
}

pub(crate) fn upstream_action(stream: bool) -> String {
    if stream {
        format!("{}{}", ACTION_STREAM, SSE_SUFFIX)
    } else {
        ACTION_GENERATE.to_string()
    }
}

pub(crate) fn new_trace_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..8])
}

/// Echo upstream `x-request-id`; returns the id ("" when absent).
pub(crate) fn request_id_headers(upstream: &HeaderMap) -> (String, HeaderMap) {
    let mut headers = HeaderMap::new();
    let request_id = upstream
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        if !request_id.is_empty() {
            headers.insert(REQUEST_ID_HEADER, v);
        }
    }
    (request_id, headers)
}

pub(crate) fn sse_headers(mut headers: HeaderMap, content_type: &str) -> HeaderMap {
    let pairs = [
        ("content-type", content_type),
        ("cache-control", "no-cache"),
        ("connection", "keep-alive"),
        ("x-accel-buffering", "no"),
    ];
    for (name, value) in pairs {
        if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(name, v);
        }
    }
    headers
}

pub(crate) fn relay_error(err: RelayError) -> ForwardError {
    match err {
        RelayError::Aborted(abort) => ForwardError::StreamAborted(abort),
        RelayError::Canceled => ForwardError::Canceled,
    }
}

/// Head write failed before any stream data: the client is gone.
pub(crate) fn head_write_failed() -> ForwardError {
    ForwardError::StreamAborted(StreamAbort {
        reason: AbortReason::WriteFailed,
        usage: Default::default(),
        first_token_ms: None,
    })
}

pub(crate) async fn write_claude_error(
    sink: &mut dyn ResponseSink,
    status: u16,
    error_type: &str,
    message: &str,
) {
    if let Err(e) = write_json(sink, status, HeaderMap::new(), &claude_error_body(error_type, message)).await {
        tracing::debug!("Failed to write Claude error response: {}", e);
    }
}

pub(crate) async fn write_google_error(sink: &mut dyn ResponseSink, status: u16, message: &str) {
    if let Err(e) = write_json(sink, status, HeaderMap::new(), &google_error_body(status, message)).await {
        tracing::debug!("Failed to write Google error response: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_action() {
        assert_eq!(upstream_action(false), "generateContent");
        assert_eq!(upstream_action(true), "streamGenerateContent?alt=sse");
    }

    #[test]
    fn test_request_id_echo() {
        let mut upstream = HeaderMap::new();
        upstream.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-9"));
        let (id, headers) = request_id_headers(&upstream);
        assert_eq!(id, "req-9");
        assert_eq!(headers.get(REQUEST_ID_HEADER).unwrap(), "req-9");

        let (id, headers) = request_id_headers(&HeaderMap::new());
        assert!(id.is_empty());
        assert!(headers.is_empty());
    }

    #[test]
    fn test_sse_headers() {
        let headers = sse_headers(HeaderMap::new(), "text/event-stream");
        assert_eq!(headers.get("x-accel-buffering").unwrap(), "no");
        assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
        assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
    }

    #[tokio::test]
    async fn test_buffered_read_observes_cancel() {
        let body: crate::proxy::upstream::BodyStream = Box::pin(futures::stream::pending());
        let mut response = UpstreamResponse::from_stream(200, HeaderMap::new(), body);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = read_body_cancellable(&mut response, SUCCESS_BODY_LIMIT, &cancel).await;
        assert!(matches!(result, Err(SendFailure::Canceled)));

        let err = FailedResponse::read(response, &cancel).await.unwrap_err();
        assert_eq!(err, ForwardError::Canceled);
    }

    #[test]
    fn test_trace_id_prefix() {
        let id = new_trace_id("claude");
        assert!(id.starts_with("claude_"));
        assert_eq!(id.len(), "claude_".len() + 8);
    }
}
