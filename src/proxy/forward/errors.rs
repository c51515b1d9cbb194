use std::time::Duration;

use serde::Serialize;

use crate::proxy::common::TokenUsage;
use crate::proxy::relay::StreamAbort;

/// Failure of one forward call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForwardError {
    /// Malformed client input, no upstream call made
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("access token unavailable: {0}")]
    TokenUnavailable(String),

    /// Transport failure after every attempt
    #[error("upstream unreachable after {attempts} attempt(s): {message}")]
    UpstreamUnreachable { attempts: u32, message: String },

    /// Terminal HTTP error from upstream
    #[error("upstream rejected request with status {status}")]
    UpstreamRejected { status: u16, failover: bool },

    /// Success status but the body could not be read or decoded
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    StreamAborted(StreamAbort),

    #[error("request canceled by client")]
    Canceled,
}

impl ForwardError {
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::InvalidRequest(_) => "invalid_request",
            ForwardError::TokenUnavailable(_) => "token_unavailable",
            ForwardError::UpstreamUnreachable { .. } => "upstream_unreachable",
            ForwardError::UpstreamRejected { .. } => "upstream_rejected",
            ForwardError::MalformedResponse(_) => "upstream_malformed_response",
            ForwardError::StreamAborted(_) => "stream_aborted",
            ForwardError::Canceled => "canceled",
        }
    }

    /// Originating status where one is known
    pub fn status(&self) -> Option<u16> {
        match self {
            ForwardError::InvalidRequest(_) => Some(400),
            ForwardError::UpstreamRejected { status, .. } => Some(*status),
            ForwardError::UpstreamUnreachable { .. } | ForwardError::MalformedResponse(_) => {
                Some(502)
            }
            _ => None,
        }
    }

    /// Whether an outer scheduler should retry on another account
    pub fn is_failover(&self) -> bool {
        matches!(self, ForwardError::UpstreamRejected { failover: true, .. })
    }

    /// Usage accumulated before a stream abort, zero otherwise
    pub fn partial_usage(&self) -> TokenUsage {
        match self {
            ForwardError::StreamAborted(abort) => abort.usage,
            _ => TokenUsage::default(),
        }
    }
}

/// Outcome of a successful forward call, used for billing and logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForwardResult {
    /// Upstream `x-request-id`, empty when absent
    pub request_id: String,
    pub usage: TokenUsage,
    /// Model the client asked for
    pub model: String,
    /// Model actually sent upstream
    pub upstream_model: String,
    pub stream: bool,
    pub duration: Duration,
    pub first_token_ms: Option<u64>,
    pub image_count: u32,
    pub image_size: Option<String>,
}
