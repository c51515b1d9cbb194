// 上游通信模块

pub mod client;
pub mod retry;

pub use client::{
    build_url, read_body_bounded, BodyStream, HttpUpstream, ReqwestUpstream, UpstreamError,
    UpstreamRequest, UpstreamResponse,
};
pub use retry::{RetryContext, RetryPolicy};
