// 上游客户端实现
// 基于 reqwest 封装，支持按账号代理与并发限制

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::Client;
use tokio::sync::Semaphore;

use crate::models::config::UpstreamConfig;
use crate::proxy::common::error_classifier::classify_transport_error;

/// Upstream body as a stream of chunks
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamError {
    /// Connect, timeout or protocol failure before a status was received
    #[error("upstream transport error ({kind}): {message}")]
    Transport { kind: &'static str, message: String },

    /// Failure while reading an already started body
    #[error("upstream body read error: {0}")]
    Body(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    fn from_reqwest(error: &reqwest::Error) -> Self {
        Self::Transport {
            kind: classify_transport_error(error),
            message: error.to_string(),
        }
    }
}

/// A fully built upstream call
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub access_token: String,
    pub user_agent: String,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn headers(&self) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.access_token))
                .map_err(|e| UpstreamError::InvalidRequest(format!("authorization: {}", e)))?,
        );
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| UpstreamError::InvalidRequest(format!("user-agent: {}", e)))?,
        );
        Ok(headers)
    }
}

/// Status, headers and a not yet consumed body
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl UpstreamResponse {
    /// In-memory response, handy for fakes
    pub fn from_bytes(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers,
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
        }
    }

    pub fn from_stream(status: u16, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Buffer the body up to `limit` bytes; the rest is discarded.
    pub async fn read_body(&mut self, limit: usize) -> Result<Bytes, UpstreamError> {
        read_body_bounded(&mut self.body, limit).await
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Read at most `limit` bytes of a body stream.
pub async fn read_body_bounded(body: &mut BodyStream, limit: usize) -> Result<Bytes, UpstreamError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if buf.len() >= limit {
            break;
        }
    }
    Ok(buf.freeze())
}

/// `{base}/v1internal:{action}`, tolerant of a trailing slash on the base.
pub fn build_url(base_url: &str, action: &str) -> String {
    format!("{}/v1internal:{}", base_url.trim_end_matches('/'), action)
}

/// 标准化代理 URL（确保有协议前缀）
pub fn normalize_proxy_url(url: &str) -> String {
    let trimmed = url.trim();
    if trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
        || trimmed.starts_with("socks5://")
        || trimmed.starts_with("socks5h://")
    {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

/// Transport used by the forwarding engine
#[async_trait]
pub trait HttpUpstream: Send + Sync {
    /// Send one request. `concurrency` caps in-flight calls per account
    /// (0 = unlimited); the slot is held until the response body is dropped.
    async fn send(
        &self,
        request: UpstreamRequest,
        proxy_url: Option<&str>,
        account_id: &str,
        concurrency: usize,
    ) -> Result<UpstreamResponse, UpstreamError>;
}

pub struct ReqwestUpstream {
    default_client: Client,
    client_cache: DashMap<String, Client>,
    account_slots: DashMap<String, Arc<Semaphore>>,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ReqwestUpstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let default_client = Self::build_client(
            config.proxy_url.as_deref(),
            connect_timeout,
            request_timeout,
        )?;

        if let Some(proxy) = &config.proxy_url {
            tracing::info!("[Upstream] Default client uses proxy {}", normalize_proxy_url(proxy));
        }

        Ok(Self {
            default_client,
            client_cache: DashMap::new(),
            account_slots: DashMap::new(),
            connect_timeout,
            request_timeout,
        })
    }

    fn build_client(
        proxy_url: Option<&str>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Client, UpstreamError> {
        let mut builder = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(request_timeout);

        if let Some(url) = proxy_url.filter(|u| !u.trim().is_empty()) {
            let proxy = reqwest::Proxy::all(normalize_proxy_url(url))
                .map_err(|e| UpstreamError::InvalidRequest(format!("proxy {}: {}", url, e)))?;
            builder = builder.proxy(proxy);
        }

        builder.build().map_err(|e| UpstreamError::from_reqwest(&e))
    }

    /// Client for a proxy URL, cached by normalized URL
    fn client_for(&self, proxy_url: Option<&str>) -> Client {
        let Some(url) = proxy_url.filter(|u| !u.trim().is_empty()) else {
            return self.default_client.clone();
        };
        let key = normalize_proxy_url(url);
        if let Some(client) = self.client_cache.get(&key) {
            return client.clone();
        }

        match Self::build_client(Some(&key), self.connect_timeout, self.request_timeout) {
            Ok(client) => {
                self.client_cache.insert(key, client.clone());
                client
            }
            Err(e) => {
                tracing::error!("[Upstream] Failed to build client for proxy {}: {}, falling back to default", key, e);
                self.default_client.clone()
            }
        }
    }

    fn slots_for(&self, account_id: &str, concurrency: usize) -> Arc<Semaphore> {
        self.account_slots
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(concurrency)))
            .clone()
    }
}

#[async_trait]
impl HttpUpstream for ReqwestUpstream {
    async fn send(
        &self,
        request: UpstreamRequest,
        proxy_url: Option<&str>,
        account_id: &str,
        concurrency: usize,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let permit = if concurrency > 0 {
            let slots = self.slots_for(account_id, concurrency);
            let permit = slots.acquire_owned().await.map_err(|e| UpstreamError::Transport {
                kind: "concurrency_closed",
                message: e.to_string(),
            })?;
            Some(permit)
        } else {
            None
        };

        let client = self.client_for(proxy_url);
        let headers = request.headers()?;

        let resp = client
            .post(&request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(&e))?;

        let status = resp.status().as_u16();
        let headers = resp.headers().clone();

        let body = async_stream::stream! {
            // Account slot lives as long as the body
            let _permit = permit;
            let mut chunks = Box::pin(resp.bytes_stream());
            while let Some(chunk) = chunks.next().await {
                yield chunk.map_err(|e| UpstreamError::Body(e.to_string()));
            }
        };

        Ok(UpstreamResponse::from_stream(status, headers, Box::pin(body)))
    }
}
