// Shared fakes for the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};

use antigravity_gateway_lib::models::account::{CREDENTIAL_ACCESS_TOKEN, CREDENTIAL_PROJECT_ID};
use antigravity_gateway_lib::models::{Account, GatewayConfig};
use antigravity_gateway_lib::proxy::rate_limit::{AccountStore, RateLimitTracker};
use antigravity_gateway_lib::proxy::token_manager::StaticTokenProvider;
use antigravity_gateway_lib::proxy::upstream::{
    HttpUpstream, UpstreamError, UpstreamRequest, UpstreamResponse,
};
use antigravity_gateway_lib::proxy::{ForwardService, SettingsProvider};

/// One scripted upstream reply
pub enum Scripted {
    Reply {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Streamed chunks; `hang` keeps the body open forever afterwards
    Stream { chunks: Vec<Bytes>, hang: bool },
    Transport,
}

impl Scripted {
    pub fn json(status: u16, body: Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        Scripted::Reply {
            status,
            headers,
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn with_header(self, name: &'static str, value: &'static str) -> Self {
        match self {
            Scripted::Reply {
                status,
                mut headers,
                body,
            } => {
                headers.insert(name, HeaderValue::from_static(value));
                Scripted::Reply {
                    status,
                    headers,
                    body,
                }
            }
            other => other,
        }
    }
}

/// What the gateway sent upstream
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub body: Value,
    pub account_id: String,
    pub at: tokio::time::Instant,
}

#[derive(Default)]
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Scripted>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedUpstream {
    pub fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HttpUpstream for ScriptedUpstream {
    async fn send(
        &self,
        request: UpstreamRequest,
        _proxy_url: Option<&str>,
        account_id: &str,
        _concurrency: usize,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.lock().push(RecordedCall {
            url: request.url.clone(),
            body: serde_json::from_slice(&request.body).unwrap_or(Value::Null),
            account_id: account_id.to_string(),
            at: tokio::time::Instant::now(),
        });

        let next = self.script.lock().pop_front();
        match next {
            Some(Scripted::Reply {
                status,
                headers,
                body,
            }) => Ok(UpstreamResponse::from_bytes(status, headers, body)),
            Some(Scripted::Stream { chunks, hang }) => {
                use futures::StreamExt;
                let items = futures::stream::iter(chunks.into_iter().map(Ok::<Bytes, UpstreamError>));
                let body = if hang {
                    items.chain(futures::stream::pending()).boxed()
                } else {
                    items.boxed()
                };
                let mut headers = HeaderMap::new();
                headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
                Ok(UpstreamResponse::from_stream(200, headers, body))
            }
            Some(Scripted::Transport) | None => Err(UpstreamError::Transport {
                kind: "connection_error",
                message: "connection refused".to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct RecordingAccounts {
    pub rate_limited: Mutex<Vec<(String, DateTime<Utc>)>>,
}

#[async_trait]
impl AccountStore for RecordingAccounts {
    async fn set_rate_limited(&self, account_id: &str, reset_at: DateTime<Utc>) {
        self.rate_limited.lock().push((account_id.to_string(), reset_at));
    }
}

#[derive(Default)]
pub struct RecordingTracker {
    pub statuses: Mutex<Vec<u16>>,
}

#[async_trait]
impl RateLimitTracker for RecordingTracker {
    async fn handle_upstream_error(
        &self,
        _account: &Account,
        status: u16,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> bool {
        self.statuses.lock().push(status);
        false
    }
}

pub struct Harness {
    pub service: ForwardService,
    pub upstream: Arc<ScriptedUpstream>,
    pub accounts: Arc<RecordingAccounts>,
    pub tracker: Arc<RecordingTracker>,
}

pub fn harness(script: Vec<Scripted>, config: GatewayConfig) -> Harness {
    harness_with_settings(script, Arc::new(config))
}

/// Harness reading settings through `settings`, e.g. a hot-swappable one
pub fn harness_with_settings(script: Vec<Scripted>, settings: Arc<dyn SettingsProvider>) -> Harness {
    let upstream = ScriptedUpstream::new(script);
    let accounts = Arc::new(RecordingAccounts::default());
    let tracker = Arc::new(RecordingTracker::default());
    let service = ForwardService::new(
        upstream.clone(),
        Arc::new(StaticTokenProvider),
        accounts.clone(),
        tracker.clone(),
        settings,
    );
    Harness {
        service,
        upstream,
        accounts,
        tracker,
    }
}

pub fn account(id: &str) -> Account {
    Account::new(id, format!("{}@example.com", id))
        .with_credential(CREDENTIAL_ACCESS_TOKEN, "ya29.test")
        .with_credential(CREDENTIAL_PROJECT_ID, "proj-test")
}

/// Wrapped v1internal success with text and usage
pub fn upstream_text(text: &str, input: u32, output: u32) -> Value {
    json!({
        "response": {
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": text}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": input,
                "candidatesTokenCount": output,
                "totalTokenCount": input + output
            },
            "modelVersion": "claude-sonnet-4-5",
            "responseId": "resp-1"
        }
    })
}

pub fn google_error(status: u16, message: &str) -> Value {
    json!({"error": {"code": status, "message": message, "status": "ERROR"}})
}

pub fn sse_line(value: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", value))
}
