// Response sink: where the forward engine writes the client response
//
// `head` fixes status and headers before any body bytes; `write` pushes one
// chunk; `flush` makes everything written so far visible to the client.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Closed,
    #[error("response head already sent")]
    HeadAlreadySent,
    #[error("sink write failed: {0}")]
    Io(String),
}

#[async_trait]
pub trait ResponseSink: Send {
    async fn head(&mut self, status: u16, headers: HeaderMap) -> Result<(), SinkError>;
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError>;
    async fn flush(&mut self) -> Result<(), SinkError>;
    fn head_sent(&self) -> bool;
}

pub fn header_pairs(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(n, v);
        }
    }
    headers
}

/// Write a complete buffered response: head, body, flush.
pub async fn write_body(
    sink: &mut dyn ResponseSink,
    status: u16,
    mut headers: HeaderMap,
    content_type: &str,
    body: Bytes,
) -> Result<(), SinkError> {
    if let Ok(v) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, v);
    }
    sink.head(status, headers).await?;
    sink.write(body).await?;
    sink.flush().await
}

pub async fn write_json(
    sink: &mut dyn ResponseSink,
    status: u16,
    headers: HeaderMap,
    body: &Value,
) -> Result<(), SinkError> {
    let bytes = serde_json::to_vec(body).map_err(|e| SinkError::Io(e.to_string()))?;
    write_body(sink, status, headers, "application/json", Bytes::from(bytes)).await
}

/// In-memory sink for tests and buffered callers
#[derive(Debug, Default)]
pub struct BufferSink {
    pub status: Option<u16>,
    pub headers: HeaderMap,
    /// Chunks in write order
    pub chunks: Vec<Bytes>,
    pub flushes: usize,
    /// Fail every write after this many successful ones
    pub fail_after: Option<usize>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Self::default()
        }
    }

    pub fn body(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body()).ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_untouched(&self) -> bool {
        self.status.is_none() && self.chunks.is_empty()
    }
}

#[async_trait]
impl ResponseSink for BufferSink {
    async fn head(&mut self, status: u16, headers: HeaderMap) -> Result<(), SinkError> {
        if self.status.is_some() {
            return Err(SinkError::HeadAlreadySent);
        }
        self.status = Some(status);
        self.headers = headers;
        Ok(())
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.status.is_none() {
            self.status = Some(200);
        }
        if self.fail_after.is_some_and(|n| self.chunks.len() >= n) {
            return Err(SinkError::Closed);
        }
        self.chunks.push(chunk);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.flushes += 1;
        Ok(())
    }

    fn head_sent(&self) -> bool {
        self.status.is_some()
    }
}

/// Status line and headers delivered to the HTTP layer
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: HeaderMap,
}

/// Sink bridging the forward task to an HTTP response body
pub struct ChannelSink {
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<Bytes>,
}

/// Receiving half handed to the HTTP layer
pub struct ChannelSinkReceiver {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Bytes>,
}

pub fn channel_sink(capacity: usize) -> (ChannelSink, ChannelSinkReceiver) {
    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(capacity.max(1));
    (
        ChannelSink {
            head_tx: Some(head_tx),
            body_tx,
        },
        ChannelSinkReceiver {
            head: head_rx,
            body: body_rx,
        },
    )
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn head(&mut self, status: u16, headers: HeaderMap) -> Result<(), SinkError> {
        let tx = self.head_tx.take().ok_or(SinkError::HeadAlreadySent)?;
        tx.send(ResponseHead { status, headers })
            .map_err(|_| SinkError::Closed)
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
        if self.head_tx.is_some() {
            self.head(200, HeaderMap::new()).await?;
        }
        self.body_tx.send(chunk).await.map_err(|_| SinkError::Closed)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        // Chunks reach the HTTP body as soon as they are sent
        if self.body_tx.is_closed() {
            return Err(SinkError::Closed);
        }
        Ok(())
    }

    fn head_sent(&self) -> bool {
        self.head_tx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_buffer_sink_records_everything() {
        let mut sink = BufferSink::new();
        write_json(&mut sink, 400, HeaderMap::new(), &json!({"ok": false}))
            .await
            .unwrap();

        assert_eq!(sink.status, Some(400));
        assert_eq!(sink.header("content-type"), Some("application/json"));
        assert_eq!(sink.json().unwrap(), json!({"ok": false}));
        assert_eq!(sink.flushes, 1);
        assert_eq!(
            sink.head(200, HeaderMap::new()).await,
            Err(SinkError::HeadAlreadySent)
        );
    }

    #[tokio::test]
    async fn test_buffer_sink_fail_after() {
        let mut sink = BufferSink::failing_after(1);
        sink.write(Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(
            sink.write(Bytes::from_static(b"b")).await,
            Err(SinkError::Closed)
        );
        assert_eq!(sink.body_string(), "a");
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_head_then_body() {
        let (mut sink, mut rx) = channel_sink(4);
        sink.head(201, header_pairs(&[("x-request-id", "req-1")]))
            .await
            .unwrap();
        sink.write(Bytes::from_static(b"hello")).await.unwrap();
        sink.flush().await.unwrap();

        let head = rx.head.await.unwrap();
        assert_eq!(head.status, 201);
        assert_eq!(head.headers.get("x-request-id").unwrap(), "req-1");
        assert_eq!(rx.body.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_channel_sink_detects_disconnect() {
        let (mut sink, rx) = channel_sink(1);
        drop(rx);
        assert!(sink.write(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_sink_without_head_closes_receiver() {
        let (sink, rx) = channel_sink(1);
        drop(sink);
        assert!(rx.head.await.is_err());
    }
}
