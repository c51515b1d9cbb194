// Streaming relay
//
// A reader task splits the upstream body into lines and feeds a bounded
// channel; the relay loop waits on {next line, idle deadline, cancellation},
// runs each line through the transcoder and writes + flushes the output.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::proxy::common::TokenUsage;
use crate::proxy::mappers::StreamTranscoder;
use crate::proxy::sink::ResponseSink;
use crate::proxy::upstream::BodyStream;

/// Lines buffered between the reader task and the relay loop
pub const LINE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ResponseTooLarge,
    StreamReadError,
    StreamTimeout,
    WriteFailed,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ResponseTooLarge => "response_too_large",
            AbortReason::StreamReadError => "stream_read_error",
            AbortReason::StreamTimeout => "stream_timeout",
            AbortReason::WriteFailed => "write_failed",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relay guard fired; carries whatever usage had accumulated
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream aborted: {reason}")]
pub struct StreamAbort {
    pub reason: AbortReason,
    pub usage: TokenUsage,
    pub first_token_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Aborted(#[from] StreamAbort),
    #[error("client canceled the stream")]
    Canceled,
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// `None` disables the idle guard
    pub idle_timeout: Option<Duration>,
    pub max_line_size: usize,
    pub trace_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOutcome {
    pub usage: TokenUsage,
    pub first_token_ms: Option<u64>,
}

/// Render the single SSE error frame written on abort
pub fn error_event(reason: AbortReason) -> Bytes {
    let data = json!({ "error": reason.as_str() });
    Bytes::from(format!("event: error\ndata: {}\n\n", data))
}

enum ReaderEvent {
    Line(String),
    Failed(AbortReason, String),
}

/// Split the body into lines without the trailing `\n` / `\r\n`.
async fn read_lines(mut body: BodyStream, max_line_size: usize, tx: mpsc::Sender<ReaderEvent>) {
    let mut buf = BytesMut::new();
    // Bytes of `buf` already searched for a newline
    let mut scanned = 0;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(ReaderEvent::Failed(AbortReason::StreamReadError, e.to_string()))
                    .await;
                return;
            }
        };
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf[scanned..].iter().position(|b| *b == b'\n') {
            let line = buf.split_to(scanned + pos + 1);
            scanned = 0;
            let line = trim_line_end(&line);
            if line.len() > max_line_size {
                let _ = tx.send(too_large(line.len(), max_line_size)).await;
                return;
            }
            let text = String::from_utf8_lossy(line).into_owned();
            if tx.send(ReaderEvent::Line(text)).await.is_err() {
                return;
            }
        }

        // A partial line already over the limit will never fit
        if buf.len() > max_line_size {
            let _ = tx.send(too_large(buf.len(), max_line_size)).await;
            return;
        }
        scanned = buf.len();
    }

    if !buf.is_empty() {
        let text = String::from_utf8_lossy(trim_line_end(&buf)).into_owned();
        let _ = tx.send(ReaderEvent::Line(text)).await;
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn too_large(len: usize, max: usize) -> ReaderEvent {
    ReaderEvent::Failed(
        AbortReason::ResponseTooLarge,
        format!("line of {} bytes exceeds limit {}", len, max),
    )
}

async fn idle_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

struct Relay<'t, 's, 'o> {
    transcoder: &'t mut dyn StreamTranscoder,
    sink: &'s mut dyn ResponseSink,
    started: Instant,
    first_token_ms: Option<u64>,
    error_sent: bool,
    trace_id: &'o str,
}

impl Relay<'_, '_, '_> {
    async fn emit(&mut self, data: Bytes, is_content: bool) -> Result<(), AbortReason> {
        if data.is_empty() {
            return Ok(());
        }
        self.sink
            .write(data)
            .await
            .map_err(|_| AbortReason::WriteFailed)?;
        self.sink.flush().await.map_err(|_| AbortReason::WriteFailed)?;

        if is_content && self.first_token_ms.is_none() {
            self.first_token_ms = Some(self.started.elapsed().as_millis() as u64);
        }
        Ok(())
    }

    /// Close the transcoder, write the one error frame, report partial usage.
    async fn abort(&mut self, reason: AbortReason, detail: &str) -> RelayError {
        tracing::warn!(
            "[Relay] trace_id={} stream aborted: {} {}",
            self.trace_id,
            reason,
            detail
        );
        let (_, usage) = self.transcoder.finish();

        if !self.error_sent {
            self.error_sent = true;
            if self.sink.write(error_event(reason)).await.is_ok() {
                let _ = self.sink.flush().await;
            }
        }

        RelayError::Aborted(StreamAbort {
            reason,
            usage,
            first_token_ms: self.first_token_ms,
        })
    }
}

/// Drive `body` through `transcoder` into `sink` until EOF, abort or cancel.
///
/// The response head must already be written. `started` is the call start
/// used for first-token latency.
pub async fn relay_stream(
    body: BodyStream,
    transcoder: &mut dyn StreamTranscoder,
    sink: &mut dyn ResponseSink,
    options: &RelayOptions,
    cancel: &CancellationToken,
    started: Instant,
) -> Result<RelayOutcome, RelayError> {
    let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let reader = tokio::spawn(read_lines(body, options.max_line_size, tx));
    // Dropping the reader drops the upstream body
    let _reader_guard = AbortOnDrop(reader);

    let mut relay = Relay {
        transcoder,
        sink,
        started,
        first_token_ms: None,
        error_sent: false,
        trace_id: &options.trace_id,
    };
    let mut deadline = options.idle_timeout.map(|d| Instant::now() + d);

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!("[Relay] trace_id={} client canceled", options.trace_id);
                return Err(RelayError::Canceled);
            }
            event = rx.recv() => event,
            _ = idle_deadline(deadline) => {
                let detail = format!("no data for {:?}", options.idle_timeout.unwrap_or_default());
                return Err(relay.abort(AbortReason::StreamTimeout, &detail).await);
            }
        };

        match event {
            Some(ReaderEvent::Line(line)) => {
                deadline = options.idle_timeout.map(|d| Instant::now() + d);
                let out = relay.transcoder.process_line(&line);
                if let Err(reason) = relay.emit(out.data, out.is_content).await {
                    return Err(relay.abort(reason, "client write failed").await);
                }
            }
            Some(ReaderEvent::Failed(reason, detail)) => {
                return Err(relay.abort(reason, &detail).await);
            }
            None => break,
        }
    }

    let (tail, usage) = relay.transcoder.finish();
    if let Err(reason) = relay.emit(tail, true).await {
        return Err(relay.abort(reason, "client write failed at stream end").await);
    }

    tracing::debug!(
        "[Relay] trace_id={} stream complete in: {}, out: {}, first_token_ms: {:?}",
        options.trace_id,
        usage.input_tokens,
        usage.output_tokens,
        relay.first_token_ms
    );
    Ok(RelayOutcome {
        usage,
        first_token_ms: relay.first_token_ms,
    })
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::gemini::GeminiStreamProcessor;
    use crate::proxy::sink::BufferSink;
    use crate::proxy::upstream::UpstreamError;

    fn options(idle_secs: Option<u64>, max_line_size: usize) -> RelayOptions {
        RelayOptions {
            idle_timeout: idle_secs.map(Duration::from_secs),
            max_line_size,
            trace_id: "test".to_string(),
        }
    }

    fn body_of(chunks: Vec<&'static str>) -> BodyStream {
        Box::pin(futures::stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, UpstreamError>(Bytes::from_static(c.as_bytes()))),
        ))
    }

    fn error_frames(sink: &BufferSink) -> usize {
        sink.body_string().matches("event: error").count()
    }

    #[tokio::test]
    async fn test_relays_lines_split_across_chunks() {
        let body = body_of(vec![
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"te",
            "xt\":\"hi\"}]}}],\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":1}}}\r\n",
            "\r\n",
        ]);
        let mut transcoder = GeminiStreamProcessor::default();
        let mut sink = BufferSink::new();

        let outcome = relay_stream(
            body,
            &mut transcoder,
            &mut sink,
            &options(Some(5), 1024),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap();

        let out = sink.body_string();
        assert!(out.starts_with("data: {\"candidates\""));
        assert!(!out.contains("\"response\""));
        assert_eq!(outcome.usage.input_tokens, 3);
        assert_eq!(outcome.usage.output_tokens, 1);
        assert!(outcome.first_token_ms.is_some());
        // One flush per write
        assert_eq!(sink.flushes, sink.chunks.len());
    }

    #[tokio::test]
    async fn test_line_fed_byte_by_byte() {
        let payload = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"slow\"}]}}]}\n: ping\n";
        let body: BodyStream = Box::pin(futures::stream::iter(
            payload
                .as_bytes()
                .iter()
                .map(|b| Ok::<_, UpstreamError>(Bytes::copy_from_slice(&[*b])))
                .collect::<Vec<_>>(),
        ));
        let mut transcoder = GeminiStreamProcessor::default();
        let mut sink = BufferSink::new();

        relay_stream(
            body,
            &mut transcoder,
            &mut sink,
            &options(None, 1024),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap();

        let out = sink.body_string();
        assert!(out.contains("\"text\":\"slow\""));
        assert!(out.ends_with(": ping\n"));
        assert_eq!(out.matches("candidates").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_writes_single_error() {
        let first = futures::stream::iter(vec![Ok::<_, UpstreamError>(Bytes::from_static(
            b"data: {\"candidates\":[]}\n",
        ))]);
        let body: BodyStream = Box::pin(first.chain(futures::stream::pending()));
        let mut transcoder = GeminiStreamProcessor::default();
        let mut sink = BufferSink::new();

        let err = relay_stream(
            body,
            &mut transcoder,
            &mut sink,
            &options(Some(2), 1024),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap_err();

        match err {
            RelayError::Aborted(abort) => assert_eq!(abort.reason, AbortReason::StreamTimeout),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(error_frames(&sink), 1);
        assert!(sink
            .body_string()
            .ends_with("event: error\ndata: {\"error\":\"stream_timeout\"}\n\n"));
    }

    #[tokio::test]
    async fn test_oversized_line_aborts() {
        let body = body_of(vec!["data: 0123456789abcdef\n"]);
        let mut transcoder = GeminiStreamProcessor::default();
        let mut sink = BufferSink::new();

        let err = relay_stream(
            body,
            &mut transcoder,
            &mut sink,
            &options(None, 8),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            RelayError::Aborted(StreamAbort { reason: AbortReason::ResponseTooLarge, .. })
        ));
        assert_eq!(sink.body_string(), "event: error\ndata: {\"error\":\"response_too_large\"}\n\n");
    }

    #[tokio::test]
    async fn test_read_error_aborts() {
        let body: BodyStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {}\n")),
            Err(UpstreamError::Body("reset".into())),
        ]));
        let mut transcoder = GeminiStreamProcessor::default();
        let mut sink = BufferSink::new();

        let err = relay_stream(
            body,
            &mut transcoder,
            &mut sink,
            &options(None, 1024),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("stream_read_error"));
        assert_eq!(error_frames(&sink), 1);
    }

    #[tokio::test]
    async fn test_write_failure_reports_partial_usage() {
        let body = body_of(vec![
            "data: {\"usageMetadata\":{\"promptTokenCount\":7,\"candidatesTokenCount\":2}}\n",
            "data: {\"candidates\":[]}\n",
        ]);
        let mut transcoder = GeminiStreamProcessor::default();
        let mut sink = BufferSink::failing_after(1);

        let err = relay_stream(
            body,
            &mut transcoder,
            &mut sink,
            &options(None, 1024),
            &CancellationToken::new(),
            Instant::now(),
        )
        .await
        .unwrap_err();

        let RelayError::Aborted(abort) = err else {
            panic!("expected abort");
        };
        assert_eq!(abort.reason, AbortReason::WriteFailed);
        assert_eq!(abort.usage.input_tokens, 7);
        assert_eq!(sink.chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_writes() {
        let body: BodyStream = Box::pin(futures::stream::pending());
        let mut transcoder = GeminiStreamProcessor::default();
        let mut sink = BufferSink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = relay_stream(
            body,
            &mut transcoder,
            &mut sink,
            &options(Some(1), 1024),
            &cancel,
            Instant::now(),
        )
        .await
        .unwrap_err();

        assert_eq!(err, RelayError::Canceled);
        assert!(sink.chunks.is_empty());
    }

    #[test]
    fn test_error_event_shape() {
        assert_eq!(
            error_event(AbortReason::WriteFailed),
            Bytes::from_static(b"event: error\ndata: {\"error\":\"write_failed\"}\n\n")
        );
    }
}
