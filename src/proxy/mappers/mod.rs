// Mappers 模块 - 协议转换器
// 负责在 Anthropic/Gemini 格式与 v1internal 信封之间进行转换

pub mod claude;
pub mod gemini;

use bytes::Bytes;

use crate::proxy::common::TokenUsage;

/// Output of a transcoder for one upstream line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodedLine {
    pub data: Bytes,
    /// Whether this output carries model content (drives first-token latency)
    pub is_content: bool,
}

impl TranscodedLine {
    pub fn content(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let is_content = !data.is_empty();
        Self { data, is_content }
    }

    pub fn framing(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_content: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-stream state machine converting upstream SSE lines into client SSE.
///
/// One instance per stream. `finish` returns the closing events and the
/// final usage; calling it again yields no further events.
pub trait StreamTranscoder: Send {
    fn process_line(&mut self, line: &str) -> TranscodedLine;

    fn finish(&mut self) -> (Bytes, TokenUsage);

    /// Usage accumulated so far
    fn usage(&self) -> TokenUsage;
}
