// Gemini streaming passthrough (v1internal SSE → Gemini SSE)

use bytes::Bytes;
use serde_json::Value;

use super::wrapper::unwrap_response;
use crate::proxy::common::usage::extract_usage;
use crate::proxy::common::TokenUsage;
use crate::proxy::mappers::{StreamTranscoder, TranscodedLine};

/// Unwraps each `data:` event and forwards everything else verbatim.
///
/// The most recent `usageMetadata` seen wins.
#[derive(Debug, Default)]
pub struct GeminiStreamProcessor {
    usage: TokenUsage,
}

impl GeminiStreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamTranscoder for GeminiStreamProcessor {
    fn process_line(&mut self, line: &str) -> TranscodedLine {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let Some(rest) = trimmed.strip_prefix("data:") else {
            return TranscodedLine::framing(format!("{}\n", line));
        };

        let payload = rest.trim();
        if payload.is_empty() || payload == "[DONE]" {
            return TranscodedLine::framing(format!("{}\n", line));
        }

        let inner = match serde_json::from_str::<Value>(payload) {
            Ok(parsed) => {
                let inner = unwrap_response(&parsed);
                if let Some(usage) = extract_usage(&inner) {
                    self.usage = usage;
                }
                inner.to_string()
            }
            Err(_) => payload.to_string(),
        };

        TranscodedLine::content(Bytes::from(format!("data: {}\n\n", inner)))
    }

    fn finish(&mut self) -> (Bytes, TokenUsage) {
        (Bytes::new(), self.usage)
    }

    fn usage(&self) -> TokenUsage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(line: &TranscodedLine) -> String {
        String::from_utf8(line.data.to_vec()).unwrap()
    }

    #[test]
    fn test_data_line_is_unwrapped() {
        let mut p = GeminiStreamProcessor::new();
        let out = p.process_line(
            r#"data: {"response":{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}}"#,
        );
        assert!(out.is_content);
        let s = text(&out);
        assert!(s.starts_with("data: {\"candidates\""));
        assert!(s.ends_with("\n\n"));
        assert!(!s.contains("\"response\""));
    }

    #[test]
    fn test_framing_lines_pass_through() {
        let mut p = GeminiStreamProcessor::new();
        assert_eq!(text(&p.process_line(": ping")), ": ping\n");
        assert_eq!(text(&p.process_line("")), "\n");

        let done = p.process_line("data: [DONE]");
        assert_eq!(text(&done), "data: [DONE]\n");
        assert!(!done.is_content);
    }

    #[test]
    fn test_latest_usage_wins() {
        let mut p = GeminiStreamProcessor::new();
        p.process_line(r#"data: {"response":{"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":1}}}"#);
        p.process_line(r#"data: {"response":{"candidates":[]}}"#);
        p.process_line(r#"data: {"response":{"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":9}}}"#);

        let (tail, usage) = p.finish();
        assert!(tail.is_empty());
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 9);
    }

    #[test]
    fn test_non_json_payload_is_forwarded() {
        let mut p = GeminiStreamProcessor::new();
        assert_eq!(text(&p.process_line("data: oops")), "data: oops\n\n");
        assert!(p.usage().is_empty());
    }
}
