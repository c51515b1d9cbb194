// Claude streaming response transformation (v1internal SSE → Claude SSE)

use super::models::*;
use crate::proxy::common::TokenUsage;
use crate::proxy::mappers::{StreamTranscoder, TranscodedLine};
use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};

const MESSAGE_STOP: &str = "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";

/// Block type in the streaming state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    Function,
}

/// Streaming state machine for Claude SSE conversion
pub struct StreamingState {
    block_type: BlockType,
    pub block_index: usize,
    pub message_start_sent: bool,
    pub message_stop_sent: bool,
    used_tool: bool,
    pending_signature: Option<String>,
    model: String,
    usage: TokenUsage,
}

impl StreamingState {
    pub fn new(model: &str) -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            pending_signature: None,
            model: model.to_string(),
            usage: TokenUsage::default(),
        }
    }

    /// Emit an SSE event
    pub fn emit(&self, event_type: &str, data: Value) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        ))
    }

    /// Emit message_start event
    pub fn emit_message_start(&mut self, raw_json: &Value) -> Bytes {
        if self.message_start_sent {
            return Bytes::new();
        }

        let message = json!({
            "id": raw_json.get("responseId")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": self.model,
            "stop_reason": null,
            "stop_sequence": null,
            "usage": Usage::from(self.usage),
        });

        let result = self.emit(
            "message_start",
            json!({ "type": "message_start", "message": message }),
        );
        self.message_start_sent = true;
        result
    }

    /// Start a new content block
    pub fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut chunks = self.end_block();

        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));

        self.block_type = block_type;
        chunks
    }

    /// End the current content block
    pub fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }

        let mut chunks = Vec::new();

        if self.block_type == BlockType::Thinking {
            if let Some(signature) = self.pending_signature.take() {
                chunks.push(self.emit_delta("signature_delta", json!({ "signature": signature })));
            }
        }

        chunks.push(self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        ));

        self.block_index += 1;
        self.block_type = BlockType::None;
        chunks
    }

    /// Emit a delta event
    pub fn emit_delta(&self, delta_type: &str, delta_content: Value) -> Bytes {
        let mut delta = json!({ "type": delta_type });
        if let Value::Object(map) = delta_content {
            for (k, v) in map {
                delta[k] = v;
            }
        }

        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    /// Emit finish events (message_delta + message_stop), once per stream
    pub fn emit_finish(&mut self, finish_reason: Option<&str>) -> Vec<Bytes> {
        if self.message_stop_sent {
            return vec![];
        }

        let mut chunks = self.end_block();

        let stop_reason = if self.used_tool {
            "tool_use"
        } else if finish_reason == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };

        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": Usage::from(self.usage)
            }),
        ));

        chunks.push(Bytes::from_static(MESSAGE_STOP.as_bytes()));
        self.message_stop_sent = true;
        chunks
    }

    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.usage = usage;
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn mark_tool_used(&mut self) {
        self.used_tool = true;
    }

    pub fn current_block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn store_signature(&mut self, signature: Option<String>) {
        if signature.is_some() {
            self.pending_signature = signature;
        }
    }
}

/// Part processor - handles individual Gemini parts in streaming mode
pub struct PartProcessor<'a> {
    state: &'a mut StreamingState,
}

impl<'a> PartProcessor<'a> {
    pub fn new(state: &'a mut StreamingState) -> Self {
        Self { state }
    }

    /// Process a single Gemini part and return Claude SSE chunks
    pub fn process(&mut self, part: &GeminiPart) -> Vec<Bytes> {
        let signature = part.thought_signature.clone();

        if let Some(fc) = &part.function_call {
            return self.process_function_call(fc, signature);
        }

        let mut chunks = Vec::new();
        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                chunks.extend(self.process_thinking(text, signature));
            } else {
                chunks.extend(self.process_text(text, signature));
            }
        }

        if let Some(img) = &part.inline_data {
            if !img.data.is_empty() {
                let markdown_img = format!("![image](data:{};base64,{})", img.mime_type, img.data);
                chunks.extend(self.process_text(&markdown_img, None));
            }
        }

        chunks
    }

    fn process_thinking(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        if self.state.current_block_type() != BlockType::Thinking {
            chunks.extend(self.state.start_block(
                BlockType::Thinking,
                json!({ "type": "thinking", "thinking": "" }),
            ));
        }

        if !text.is_empty() {
            chunks.push(
                self.state
                    .emit_delta("thinking_delta", json!({ "thinking": text })),
            );
        }

        self.state.store_signature(signature);
        chunks
    }

    fn process_text(&mut self, text: &str, signature: Option<String>) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if text.is_empty() {
            return chunks;
        }

        self.state.store_signature(signature);

        if self.state.current_block_type() != BlockType::Text {
            chunks.extend(
                self.state
                    .start_block(BlockType::Text, json!({ "type": "text", "text": "" })),
            );
        }

        chunks.push(self.state.emit_delta("text_delta", json!({ "text": text })));
        chunks
    }

    fn process_function_call(&mut self, fc: &FunctionCall, signature: Option<String>) -> Vec<Bytes> {
        self.state.mark_tool_used();

        let tool_id = fc
            .id
            .clone()
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));

        let mut tool_use = json!({
            "type": "tool_use",
            "id": tool_id,
            "name": fc.name,
            "input": {}
        });
        if let Some(sig) = &signature {
            tool_use["signature"] = json!(sig);
        }

        let mut chunks = self.state.start_block(BlockType::Function, tool_use);

        if let Some(args) = &fc.args {
            let json_str = serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string());
            chunks.push(
                self.state
                    .emit_delta("input_json_delta", json!({ "partial_json": json_str })),
            );
        }

        chunks.extend(self.state.end_block());
        chunks
    }
}

/// Gemini SSE → Claude SSE transcoder, one instance per stream
pub struct ClaudeStreamProcessor {
    state: StreamingState,
}

impl ClaudeStreamProcessor {
    /// `model` is reported to the client in `message_start`
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamingState::new(model),
        }
    }

    fn process_event(&mut self, data_str: &str) -> Vec<Bytes> {
        if data_str == "[DONE]" {
            return self.force_stop();
        }

        let Ok(json_value) = serde_json::from_str::<Value>(data_str) else {
            tracing::debug!("[Relay] Skipping non-JSON upstream event");
            return vec![];
        };

        let raw_json = json_value.get("response").unwrap_or(&json_value);

        if let Some(usage) = raw_json
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value::<UsageMetadata>(u.clone()).ok())
        {
            self.state.record_usage(TokenUsage::from(&usage));
        }

        let mut chunks = Vec::new();
        if !self.state.message_start_sent {
            chunks.push(self.state.emit_message_start(raw_json));
        }

        let candidate = raw_json.get("candidates").and_then(|c| c.get(0));

        if let Some(parts) = candidate
            .and_then(|cand| cand.pointer("/content/parts"))
            .and_then(|p| p.as_array())
        {
            for part_value in parts {
                if let Ok(part) = serde_json::from_value::<GeminiPart>(part_value.clone()) {
                    chunks.extend(PartProcessor::new(&mut self.state).process(&part));
                }
            }
        }

        if let Some(finish_reason) = candidate
            .and_then(|cand| cand.get("finishReason"))
            .and_then(|f| f.as_str())
        {
            chunks.extend(self.state.emit_finish(Some(finish_reason)));
        }

        chunks
    }

    /// Close the message if the upstream never did
    fn force_stop(&mut self) -> Vec<Bytes> {
        if self.state.message_stop_sent {
            return vec![];
        }
        let mut chunks = Vec::new();
        if !self.state.message_start_sent {
            chunks.push(self.state.emit_message_start(&Value::Null));
        }
        chunks.extend(self.state.emit_finish(None));
        chunks
    }
}

fn concat(chunks: Vec<Bytes>) -> Bytes {
    let mut buf = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}

impl StreamTranscoder for ClaudeStreamProcessor {
    fn process_line(&mut self, line: &str) -> TranscodedLine {
        let line = line.trim();
        // Heartbeats and comments pass through; blank separators are re-framed
        let Some(data_str) = line.strip_prefix("data:").map(str::trim) else {
            if line.is_empty() {
                return TranscodedLine::default();
            }
            return TranscodedLine::framing(format!("{}\n", line));
        };
        if data_str.is_empty() {
            return TranscodedLine::default();
        }
        TranscodedLine::content(concat(self.process_event(data_str)))
    }

    fn finish(&mut self) -> (Bytes, TokenUsage) {
        (concat(self.force_stop()), self.state.usage())
    }

    fn usage(&self) -> TokenUsage {
        self.state.usage()
    }
}
