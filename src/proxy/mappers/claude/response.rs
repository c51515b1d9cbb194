// Gemini → Claude response transformation (non-streaming)

use serde_json::Value;

use super::models::*;
use crate::proxy::common::TokenUsage;
use crate::proxy::mappers::gemini::wrapper::unwrap_response;

/// Convert Gemini UsageMetadata to Claude Usage format
pub fn to_claude_usage(usage_metadata: &UsageMetadata) -> Usage {
    Usage::from(TokenUsage::from(usage_metadata))
}

/// Non-streaming response processor
#[derive(Default)]
pub struct NonStreamingProcessor {
    content_blocks: Vec<ContentBlock>,
    text_builder: String,
    thinking_builder: String,
    thinking_signature: Option<String>,
    has_tool_call: bool,
}

impl NonStreamingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a Gemini response and convert to Claude response
    pub fn process(mut self, gemini_response: &GeminiResponse, original_model: &str) -> ClaudeResponse {
        let first_candidate = gemini_response.candidates.as_ref().and_then(|c| c.first());

        if let Some(content) = first_candidate.and_then(|c| c.content.as_ref()) {
            for part in &content.parts {
                self.process_part(part);
            }
        }

        self.flush_thinking();
        self.flush_text();

        let finish_reason = first_candidate.and_then(|c| c.finish_reason.as_deref());
        let stop_reason = if self.has_tool_call {
            "tool_use"
        } else if finish_reason == Some("MAX_TOKENS") {
            "max_tokens"
        } else {
            "end_turn"
        };

        let usage = gemini_response
            .usage_metadata
            .as_ref()
            .map(to_claude_usage)
            .unwrap_or_default();

        ClaudeResponse {
            id: gemini_response
                .response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            type_: "message".to_string(),
            role: "assistant".to_string(),
            model: original_model.to_string(),
            content: self.content_blocks,
            stop_reason: stop_reason.to_string(),
            stop_sequence: None,
            usage,
        }
    }

    /// Process a single Gemini part
    fn process_part(&mut self, part: &GeminiPart) {
        let signature = part.thought_signature.clone();

        if let Some(fc) = &part.function_call {
            self.flush_thinking();
            self.flush_text();
            self.has_tool_call = true;

            self.content_blocks.push(ContentBlock::ToolUse {
                id: fc
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple())),
                name: fc.name.clone(),
                input: fc.args.clone().unwrap_or_else(|| serde_json::json!({})),
                signature,
                cache_control: None,
            });
            return;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                self.flush_text();
                self.thinking_builder.push_str(text);
                if signature.is_some() {
                    self.thinking_signature = signature;
                }
            } else if !text.is_empty() {
                self.flush_thinking();
                self.text_builder.push_str(text);
            }
        }

        if let Some(img) = &part.inline_data {
            self.flush_thinking();
            if !img.data.is_empty() {
                self.text_builder
                    .push_str(&format!("![image](data:{};base64,{})", img.mime_type, img.data));
                self.flush_text();
            }
        }
    }

    fn flush_text(&mut self) {
        if self.text_builder.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text_builder);
        self.content_blocks.push(ContentBlock::Text { text });
    }

    fn flush_thinking(&mut self) {
        if self.thinking_builder.is_empty() && self.thinking_signature.is_none() {
            return;
        }
        self.content_blocks.push(ContentBlock::Thinking {
            thinking: std::mem::take(&mut self.thinking_builder),
            signature: self.thinking_signature.take(),
            cache_control: None,
        });
    }
}

/// Transform an upstream body into a Claude response (non-streaming).
///
/// The envelope is unwrapped when present. The reported model is the one the
/// client asked for. Fails only when the body is not a Gemini response.
pub fn transform_response(
    body: &[u8],
    original_model: &str,
) -> Result<(ClaudeResponse, TokenUsage), String> {
    let outer: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid upstream json: {}", e))?;
    let inner = unwrap_response(&outer);
    let gemini_response: GeminiResponse = serde_json::from_value(inner)
        .map_err(|e| format!("unexpected upstream response shape: {}", e))?;

    let usage = gemini_response
        .usage_metadata
        .as_ref()
        .map(TokenUsage::from)
        .unwrap_or_default();

    let response = NonStreamingProcessor::new().process(&gemini_response, original_model);
    Ok((response, usage))
}
