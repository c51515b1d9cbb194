// Signature degradation for retries after a thought-signature rejection
//
// Stage 1 removes thinking; stage 2 additionally flattens tool blocks into
// text. Both return whether the request changed, so a no-op stage can be
// skipped by the caller.

use serde_json::Value;

use super::models::*;

const CONTENT_REMOVED: &str = "(content removed)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradeStage {
    /// Drop `thinking`, turn thinking blocks into text, drop redacted thinking
    ThinkingOnly,
    /// Stage 1 plus `tool_use` / `tool_result` rewritten as descriptive text
    ThinkingAndTools,
}

impl DegradeStage {
    pub const LADDER: [DegradeStage; 2] = [DegradeStage::ThinkingOnly, DegradeStage::ThinkingAndTools];

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradeStage::ThinkingOnly => "thinking_only",
            DegradeStage::ThinkingAndTools => "thinking_and_tools",
        }
    }

    /// Apply this stage in place. Returns true when anything changed.
    pub fn apply(&self, req: &mut ClaudeRequest) -> bool {
        let convert_tools = *self == DegradeStage::ThinkingAndTools;
        let mut changed = req.thinking.take().is_some();

        for msg in req.messages.iter_mut() {
            let MessageContent::Array(blocks) = &mut msg.content else {
                continue;
            };
            if let Some(rewritten) = degrade_blocks(blocks, convert_tools) {
                *blocks = rewritten;
                changed = true;
            }
        }

        changed
    }
}

fn text_block(text: String) -> ContentBlock {
    ContentBlock::Text { text }
}

/// Rewrite one message's blocks; `None` when nothing needed rewriting.
fn degrade_blocks(blocks: &[ContentBlock], convert_tools: bool) -> Option<Vec<ContentBlock>> {
    let mut modified = false;
    let mut out = Vec::with_capacity(blocks.len());

    for block in blocks {
        match block {
            ContentBlock::Thinking { thinking, .. } => {
                if !thinking.is_empty() {
                    out.push(text_block(thinking.clone()));
                }
                modified = true;
            }
            ContentBlock::RedactedThinking { .. } => {
                modified = true;
            }
            ContentBlock::ToolUse { id, name, input, .. } if convert_tools => {
                out.push(text_block(describe_tool_use(id, name, input)));
                modified = true;
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } if convert_tools => {
                out.push(text_block(describe_tool_result(
                    tool_use_id,
                    content,
                    is_error.unwrap_or(false),
                )));
                modified = true;
            }
            other => out.push(other.clone()),
        }
    }

    if !modified {
        return None;
    }

    // Upstream rejects empty content arrays
    if out.is_empty() {
        out.push(text_block(CONTENT_REMOVED.to_string()));
    }
    Some(out)
}

fn describe_tool_use(id: &str, name: &str, input: &Value) -> String {
    let mut text = String::from("(tool_use)");
    if !name.is_empty() {
        text.push_str(&format!(" name={}", name));
    }
    if !id.is_empty() {
        text.push_str(&format!(" id={}", id));
    }
    if !input.is_null() {
        text.push_str(&format!(" input={}", input));
    }
    text
}

fn describe_tool_result(tool_use_id: &str, content: &Value, is_error: bool) -> String {
    let mut text = String::from("(tool_result)");
    if !tool_use_id.is_empty() {
        text.push_str(&format!(" tool_use_id={}", tool_use_id));
    }
    if is_error {
        text.push_str(" is_error=true");
    }
    if !content.is_null() {
        text.push('\n');
        text.push_str(&content.to_string());
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(messages: Value, thinking: bool) -> ClaudeRequest {
        let mut body = json!({"model": "claude-sonnet-4-5", "messages": messages});
        if thinking {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": 1024});
        }
        serde_json::from_value(body).unwrap()
    }

    fn blocks(req: &ClaudeRequest, idx: usize) -> &[ContentBlock] {
        match &req.messages[idx].content {
            MessageContent::Array(b) => b,
            other => panic!("expected blocks, got {:?}", other),
        }
    }

    #[test]
    fn test_stage_one_converts_thinking() {
        let mut req = request(
            json!([
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "plan", "signature": "bad"},
                    {"type": "redacted_thinking", "data": "xxx"},
                    {"type": "text", "text": "answer"},
                    {"type": "tool_use", "id": "t1", "name": "ls", "input": {}}
                ]}
            ]),
            true,
        );

        assert!(DegradeStage::ThinkingOnly.apply(&mut req));
        assert!(req.thinking.is_none());

        let out = blocks(&req, 1);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], text_block("plan".to_string()));
        assert_eq!(out[1], text_block("answer".to_string()));
        assert!(matches!(out[2], ContentBlock::ToolUse { .. }));
    }

    #[test]
    fn test_emptied_message_gets_placeholder() {
        let mut req = request(
            json!([{"role": "assistant", "content": [
                {"type": "redacted_thinking", "data": "xxx"},
                {"type": "thinking", "thinking": ""}
            ]}]),
            false,
        );
        assert!(DegradeStage::ThinkingOnly.apply(&mut req));
        assert_eq!(blocks(&req, 0), &[text_block(CONTENT_REMOVED.to_string())]);
    }

    #[test]
    fn test_stage_is_noop_without_thinking() {
        let mut req = request(
            json!([
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [{"type": "text", "text": "hello"}]}
            ]),
            false,
        );
        let before = serde_json::to_value(&req).unwrap();
        assert!(!DegradeStage::ThinkingOnly.apply(&mut req));
        assert!(!DegradeStage::ThinkingAndTools.apply(&mut req));
        assert_eq!(serde_json::to_value(&req).unwrap(), before);
    }

    #[test]
    fn test_stage_two_flattens_tools() {
        let mut req = request(
            json!([
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "ls", "input": {"path": "/"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "a.txt", "is_error": true}
                ]}
            ]),
            false,
        );

        assert!(!DegradeStage::ThinkingOnly.apply(&mut req.clone()));
        assert!(DegradeStage::ThinkingAndTools.apply(&mut req));

        assert_eq!(
            blocks(&req, 0),
            &[text_block(r#"(tool_use) name=ls id=t1 input={"path":"/"}"#.to_string())]
        );
        assert_eq!(
            blocks(&req, 1),
            &[text_block("(tool_result) tool_use_id=t1 is_error=true\n\"a.txt\"".to_string())]
        );
    }

    #[test]
    fn test_ladder_order() {
        assert_eq!(DegradeStage::LADDER[0], DegradeStage::ThinkingOnly);
        assert_eq!(DegradeStage::LADDER[1].as_str(), "thinking_and_tools");
    }
}
