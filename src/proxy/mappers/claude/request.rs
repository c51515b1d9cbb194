// Claude → v1internal request transformation

use super::models::*;
use crate::proxy::mappers::gemini::wrapper::build_envelope;
use crate::proxy::session_manager::SessionManager;
use serde_json::{json, Value};
use std::collections::HashMap;

const MAX_THINKING_BUDGET_GEMINI: i64 = 24576;
const MAX_TOOL_RESULT_CHARS: usize = 200_000;

/// Knobs applied while translating a Claude request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOptions {
    pub enable_identity_patch: bool,
    /// Text prepended to the system instruction when the patch is enabled
    pub identity_patch: String,
}

/// Build safety settings for Gemini API (all filters disabled for proxy compatibility)
fn build_safety_settings() -> Value {
    json!([
        { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "OFF" },
        { "category": "HARM_CATEGORY_CIVIC_INTEGRITY", "threshold": "OFF" },
    ])
}

/// Clean cache_control fields from messages (clients may send them back in history)
pub fn clean_cache_control_from_messages(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        if let MessageContent::Array(blocks) = &mut msg.content {
            for block in blocks.iter_mut() {
                match block {
                    ContentBlock::Thinking { cache_control, .. }
                    | ContentBlock::Image { cache_control, .. }
                    | ContentBlock::Document { cache_control, .. }
                    | ContentBlock::ToolUse { cache_control, .. } => {
                        *cache_control = None;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Merge consecutive same-role messages to satisfy Gemini's alternation requirement
pub fn merge_consecutive_messages(messages: &mut Vec<Message>) {
    if messages.len() <= 1 {
        return;
    }

    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());
    let mut messages_iter = std::mem::take(messages).into_iter();

    if let Some(mut current) = messages_iter.next() {
        for next in messages_iter {
            if current.role != next.role {
                merged.push(std::mem::replace(&mut current, next));
                continue;
            }
            match (&mut current.content, next.content) {
                (MessageContent::Array(cur), MessageContent::Array(nxt)) => {
                    cur.extend(nxt);
                }
                (MessageContent::Array(cur), MessageContent::String(nxt)) => {
                    cur.push(ContentBlock::Text { text: nxt });
                }
                (MessageContent::String(cur), MessageContent::String(nxt)) => {
                    *cur = format!("{}\n\n{}", cur, nxt);
                }
                (MessageContent::String(cur), MessageContent::Array(nxt)) => {
                    let mut new_blocks = vec![ContentBlock::Text { text: cur.clone() }];
                    new_blocks.extend(nxt);
                    current.content = MessageContent::Array(new_blocks);
                }
            }
        }
        merged.push(current);
    }

    *messages = merged;
}

/// Transform a Claude Messages request into a v1internal envelope.
///
/// The returned value is the serialized envelope with `request.sessionId`
/// set to the sticky session id of the conversation.
pub fn transform_claude_request(
    claude_req: &ClaudeRequest,
    project_id: &str,
    mapped_model: &str,
    opts: &TransformOptions,
) -> Result<Value, String> {
    let mut cleaned_req = claude_req.clone();
    merge_consecutive_messages(&mut cleaned_req.messages);
    clean_cache_control_from_messages(&mut cleaned_req.messages);
    let claude_req = &cleaned_req;

    let mapped_model_lower = mapped_model.to_lowercase();

    let thinking_type = claude_req.thinking.as_ref().map(|t| t.type_.as_str());
    let is_thinking_enabled = matches!(thinking_type, Some("enabled") | Some("adaptive"));
    let target_supports_thinking = mapped_model_lower.contains("-thinking")
        || mapped_model_lower.contains("gemini-2.0-pro")
        || mapped_model_lower.contains("gemini-3-pro");
    let actual_thinking = is_thinking_enabled && target_supports_thinking;

    let has_web_search = claude_req
        .tools
        .as_ref()
        .map(|tools| tools.iter().any(|t| t.is_web_search()))
        .unwrap_or(false);

    let mut tool_id_to_name: HashMap<String, String> = HashMap::new();

    let system_instruction = build_system_instruction(&claude_req.system, opts);
    let contents = build_contents(&claude_req.messages, &mut tool_id_to_name, actual_thinking);
    let tools = build_tools(&claude_req.tools);
    let generation_config = build_generation_config(claude_req, mapped_model, actual_thinking);

    let mut inner_request = json!({
        "contents": contents,
        "safetySettings": build_safety_settings(),
    });

    if let Some(sys_inst) = system_instruction {
        inner_request["systemInstruction"] = sys_inst;
    }

    if generation_config
        .as_object()
        .map(|o| !o.is_empty())
        .unwrap_or(false)
    {
        inner_request["generationConfig"] = generation_config;
    }

    if let Some(tools_val) = tools {
        inner_request["tools"] = tools_val;
        inner_request["toolConfig"] = json!({
            "functionCallingConfig": { "mode": "VALIDATED" }
        });
    }

    if has_web_search {
        match inner_request.get_mut("tools").and_then(|t| t.as_array_mut()) {
            Some(existing) => existing.push(json!({ "googleSearch": {} })),
            None => inner_request["tools"] = json!([{ "googleSearch": {} }]),
        }
    }

    let envelope = build_envelope(project_id, mapped_model, inner_request);
    let mut body =
        serde_json::to_value(envelope).map_err(|e| format!("failed to encode envelope: {}", e))?;

    let session_id = SessionManager::stable_session_id(&body);
    body["request"]["sessionId"] = json!(session_id);

    Ok(body)
}

/// Build system instruction from Claude system prompt plus the optional identity patch
fn build_system_instruction(system: &Option<SystemPrompt>, opts: &TransformOptions) -> Option<Value> {
    let mut parts = Vec::new();

    if opts.enable_identity_patch && !opts.identity_patch.trim().is_empty() {
        parts.push(json!({"text": opts.identity_patch}));
    }

    match system {
        Some(SystemPrompt::String(text)) if !text.is_empty() => {
            parts.push(json!({"text": text}));
        }
        Some(SystemPrompt::Array(blocks)) => {
            for block in blocks {
                if block.block_type == "text" && !block.text.is_empty() {
                    parts.push(json!({"text": block.text}));
                }
            }
        }
        _ => {}
    }

    if parts.is_empty() {
        return None;
    }

    Some(json!({
        "role": "user",
        "parts": parts
    }))
}

/// Build Gemini contents from Claude messages
fn build_contents(
    messages: &[Message],
    tool_id_to_name: &mut HashMap<String, String>,
    is_thinking_enabled: bool,
) -> Vec<Value> {
    let mut gemini_contents: Vec<Value> = Vec::new();

    for msg in messages {
        let role = match msg.role.as_str() {
            "assistant" => "model",
            other => other,
        };

        let parts = build_parts(&msg.content, role == "model", tool_id_to_name, is_thinking_enabled);
        if parts.is_empty() {
            continue;
        }

        // Gemini requires alternation
        if let Some(last) = gemini_contents.last_mut() {
            if last["role"].as_str() == Some(role) {
                if let Some(last_parts) = last["parts"].as_array_mut() {
                    last_parts.extend(parts);
                    continue;
                }
            }
        }

        gemini_contents.push(json!({
            "role": role,
            "parts": parts
        }));
    }

    gemini_contents
}

/// Build Gemini parts from Claude message content
fn build_parts(
    content: &MessageContent,
    is_assistant: bool,
    tool_id_to_name: &mut HashMap<String, String>,
    is_thinking_enabled: bool,
) -> Vec<Value> {
    let blocks = match content {
        MessageContent::String(text) => {
            return if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"text": text})]
            };
        }
        MessageContent::Array(blocks) => blocks,
    };

    let mut parts = Vec::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                if !text.is_empty() {
                    parts.push(json!({"text": text}));
                }
            }
            ContentBlock::Thinking {
                thinking, signature, ..
            } => {
                if thinking.is_empty() {
                    continue;
                }
                if !is_thinking_enabled {
                    // Downgrade to text when thinking is disabled
                    parts.push(json!({"text": thinking}));
                    continue;
                }
                let mut part = json!({ "text": thinking, "thought": true });
                if let Some(sig) = signature.as_deref().filter(|s| !s.is_empty()) {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            ContentBlock::RedactedThinking { data } => {
                parts.push(json!({ "text": format!("[Redacted Thinking: {}]", data) }));
            }
            ContentBlock::Image { source, .. } | ContentBlock::Document { source, .. } => {
                if source.source_type == "base64" {
                    parts.push(json!({
                        "inlineData": {
                            "mimeType": source.media_type,
                            "data": source.data
                        }
                    }));
                }
            }
            ContentBlock::ToolUse {
                id,
                name,
                input,
                signature,
                ..
            } => {
                if is_assistant {
                    tool_id_to_name.insert(id.clone(), name.clone());
                }
                let mut part = json!({
                    "functionCall": { "name": name, "args": input, "id": id }
                });
                if let Some(sig) = signature.as_deref().filter(|s| !s.is_empty()) {
                    part["thoughtSignature"] = json!(sig);
                }
                parts.push(part);
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let func_name = tool_id_to_name
                    .get(tool_use_id)
                    .cloned()
                    .unwrap_or_else(|| tool_use_id.clone());

                parts.push(json!({
                    "functionResponse": {
                        "name": func_name,
                        "response": {"result": tool_result_text(content, is_error.unwrap_or(false))},
                        "id": tool_use_id
                    }
                }));
            }
            // Server tool blocks are handled by Gemini natively
            ContentBlock::ServerToolUse { .. } | ContentBlock::WebSearchToolResult { .. } => {}
        }
    }

    parts
}

fn tool_result_text(content: &Value, is_error: bool) -> String {
    let merged = match content {
        Value::String(s) => s.clone(),
        Value::Array(arr) => arr
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    if merged.trim().is_empty() {
        return if is_error {
            "Tool execution failed with no output.".to_string()
        } else {
            "Command executed successfully.".to_string()
        };
    }

    if merged.chars().count() > MAX_TOOL_RESULT_CHARS {
        let mut truncated: String = merged.chars().take(MAX_TOOL_RESULT_CHARS).collect();
        truncated.push_str("\n...[truncated output]");
        return truncated;
    }

    merged
}

/// Build Gemini tools from Claude tool definitions
fn build_tools(tools: &Option<Vec<Tool>>) -> Option<Value> {
    let function_declarations: Vec<Value> = tools
        .as_deref()?
        .iter()
        .filter(|tool| !tool.is_web_search())
        .filter_map(|tool| {
            let name = tool.name.as_ref()?;
            let mut func_decl = json!({ "name": name });
            if let Some(desc) = &tool.description {
                func_decl["description"] = json!(desc);
            }
            func_decl["parameters"] = match &tool.input_schema {
                Some(schema) => {
                    let mut params = schema.clone();
                    enforce_uppercase_types(&mut params);
                    params
                }
                None => json!({ "type": "OBJECT", "properties": {} }),
            };
            Some(func_decl)
        })
        .collect();

    if function_declarations.is_empty() {
        return None;
    }

    Some(json!([{ "functionDeclarations": function_declarations }]))
}

/// Build generation config from Claude request parameters
fn build_generation_config(
    claude_req: &ClaudeRequest,
    mapped_model: &str,
    is_thinking_enabled: bool,
) -> Value {
    let mut config = json!({});

    if let Some(temp) = claude_req.temperature {
        config["temperature"] = json!(temp);
    }
    if let Some(top_p) = claude_req.top_p {
        config["topP"] = json!(top_p);
    }
    if let Some(top_k) = claude_req.top_k {
        config["topK"] = json!(top_k);
    }
    if let Some(max_tokens) = claude_req.max_tokens {
        config["maxOutputTokens"] = json!(max_tokens);
    }

    if is_thinking_enabled {
        let user_budget = claude_req
            .thinking
            .as_ref()
            .and_then(|t| t.budget_tokens)
            .map(i64::from)
            .unwrap_or(MAX_THINKING_BUDGET_GEMINI);

        let is_gemini = mapped_model.to_lowercase().contains("gemini");
        let budget = if is_gemini {
            user_budget.min(MAX_THINKING_BUDGET_GEMINI)
        } else {
            user_budget
        };

        config["thinkingConfig"] = json!({
            "includeThoughts": true,
            "thinkingBudget": budget
        });

        // maxOutputTokens must be greater than thinkingBudget
        match claude_req.max_tokens {
            Some(max_tokens) if i64::from(max_tokens) <= budget => {
                config["maxOutputTokens"] = json!(budget + 8192);
            }
            Some(_) => {}
            None => config["maxOutputTokens"] = json!(budget + 32768),
        }
    }

    config
}

/// Recursively convert JSON Schema `type` values to uppercase (Gemini Protobuf requirement).
fn enforce_uppercase_types(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get_mut("type") {
                *s = s.to_uppercase();
            }
            if let Some(Value::Object(props)) = map.get_mut("properties") {
                for v in props.values_mut() {
                    enforce_uppercase_types(v);
                }
            }
            if let Some(items) = map.get_mut("items") {
                enforce_uppercase_types(items);
            }
        }
        Value::Array(arr) => {
            for item in arr {
                enforce_uppercase_types(item);
            }
        }
        _ => {}
    }
}
