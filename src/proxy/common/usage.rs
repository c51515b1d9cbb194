use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proxy::mappers::gemini::models::UsageMetadata;

/// Token accounting reported back to the caller for billing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_input_tokens: u32,
    pub cache_read_input_tokens: u32,
}

impl TokenUsage {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<&UsageMetadata> for TokenUsage {
    /// Cached prompt tokens are reported separately from fresh input;
    /// thinking tokens bill as output.
    fn from(meta: &UsageMetadata) -> Self {
        let prompt = meta.prompt_token_count.unwrap_or(0);
        let cached = meta.cached_content_token_count.unwrap_or(0);
        Self {
            input_tokens: prompt.saturating_sub(cached),
            output_tokens: meta
                .candidates_token_count
                .unwrap_or(0)
                .saturating_add(meta.thoughts_token_count.unwrap_or(0)),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: cached,
        }
    }
}

/// Best-effort usage lookup on a Gemini-shaped (or still wrapped) JSON value.
///
/// Checks `usageMetadata` at the top level, then under `response`.
/// Returns `None` when neither exists or the node does not decode.
pub fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let node = value
        .get("usageMetadata")
        .or_else(|| value.get("response").and_then(|r| r.get("usageMetadata")))?;
    let meta: UsageMetadata = serde_json::from_value(node.clone()).ok()?;
    Some(TokenUsage::from(&meta))
}
