// Model name routing
//
// Resolution order: account override > exact upstream model > longest prefix
// alias > gemini passthrough > default model.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::models::Account;

/// Model used when nothing else matches
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Models the upstream accepts verbatim.
const SUPPORTED_MODELS: &[&str] = &[
    "claude-opus-4-5-thinking",
    "claude-sonnet-4-5",
    "claude-sonnet-4-5-thinking",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-2.5-flash-thinking",
    "gemini-3-flash",
    "gemini-3-pro-low",
    "gemini-3-pro-high",
    "gemini-3-pro-image",
];

/// Alias prefixes. Declaration order is irrelevant, see `PREFIX_TABLE`.
const PREFIX_ALIASES: &[(&str, &str)] = &[
    ("gemini-2.5-flash-image", "gemini-3-pro-image"),
    ("gemini-3-pro-image", "gemini-3-pro-image"),
    ("claude-3-5-sonnet", "claude-sonnet-4-5"),
    ("claude-sonnet-4-5", "claude-sonnet-4-5"),
    ("claude-haiku-4-5", "claude-sonnet-4-5"),
    ("claude-opus-4-5", "claude-opus-4-5-thinking"),
    ("claude-3-haiku", "claude-sonnet-4-5"),
    ("claude-sonnet-4", "claude-sonnet-4-5"),
    ("claude-haiku-4", "claude-sonnet-4-5"),
    ("claude-opus-4", "claude-opus-4-5-thinking"),
    ("gemini-3-pro", "gemini-3-pro-high"),
];

/// Prefix table sorted by prefix length, longest first.
static PREFIX_TABLE: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    let mut table = PREFIX_ALIASES.to_vec();
    table.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
    table
});

/// Model family, used to pick a fallback model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Gemini,
}

impl ModelFamily {
    pub fn of(model: &str) -> Self {
        if model.starts_with("claude-") {
            Self::Claude
        } else {
            Self::Gemini
        }
    }
}

/// Map a model name through the built-in tables only.
pub fn map_builtin(requested: &str) -> String {
    if SUPPORTED_MODELS.contains(&requested) {
        return requested.to_string();
    }

    if let Some((_, target)) = PREFIX_TABLE
        .iter()
        .find(|(prefix, _)| requested.starts_with(prefix))
    {
        return target.to_string();
    }

    if requested.starts_with("gemini-") {
        return requested.to_string();
    }

    DEFAULT_MODEL.to_string()
}

/// Core model routing function. Total and deterministic.
pub fn resolve_model(account: Option<&Account>, requested: &str) -> String {
    if let Some(acc) = account {
        let mapped = acc.get_mapped_model(requested);
        if mapped != requested {
            return mapped;
        }
    }
    map_builtin(requested)
}

/// Whether the gateway accepts this model name at all.
pub fn is_model_supported(requested: &str) -> bool {
    requested.starts_with("claude-") || requested.starts_with("gemini-")
}

pub fn is_image_generation_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    let name = normalize_gemini_model(&lower);
    name.starts_with("gemini-3-pro-image") || name.starts_with("gemini-2.5-flash-image")
}

/// Strip the `models/` resource prefix used by the Gemini REST surface.
pub fn normalize_gemini_model(model: &str) -> &str {
    model.trim().trim_start_matches("models/")
}

/// Wildcard matching - supports multiple `*` wildcards.
///
/// Case-sensitive. Examples:
/// - `claude-opus-*` matches `claude-opus-4-1`
/// - `claude-*-sonnet-*` matches `claude-3-5-sonnet-20241022`
/// - `*-thinking` matches `claude-opus-4-5-thinking`
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() == 1 {
        return pattern == text;
    }

    let mut text_pos = 0;

    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }

        if i == 0 {
            if !text[text_pos..].starts_with(part) {
                return false;
            }
            text_pos += part.len();
        } else if i == parts.len() - 1 {
            return text[text_pos..].ends_with(part);
        } else if let Some(pos) = text[text_pos..].find(part) {
            text_pos += pos + part.len();
        } else {
            return false;
        }
    }

    true
}

/// Best wildcard match from a mapping table.
/// The pattern with the most literal characters wins.
pub fn get_wildcard_mapping(model: &str, mapping: &HashMap<String, String>) -> Option<String> {
    mapping
        .iter()
        .filter(|(pattern, _)| pattern.contains('*') && wildcard_match(pattern, model))
        .max_by(|(a, _), (b, _)| {
            let spec_a = a.chars().count() - a.matches('*').count();
            let spec_b = b.chars().count() - b.matches('*').count();
            spec_a.cmp(&spec_b).then_with(|| b.cmp(a))
        })
        .map(|(_, target)| target.clone())
}
