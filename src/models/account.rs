use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::proxy::common::model_mapping::get_wildcard_mapping;

/// Credential key holding the upstream project id
pub const CREDENTIAL_PROJECT_ID: &str = "project_id";
/// Credential key holding a ready-to-use bearer token
pub const CREDENTIAL_ACCESS_TOKEN: &str = "access_token";

/// 账号数据结构 (read-only to the forwarding engine)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// Opaque credentials such as `project_id` and `access_token`
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Per-account model overrides. Keys may contain `*` wildcards.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_mapping: HashMap<String, String>,
    /// Outbound proxy for this account (http, https, socks5)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    /// Max in-flight upstream requests for this account, 0 = unlimited
    #[serde(default)]
    pub concurrency: usize,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            credentials: HashMap::new(),
            model_mapping: HashMap::new(),
            proxy_url: None,
            concurrency: 0,
        }
    }

    pub fn with_credential(mut self, key: &str, value: impl Into<String>) -> Self {
        self.credentials.insert(key.to_string(), value.into());
        self
    }

    pub fn with_model_mapping(mut self, from: &str, to: &str) -> Self {
        self.model_mapping.insert(from.to_string(), to.to_string());
        self
    }

    pub fn get_credential(&self, key: &str) -> Option<&str> {
        self.credentials
            .get(key)
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn project_id(&self) -> &str {
        self.get_credential(CREDENTIAL_PROJECT_ID).unwrap_or_default()
    }

    /// Apply the account's own mapping table.
    ///
    /// Exact keys win over wildcard keys; an unmapped model is returned unchanged,
    /// which callers use to detect "no override".
    pub fn get_mapped_model(&self, requested: &str) -> String {
        if let Some(target) = self.model_mapping.get(requested) {
            return target.clone();
        }
        get_wildcard_mapping(requested, &self.model_mapping)
            .unwrap_or_else(|| requested.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_mapped_model_exact_and_wildcard() {
        let account = Account::new("acc-1", "primary")
            .with_model_mapping("claude-sonnet-4-5", "gemini-3-flash")
            .with_model_mapping("claude-opus-*", "claude-opus-4-5-thinking");

        assert_eq!(account.get_mapped_model("claude-sonnet-4-5"), "gemini-3-flash");
        assert_eq!(
            account.get_mapped_model("claude-opus-4-1"),
            "claude-opus-4-5-thinking"
        );
        assert_eq!(account.get_mapped_model("gemini-2.5-flash"), "gemini-2.5-flash");
    }

    #[test]
    fn test_blank_credential_is_absent() {
        let account = Account::new("acc-1", "primary")
            .with_credential(CREDENTIAL_PROJECT_ID, "  ")
            .with_credential(CREDENTIAL_ACCESS_TOKEN, "ya29.token");

        assert_eq!(account.get_credential(CREDENTIAL_PROJECT_ID), None);
        assert_eq!(account.project_id(), "");
        assert_eq!(account.get_credential(CREDENTIAL_ACCESS_TOKEN), Some("ya29.token"));
    }

    #[test]
    fn test_account_deserializes_with_defaults() {
        let account: Account =
            serde_json::from_str(r#"{"id":"a","name":"b"}"#).unwrap();
        assert!(account.credentials.is_empty());
        assert!(account.proxy_url.is_none());
        assert_eq!(account.concurrency, 0);
    }
}
