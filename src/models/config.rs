use serde::{Deserialize, Serialize};

use super::account::Account;

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Max accepted request body in bytes
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8045,
            body_limit: 100 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Upstream
// ============================================================================

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
pub const DEFAULT_USER_AGENT: &str = "antigravity/1.11.9 windows/amd64";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL; requests go to `{base_url}/v1internal:{action}`
    pub base_url: String,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Proxy applied to accounts that carry no proxy of their own
    pub proxy_url: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout_secs: 20,
            request_timeout_secs: 600,
            proxy_url: None,
        }
    }
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Max silence between upstream lines, 0 disables the idle guard
    pub idle_timeout_secs: u64,
    /// Max length of a single upstream line in bytes
    pub max_line_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            max_line_size: 10 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Features
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FallbackModelsConfig {
    pub claude: String,
    pub gemini: String,
}

impl Default for FallbackModelsConfig {
    fn default() -> Self {
        Self {
            claude: "claude-sonnet-4-5".to_string(),
            gemini: "gemini-2.5-flash".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeaturesConfig {
    pub identity_patch_enabled: bool,
    /// Text prepended to the system instruction when the patch is enabled
    pub identity_patch: String,
    pub model_fallback_enabled: bool,
    pub fallback_models: FallbackModelsConfig,
    /// Lowercase substrings that mark a 400 as a thinking-signature rejection
    pub signature_error_patterns: Vec<String>,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            identity_patch_enabled: false,
            identity_patch: default_identity_patch(),
            model_fallback_enabled: false,
            fallback_models: FallbackModelsConfig::default(),
            signature_error_patterns: default_signature_error_patterns(),
        }
    }
}

fn default_identity_patch() -> String {
    "You are Antigravity, a powerful agentic AI coding assistant.".to_string()
}

pub fn default_signature_error_patterns() -> Vec<String> {
    vec!["thought_signature".to_string(), "signature".to_string()]
}

// ============================================================================
// Logging
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    pub level: String,
    /// Directory for daily rolling log files, none = stdout only
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

// ============================================================================
// GatewayConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
    pub features: FeaturesConfig,
    pub logging: LoggingConfig,
    /// Static account pool used by the bundled server
    pub accounts: Vec<Account>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.upstream.base_url, DEFAULT_UPSTREAM_BASE_URL);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [stream]
            idle_timeout_secs = 5

            [features]
            model_fallback_enabled = true

            [[accounts]]
            id = "acc-1"
            name = "primary"
            credentials = { project_id = "proj-1", access_token = "tok" }
            "#,
        )
        .unwrap();

        assert_eq!(config.stream.idle_timeout_secs, 5);
        assert_eq!(config.stream.max_line_size, 10 * 1024 * 1024);
        assert!(config.features.model_fallback_enabled);
        assert_eq!(config.features.fallback_models.gemini, "gemini-2.5-flash");
        assert_eq!(config.accounts.len(), 1);
        assert_eq!(config.accounts[0].project_id(), "proj-1");
    }

    fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (1u32..=10, 1u64..=5_000, 1u64..=60_000).prop_map(
            |(max_attempts, base_delay_ms, max_delay_ms)| RetryConfig {
                max_attempts,
                base_delay_ms,
                max_delay_ms,
            },
        )
    }

    fn arb_features_config() -> impl Strategy<Value = FeaturesConfig> {
        (
            any::<bool>(),
            "[a-zA-Z0-9 .]{0,40}",
            any::<bool>(),
            "[a-z0-9.-]{3,20}",
            "[a-z0-9.-]{3,20}",
            proptest::collection::vec("[a-z_]{3,20}", 0..4),
        )
            .prop_map(
                |(identity_patch_enabled, identity_patch, model_fallback_enabled, claude, gemini, signature_error_patterns)| {
                    FeaturesConfig {
                        identity_patch_enabled,
                        identity_patch,
                        model_fallback_enabled,
                        fallback_models: FallbackModelsConfig { claude, gemini },
                        signature_error_patterns,
                    }
                },
            )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn gateway_config_toml_roundtrip(retry in arb_retry_config(), features in arb_features_config()) {
            let config = GatewayConfig { retry, features, ..GatewayConfig::default() };
            let text = toml::to_string(&config).expect("serialize");
            let parsed: GatewayConfig = toml::from_str(&text).expect("deserialize");
            prop_assert_eq!(&config, &parsed);
        }
    }
}
