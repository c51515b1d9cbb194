use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::models::GatewayConfig;
use crate::proxy::upstream::client::normalize_proxy_url;

pub const CONFIG_FILE: &str = "gateway.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed_to_read_config_file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed_to_parse_config_file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed_to_serialize_config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed_to_save_config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid_config: {0}")]
    Invalid(String),
}

impl GatewayConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GatewayConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream.base_url is empty".into()));
        }
        url::Url::parse(&self.upstream.base_url).map_err(|e| {
            ConfigError::Invalid(format!("upstream.base_url '{}': {}", self.upstream.base_url, e))
        })?;
        if let Some(proxy) = self.upstream.proxy_url.as_deref().filter(|p| !p.trim().is_empty()) {
            url::Url::parse(&normalize_proxy_url(proxy))
                .map_err(|e| ConfigError::Invalid(format!("upstream.proxy_url '{}': {}", proxy, e)))?;
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.stream.max_line_size == 0 {
            return Err(ConfigError::Invalid("stream.max_line_size must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account id '{}'",
                    account.id
                )));
            }
        }
        Ok(())
    }
}

/// Binary-edge helper: explicit path must exist, otherwise fall back to
/// `./gateway.toml` when present, else defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    match path {
        Some(p) => GatewayConfig::load(p)
            .with_context(|| format!("loading config from {}", p.display())),
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                GatewayConfig::load(default_path).context("loading ./gateway.toml")
            } else {
                tracing::info!("No {} found, using built-in defaults", CONFIG_FILE);
                Ok(GatewayConfig::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_reads_sections() {
        let file = write_config(
            r#"
            [server]
            port = 9000

            [retry]
            max_attempts = 5

            [features]
            signature_error_patterns = ["invalid signature"]
            "#,
        );
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_delay_ms, 16_000);
        assert_eq!(
            config.features.signature_error_patterns,
            vec!["invalid signature".to_string()]
        );
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = GatewayConfig::load(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let file = write_config("[server\nport = ");
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("failed_to_parse_config_file"));
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let file = write_config("[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 100\n");
        let err = GatewayConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_bad_urls() {
        let mut config = GatewayConfig::default();
        config.upstream.base_url = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = GatewayConfig::default();
        config.upstream.proxy_url = Some("127.0.0.1:7890".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_accounts() {
        let file = write_config(
            r#"
            [[accounts]]
            id = "a"
            name = "one"

            [[accounts]]
            id = "a"
            name = "two"
            "#,
        );
        assert!(GatewayConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = GatewayConfig::default();
        config.stream.idle_timeout_secs = 7;
        config.save(&path).unwrap();
        assert_eq!(GatewayConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_config_explicit_path_errors_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = load_config(Some(&missing)).unwrap_err();
        assert!(format!("{:#}", err).contains("missing.toml"));
    }
}
