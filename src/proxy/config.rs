// Proxy runtime settings
//
// The forward engine reads settings through `SettingsProvider` on every call,
// so a `SharedSettings` swap takes effect on the next request without a
// restart.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::models::GatewayConfig;
use crate::proxy::common::model_mapping::ModelFamily;
use crate::proxy::upstream::RetryPolicy;

pub trait SettingsProvider: Send + Sync {
    fn identity_patch_enabled(&self) -> bool;
    fn identity_patch(&self) -> String;
    fn model_fallback_enabled(&self) -> bool;
    /// Fallback model for the family of `mapped_model`
    fn fallback_model(&self, mapped_model: &str) -> String;
    /// `None` disables the idle guard
    fn stream_idle_timeout(&self) -> Option<Duration>;
    fn max_line_size(&self) -> usize;
    fn signature_error_patterns(&self) -> Vec<String>;
    fn retry_policy(&self) -> RetryPolicy;
    fn upstream_base_url(&self) -> String;
    fn user_agent(&self) -> String;
}

impl SettingsProvider for GatewayConfig {
    fn identity_patch_enabled(&self) -> bool {
        self.features.identity_patch_enabled
    }

    fn identity_patch(&self) -> String {
        self.features.identity_patch.clone()
    }

    fn model_fallback_enabled(&self) -> bool {
        self.features.model_fallback_enabled
    }

    fn fallback_model(&self, mapped_model: &str) -> String {
        match ModelFamily::of(mapped_model) {
            ModelFamily::Claude => self.features.fallback_models.claude.clone(),
            _ => self.features.fallback_models.gemini.clone(),
        }
    }

    fn stream_idle_timeout(&self) -> Option<Duration> {
        match self.stream.idle_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    fn max_line_size(&self) -> usize {
        self.stream.max_line_size
    }

    fn signature_error_patterns(&self) -> Vec<String> {
        self.features.signature_error_patterns.clone()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    fn upstream_base_url(&self) -> String {
        self.upstream.base_url.clone()
    }

    fn user_agent(&self) -> String {
        self.upstream.user_agent.clone()
    }
}

/// Hot-swappable settings shared between the server and the forward engine
#[derive(Clone, Default)]
pub struct SharedSettings(Arc<RwLock<GatewayConfig>>);

impl SharedSettings {
    pub fn new(config: GatewayConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    pub fn snapshot(&self) -> GatewayConfig {
        self.0.read().clone()
    }

    /// Replace the whole config; in-flight calls keep what they already read.
    pub fn update(&self, config: GatewayConfig) {
        *self.0.write() = config;
        tracing::info!("[Settings] Runtime configuration reloaded");
    }
}

impl SettingsProvider for SharedSettings {
    fn identity_patch_enabled(&self) -> bool {
        self.0.read().identity_patch_enabled()
    }

    fn identity_patch(&self) -> String {
        self.0.read().identity_patch()
    }

    fn model_fallback_enabled(&self) -> bool {
        self.0.read().model_fallback_enabled()
    }

    fn fallback_model(&self, mapped_model: &str) -> String {
        self.0.read().fallback_model(mapped_model)
    }

    fn stream_idle_timeout(&self) -> Option<Duration> {
        self.0.read().stream_idle_timeout()
    }

    fn max_line_size(&self) -> usize {
        self.0.read().max_line_size()
    }

    fn signature_error_patterns(&self) -> Vec<String> {
        self.0.read().signature_error_patterns()
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.0.read().retry_policy()
    }

    fn upstream_base_url(&self) -> String {
        self.0.read().upstream_base_url()
    }

    fn user_agent(&self) -> String {
        self.0.read().user_agent()
    }
}
