// Retry policy: exponential backoff with ±20% jitter, cancellable sleeps

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::models::config::RetryConfig;
use crate::proxy::mappers::claude::DegradeStage;

const JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Nominal delay after failed attempt `attempt` (1-based): base * 2^(attempt-1), capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Nominal delay with ±20% uniform jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let nominal = self.backoff_delay(attempt).as_secs_f64();
        let factor = rand::thread_rng().gen_range(-1.0..=1.0) * JITTER_RATIO;
        Duration::from_secs_f64((nominal * (1.0 + factor)).max(0.0))
    }

    /// Sleep for the jittered delay of `attempt`, or until `cancel` fires.
    ///
    /// Returns the slept duration, or `None` when canceled.
    pub async fn sleep_backoff(&self, attempt: u32, cancel: &CancellationToken) -> Option<Duration> {
        let delay = self.jittered_delay(attempt);
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(delay) => Some(delay),
        }
    }
}

/// Per-call retry bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    /// Upstream calls made so far, including degradation and fallback tries
    pub attempt: u32,
    pub max_attempts: u32,
    pub total_backoff: Duration,
    pub delays: Vec<Duration>,
    /// Last degradation stage applied, if any
    pub stage: Option<DegradeStage>,
}

impl RetryContext {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            ..Self::default()
        }
    }

    pub fn record_backoff(&mut self, delay: Duration) {
        self.total_backoff += delay;
        self.delays.push(delay);
    }
}
