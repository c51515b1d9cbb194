use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::models::Account;

/// Account persistence hook for 429 lockouts
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn set_rate_limited(&self, account_id: &str, reset_at: DateTime<Utc>);
}

/// Error bookkeeping for every non-429 terminal upstream failure
#[async_trait]
pub trait RateLimitTracker: Send + Sync {
    /// Returns true when the account should be taken out of rotation.
    async fn handle_upstream_error(
        &self,
        account: &Account,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
    ) -> bool;
}

/// Rate limit reason types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    /// 429 from upstream
    RateLimited,
    /// 401/403, credentials unusable until replaced
    Unauthorized,
    /// 529 / model capacity exhausted
    Overloaded,
    /// Other 5xx, soft avoidance
    ServerError,
}

#[derive(Debug, Clone)]
pub struct LockInfo {
    pub reset_at: DateTime<Utc>,
    pub reason: LockReason,
    pub status: u16,
}

/// Failure count expiry: a quiet hour resets the counter
const FAILURE_COUNT_EXPIRY_SECONDS: i64 = 3600;
const SERVER_ERROR_LOCKOUT_SECONDS: i64 = 8;
const UNAUTHORIZED_LOCKOUT_SECONDS: i64 = 3600;
const OVERLOAD_STEPS: [i64; 3] = [5, 10, 15];

/// In-process lockout table shared by the bundled server
#[derive(Default)]
pub struct InMemoryRateLimits {
    limits: DashMap<String, LockInfo>,
    /// Consecutive failures per account with the time of the last one
    failure_counts: DashMap<String, (u32, DateTime<Utc>)>,
}

impl InMemoryRateLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, account_id: &str, reset_at: DateTime<Utc>, reason: LockReason, status: u16) {
        tracing::warn!(
            "[RateLimit] Account {} locked ({:?}, status {}) until {}",
            account_id,
            reason,
            status,
            reset_at.format("%H:%M:%S")
        );
        self.limits.insert(
            account_id.to_string(),
            LockInfo {
                reset_at,
                reason,
                status,
            },
        );
    }

    pub fn get(&self, account_id: &str) -> Option<LockInfo> {
        self.limits.get(account_id).map(|r| r.clone())
    }

    /// Remaining lockout in whole seconds, 0 when free
    pub fn remaining_wait(&self, account_id: &str) -> u64 {
        let now = Utc::now();
        self.limits
            .get(account_id)
            .filter(|info| info.reset_at > now)
            .map(|info| (info.reset_at - now).num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    pub fn is_locked(&self, account_id: &str) -> bool {
        self.limits
            .get(account_id)
            .is_some_and(|info| info.reset_at > Utc::now())
    }

    pub fn failure_count(&self, account_id: &str) -> u32 {
        self.failure_counts.get(account_id).map(|e| e.0).unwrap_or(0)
    }

    /// Reset counters after a successful call
    pub fn mark_success(&self, account_id: &str) {
        if self.failure_counts.remove(account_id).is_some() {
            tracing::debug!("[RateLimit] Account {} succeeded, failure count reset", account_id);
        }
        self.limits.remove(account_id);
    }

    /// Drop expired records, returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.limits.len();
        self.limits.retain(|_, v| v.reset_at > now);
        let removed = before - self.limits.len();
        if removed > 0 {
            tracing::debug!("[RateLimit] Cleaned up {} expired record(s)", removed);
        }
        removed
    }

    fn bump_failure(&self, account_id: &str) -> u32 {
        let now = Utc::now();
        let mut entry = self
            .failure_counts
            .entry(account_id.to_string())
            .or_insert((0, now));
        if (now - entry.1).num_seconds() > FAILURE_COUNT_EXPIRY_SECONDS {
            *entry = (0, now);
        }
        entry.0 += 1;
        entry.1 = now;
        entry.0
    }
}

#[async_trait]
impl AccountStore for InMemoryRateLimits {
    async fn set_rate_limited(&self, account_id: &str, reset_at: DateTime<Utc>) {
        self.bump_failure(account_id);
        self.lock(account_id, reset_at, LockReason::RateLimited, 429);
    }
}

#[async_trait]
impl RateLimitTracker for InMemoryRateLimits {
    async fn handle_upstream_error(
        &self,
        account: &Account,
        status: u16,
        headers: &HeaderMap,
        body: &[u8],
    ) -> bool {
        let now = Utc::now();
        match status {
            401 | 403 => {
                self.lock(
                    &account.id,
                    now + ChronoDuration::seconds(UNAUTHORIZED_LOCKOUT_SECONDS),
                    LockReason::Unauthorized,
                    status,
                );
                true
            }
            529 => {
                let count = self.bump_failure(&account.id) as usize;
                let step = OVERLOAD_STEPS[count.saturating_sub(1).min(OVERLOAD_STEPS.len() - 1)];
                self.lock(
                    &account.id,
                    now + ChronoDuration::seconds(step),
                    LockReason::Overloaded,
                    status,
                );
                false
            }
            500..=599 => {
                // Retry-After wins over the fixed soft lockout
                let secs = headers
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .or_else(|| parse_retry_seconds(&String::from_utf8_lossy(body)).map(|s| s as i64))
                    .unwrap_or(SERVER_ERROR_LOCKOUT_SECONDS)
                    .max(2);
                self.lock(
                    &account.id,
                    now + ChronoDuration::seconds(secs),
                    LockReason::ServerError,
                    status,
                );
                false
            }
            _ => false,
        }
    }
}

/// Parse a rate-limit reset time out of an upstream 429 body.
///
/// Understands `quotaResetDelay` / `retryDelay` in `error.details`,
/// `Please retry in 12.5s` and the common "try again in" phrasings.
pub fn parse_rate_limit_reset(body: &[u8]) -> Option<DateTime<Utc>> {
    let text = String::from_utf8_lossy(body);
    let seconds = parse_retry_seconds(&text)?;
    Some(Utc::now() + ChronoDuration::seconds(seconds as i64))
}

/// Fallback lockout when no reset time can be parsed from a 429 body
pub fn default_rate_limit_window(body: &[u8]) -> ChronoDuration {
    let text = String::from_utf8_lossy(body);
    if text.contains("Please retry in") || text.contains("retryDelay") {
        ChronoDuration::minutes(5)
    } else {
        ChronoDuration::minutes(1)
    }
}

static MS_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)ms").ok());
static H_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d+)h").ok());
static M_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d+)m").ok());
static S_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)s").ok());

static TEXT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)please retry in (\d+(?:\.\d+)?)s",
        r"(?i)(?:try again in|backoff for|wait)\s*(\d+)s",
        r"(?i)quota will reset in (\d+) second",
        r"(?i)retry after (\d+) second",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

static MIN_SEC_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)try again in (\d+)m\s*(\d+)s").ok());

fn capture<T: std::str::FromStr>(re: &Lazy<Option<Regex>>, s: &str) -> Option<T> {
    re.as_ref()?.captures(s)?.get(1)?.as_str().parse().ok()
}

/// Parse duration strings like "2h1m1s", "42s", "500ms", "510.790006ms"
pub fn parse_duration_string(s: &str) -> Option<u64> {
    let milliseconds: f64 = capture(&MS_RE, s).unwrap_or(0.0);
    // Strip "ms" so it does not feed the minute and second patterns
    let rest = match MS_RE.as_ref() {
        Some(re) => re.replace_all(s, "").into_owned(),
        None => s.to_string(),
    };

    let hours: u64 = capture(&H_RE, &rest).unwrap_or(0);
    let minutes: u64 = capture(&M_RE, &rest).unwrap_or(0);
    let seconds: f64 = capture(&S_RE, &rest).unwrap_or(0.0);

    let total = hours * 3600
        + minutes * 60
        + seconds.ceil() as u64
        + (milliseconds / 1000.0).ceil() as u64;

    if total == 0 {
        tracing::debug!("[RateLimit] Unparseable duration '{}'", s);
        None
    } else {
        Some(total)
    }
}

/// Seconds until retry, from a JSON error body or free text
fn parse_retry_seconds(body: &str) -> Option<u64> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(json) = serde_json::from_str::<Value>(trimmed) {
            if let Some(secs) = retry_seconds_from_json(&json) {
                return Some(secs);
            }
        }
    }

    if let Some(caps) = MIN_SEC_RE.as_ref().and_then(|re| re.captures(body)) {
        if let (Ok(m), Ok(s)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
            return Some(m * 60 + s);
        }
    }

    TEXT_PATTERNS.iter().find_map(|re| {
        re.captures(body)
            .and_then(|c| c[1].parse::<f64>().ok())
            .map(|s| s.ceil() as u64)
            .filter(|s| *s > 0)
    })
}

fn retry_seconds_from_json(json: &Value) -> Option<u64> {
    // Upstream errors sometimes arrive as a one-element array
    let json = json.as_array().and_then(|a| a.first()).unwrap_or(json);
    let details = json.pointer("/error/details")?.as_array()?;

    details.iter().find_map(|detail| {
        detail
            .pointer("/metadata/quotaResetDelay")
            .or_else(|| detail.get("retryDelay"))
            .and_then(Value::as_str)
            .and_then(parse_duration_string)
    })
}
