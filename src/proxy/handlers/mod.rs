// Handlers module - API endpoint processors
//
// - POST /v1/messages                          Claude Messages
// - POST /v1beta/models/{model}:{action}       Gemini native

pub mod claude;
pub mod common;
pub mod gemini;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::models::Account;
use crate::proxy::forward::ForwardService;
use crate::proxy::rate_limit::InMemoryRateLimits;

/// Picks the accounts a request may be served from
pub trait AccountSelector: Send + Sync {
    /// Accounts to try for `model`, in preference order. Failover walks this
    /// list; an empty list means no account is currently usable.
    fn candidates(&self, model: &str) -> Vec<Account>;

    /// Called after an account served a request successfully.
    fn mark_success(&self, _account_id: &str) {}
}

/// Round-robin over a fixed pool, skipping accounts that are locked out
pub struct RoundRobinSelector {
    accounts: Vec<Account>,
    rate_limits: Arc<InMemoryRateLimits>,
    cursor: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(accounts: Vec<Account>, rate_limits: Arc<InMemoryRateLimits>) -> Self {
        Self {
            accounts,
            rate_limits,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountSelector for RoundRobinSelector {
    fn candidates(&self, model: &str) -> Vec<Account> {
        if self.accounts.is_empty() {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % self.accounts.len();
        let picked: Vec<Account> = self.accounts[start..]
            .iter()
            .chain(self.accounts[..start].iter())
            .filter(|account| !self.rate_limits.is_locked(&account.id))
            .cloned()
            .collect();

        if picked.is_empty() {
            let min_wait = self
                .accounts
                .iter()
                .map(|a| self.rate_limits.remaining_wait(&a.id))
                .min()
                .unwrap_or(0);
            tracing::warn!(
                "[Selector] All {} accounts locked for {}, shortest wait {}s",
                self.accounts.len(),
                model,
                min_wait
            );
        }
        picked
    }

    fn mark_success(&self, account_id: &str) {
        self.rate_limits.mark_success(account_id);
    }
}

/// Shared application state for Axum handlers
#[derive(Clone)]
pub struct AppState {
    pub forward: Arc<ForwardService>,
    pub selector: Arc<dyn AccountSelector>,
}

impl AppState {
    pub fn new(forward: Arc<ForwardService>, selector: Arc<dyn AccountSelector>) -> Self {
        Self { forward, selector }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::rate_limit::LockReason;
    use chrono::{Duration, Utc};

    fn pool() -> Vec<Account> {
        vec![
            Account::new("a", "alpha"),
            Account::new("b", "beta"),
            Account::new("c", "gamma"),
        ]
    }

    fn ids(accounts: &[Account]) -> Vec<&str> {
        accounts.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn test_round_robin_rotates_start() {
        let selector = RoundRobinSelector::new(pool(), Arc::new(InMemoryRateLimits::new()));
        assert_eq!(ids(&selector.candidates("m")), vec!["a", "b", "c"]);
        assert_eq!(ids(&selector.candidates("m")), vec!["b", "c", "a"]);
        assert_eq!(ids(&selector.candidates("m")), vec!["c", "a", "b"]);
        assert_eq!(ids(&selector.candidates("m")), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_locked_accounts_are_skipped() {
        let limits = Arc::new(InMemoryRateLimits::new());
        limits.lock("b", Utc::now() + Duration::seconds(60), LockReason::RateLimited, 429);
        let selector = RoundRobinSelector::new(pool(), limits.clone());
        assert_eq!(ids(&selector.candidates("m")), vec!["a", "c"]);

        limits.lock("a", Utc::now() + Duration::seconds(60), LockReason::RateLimited, 429);
        limits.lock("c", Utc::now() + Duration::seconds(60), LockReason::RateLimited, 429);
        assert!(selector.candidates("m").is_empty());
    }

    #[test]
    fn test_empty_pool() {
        let selector = RoundRobinSelector::new(Vec::new(), Arc::new(InMemoryRateLimits::new()));
        assert!(selector.is_empty());
        assert!(selector.candidates("m").is_empty());
    }
}
