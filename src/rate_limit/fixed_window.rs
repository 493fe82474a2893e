//! Fixed window counter, also serving the sliding window mode.

use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::rate_limit::{start_ttl, RateLimitParams, RateLimiter, Verdict};
use crate::store::{parse_int, SharedStore};
use crate::suspension::SuspensionTracker;

/// Store key of the window counter for `client`.
pub fn window_key(client: &str) -> String {
    format!("rate_limit:{client}")
}

/// Fixed window counter.
///
/// The first hit in a fresh window creates the counter and starts its TTL; the window ends when
/// the key expires. Bursts of up to twice the limit across a window edge are expected.
#[derive(Debug, Clone)]
pub struct FixedWindowCounter {
    store: SharedStore,
    suspension: SuspensionTracker,
}

impl FixedWindowCounter {
    /// Counter backed by `store`.
    pub fn new(store: SharedStore) -> Self {
        Self { suspension: SuspensionTracker::new(store.clone()), store }
    }

    /// Hits recorded in the current window, if one is open.
    pub async fn current_count(&self, client: &str) -> Result<Option<i64>, StoreError> {
        let key = window_key(client);
        match self.store.get(&key).await? {
            Some(raw) => parse_int(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Give one hit back, e.g. when the request was never served.
    pub async fn decrement(&self, client: &str) -> Result<i64, StoreError> {
        self.store.increment_by(&window_key(client), -1).await
    }

    /// Seconds until the current window closes.
    pub async fn remaining_ttl(&self, client: &str) -> Result<Option<u64>, StoreError> {
        self.store.ttl(&window_key(client)).await
    }
}

#[async_trait]
impl RateLimiter for FixedWindowCounter {
    async fn is_allowed(&self, params: &RateLimitParams) -> Result<Verdict, StoreError> {
        let client = params.identifier.as_str();
        let key = window_key(client);

        let count = match self.store.increment(&key).await {
            Ok(count) => count,
            Err(e) => {
                error!(
                    target: "floodgate::fixed_window",
                    client,
                    error = %e,
                    "window increment failed; denying"
                );
                return Ok(Verdict::deny(0));
            }
        };

        if count == 1 {
            start_ttl(&self.store, &key, params.window_secs).await?;
        }
        if count > params.suspension_threshold {
            self.suspension.suspend(client, params.suspension_duration_secs).await?;
        }
        let suspended = self.suspension.is_suspended(client).await?;

        let allowed = count <= i64::from(params.max_requests) && !suspended;
        debug!(
            target: "floodgate::fixed_window",
            client,
            count,
            suspended,
            allowed,
            "window check"
        );
        Ok(Verdict { allowed, remaining: count })
    }

    async fn reset(&self, client: &str) -> Result<(), StoreError> {
        self.store.delete(&window_key(client)).await
    }
}
