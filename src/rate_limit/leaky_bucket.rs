//! Leaky bucket with continuous drip refill.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::{BucketWrite, LEAKY_BUCKET_TTL_SECS};
use crate::error::StoreError;
use crate::rate_limit::{commit_attempts, commit_bucket, RateLimitParams, RateLimiter, Verdict};
use crate::store::{hash_int, HashFields, SharedStore};
use crate::suspension::SuspensionTracker;

const TOKENS: &str = "Tokens";
const LAST_DRIP_TIME: &str = "LastDripTime";

/// Store key of the leaky bucket hash for `client`.
pub fn leaky_key(client: &str) -> String {
    format!("leaky:{client}")
}

/// Bucket refilled continuously at `drip_rate` tokens per elapsed second, capped at capacity.
///
/// An empty bucket denies without writing anything, so rejected traffic never pushes the drip
/// clock forward.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    store: SharedStore,
    suspension: SuspensionTracker,
    clock: Arc<dyn Clock>,
    write: BucketWrite,
}

impl LeakyBucket {
    /// Bucket over `store`, timed by `clock`, committing with `write`.
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, write: BucketWrite) -> Self {
        Self { suspension: SuspensionTracker::new(store.clone()), store, clock, write }
    }
}

/// Tokens available after dripping for `elapsed` seconds on top of `tokens`.
fn drip(tokens: i64, elapsed: i64, drip_rate: i64, capacity: i64) -> i64 {
    let added = drip_rate.max(0).saturating_mul(elapsed.max(0));
    tokens.saturating_add(added).min(capacity)
}

#[async_trait]
impl RateLimiter for LeakyBucket {
    async fn is_allowed(&self, params: &RateLimitParams) -> Result<Verdict, StoreError> {
        let client = params.identifier.as_str();
        let key = leaky_key(client);

        if self.suspension.is_suspended(client).await? {
            debug!(target: "floodgate::leaky_bucket", client, "client suspended");
            return Ok(Verdict::deny(0));
        }

        let capacity = params.bucket_capacity;
        if capacity <= 0 {
            error!(
                target: "floodgate::leaky_bucket",
                key = %key,
                capacity,
                "bucket capacity must be > 0; denying"
            );
            return Ok(Verdict::deny(0));
        }

        for attempt in 1..=commit_attempts(self.write) {
            let now = i64::try_from(self.clock.now_secs()).unwrap_or(i64::MAX);
            let current = self.store.hash_get_all(&key).await?;
            let stored = hash_int(&key, &current, TOKENS)?.unwrap_or(capacity).min(capacity);
            let last_drip = hash_int(&key, &current, LAST_DRIP_TIME)?.unwrap_or(now);
            let tokens = drip(stored, now.saturating_sub(last_drip), params.drip_rate, capacity);

            if tokens <= 0 {
                debug!(target: "floodgate::leaky_bucket", client, "bucket empty");
                return Ok(Verdict::deny(0));
            }

            let left = tokens - 1;
            let next: HashFields = [
                (TOKENS.to_string(), left.to_string()),
                (LAST_DRIP_TIME.to_string(), now.to_string()),
            ]
            .into_iter()
            .collect();

            if commit_bucket(&self.store, self.write, &key, &current, &next, LEAKY_BUCKET_TTL_SECS)
                .await?
            {
                debug!(target: "floodgate::leaky_bucket", client, left, "token spent");
                return Ok(Verdict::allow(left));
            }
            debug!(
                target: "floodgate::leaky_bucket",
                client,
                attempt,
                "bucket changed concurrently; re-reading"
            );
        }

        warn!(
            target: "floodgate::leaky_bucket",
            client,
            "bucket contention exhausted retries; denying"
        );
        Ok(Verdict::deny(0))
    }

    async fn reset(&self, client: &str) -> Result<(), StoreError> {
        self.store.delete(&leaky_key(client)).await
    }
}
