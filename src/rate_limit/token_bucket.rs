//! Token bucket with discrete refill grants.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::BucketWrite;
use crate::error::StoreError;
use crate::rate_limit::{
    commit_attempts, commit_bucket, start_ttl, RateLimitParams, RateLimiter, Verdict,
};
use crate::store::{hash_int, HashFields, SharedStore};
use crate::suspension::SuspensionTracker;

const TOKENS_REMAINING: &str = "TokensRemaining";
const LAST_REFILL_TIME: &str = "LastRefillTime";

/// Store key of the bucket hash for `client`.
pub fn bucket_key(client: &str) -> String {
    format!("bucket:{client}")
}

/// Store key counting requests that found the bucket empty.
pub fn no_tokens_key(client: &str) -> String {
    format!("bucket:noTokens:{client}")
}

/// Token bucket with discrete refills.
///
/// A full `refill_rate` grant is added only once `refill_interval_secs` have passed since the
/// last grant; partial intervals add nothing. Buckets start full. Clients that keep knocking on
/// an empty bucket are suspended once their empty-bucket count passes the suspension threshold.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    store: SharedStore,
    suspension: SuspensionTracker,
    clock: Arc<dyn Clock>,
    write: BucketWrite,
}

impl TokenBucket {
    /// Bucket over `store`, timed by `clock`, committing with `write`.
    pub fn new(store: SharedStore, clock: Arc<dyn Clock>, write: BucketWrite) -> Self {
        Self { suspension: SuspensionTracker::new(store.clone()), store, clock, write }
    }

    /// Tokens currently stored for `client` (no refill applied); `None` for an unseen client.
    pub async fn stored_tokens(&self, client: &str) -> Result<Option<i64>, StoreError> {
        let key = bucket_key(client);
        let fields = self.store.hash_get_all(&key).await?;
        hash_int(&key, &fields, TOKENS_REMAINING)
    }

    async fn on_empty(&self, params: &RateLimitParams) -> Result<Verdict, StoreError> {
        let client = params.identifier.as_str();
        let key = no_tokens_key(client);
        let misses = self.store.increment(&key).await?;
        if misses == 1 {
            start_ttl(&self.store, &key, params.bucket_ttl_secs).await?;
        }
        if misses > params.suspension_threshold {
            self.suspension.suspend(client, params.suspension_duration_secs).await?;
            warn!(
                target: "floodgate::token_bucket",
                client,
                misses,
                "suspended for hammering an empty bucket"
            );
        }
        debug!(target: "floodgate::token_bucket", client, misses, "bucket empty");
        Ok(Verdict::deny(0))
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn is_allowed(&self, params: &RateLimitParams) -> Result<Verdict, StoreError> {
        let client = params.identifier.as_str();
        let key = bucket_key(client);

        if self.suspension.is_suspended(client).await? {
            debug!(target: "floodgate::token_bucket", client, "client suspended");
            return Ok(Verdict::deny(self.stored_tokens(client).await?.unwrap_or(0)));
        }

        let capacity = params.bucket_capacity;
        if capacity <= 0 {
            error!(
                target: "floodgate::token_bucket",
                key = %key,
                capacity,
                "bucket capacity must be > 0; denying"
            );
            return Ok(Verdict::deny(0));
        }

        let interval = i64::try_from(params.refill_interval_secs).unwrap_or(i64::MAX);
        for attempt in 1..=commit_attempts(self.write) {
            let now = i64::try_from(self.clock.now_secs()).unwrap_or(i64::MAX);
            let current = self.store.hash_get_all(&key).await?;
            let tokens = hash_int(&key, &current, TOKENS_REMAINING)?
                .unwrap_or(capacity)
                .clamp(0, capacity);
            let last_refill = hash_int(&key, &current, LAST_REFILL_TIME)?.unwrap_or(now);

            let refilled = now.saturating_sub(last_refill) >= interval;
            let granted = if refilled { params.refill_rate.max(0) } else { 0 };
            let available = tokens.saturating_add(granted).min(capacity);

            if available <= 0 {
                return self.on_empty(params).await;
            }

            let left = available - 1;
            let stamp = if refilled { now } else { last_refill };
            let next: HashFields = [
                (TOKENS_REMAINING.to_string(), left.to_string()),
                (LAST_REFILL_TIME.to_string(), stamp.to_string()),
            ]
            .into_iter()
            .collect();

            if commit_bucket(&self.store, self.write, &key, &current, &next, params.bucket_ttl_secs)
                .await?
            {
                self.store.delete(&no_tokens_key(client)).await?;
                debug!(target: "floodgate::token_bucket", client, left, refilled, "token spent");
                return Ok(Verdict::allow(left));
            }
            debug!(
                target: "floodgate::token_bucket",
                client,
                attempt,
                "bucket changed concurrently; re-reading"
            );
        }

        warn!(
            target: "floodgate::token_bucket",
            client,
            "bucket contention exhausted retries; denying"
        );
        Ok(Verdict::deny(0))
    }

    async fn reset(&self, client: &str) -> Result<(), StoreError> {
        self.store.delete(&bucket_key(client)).await?;
        self.store.delete(&no_tokens_key(client)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GlobalConfig;
    use crate::store::{CounterStore, InMemoryStore};
    use std::time::Duration;

    fn setup(write: BucketWrite) -> (TokenBucket, InMemoryStore, ManualClock) {
        let clock = ManualClock::at_secs(1_700_000_000);
        let store = InMemoryStore::with_clock(clock.clone());
        let bucket = TokenBucket::new(Arc::new(store.clone()), Arc::new(clock.clone()), write);
        (bucket, store, clock)
    }

    fn params(capacity: i64, rate: i64, interval: u64) -> RateLimitParams {
        let mut p = RateLimitParams::new("10.1.1.1", 100, 60, &GlobalConfig::default());
        p.bucket_capacity = capacity;
        p.refill_rate = rate;
        p.refill_interval_secs = interval;
        p.suspension_threshold = 1_000;
        p
    }

    #[tokio::test]
    async fn capacity_then_deny() {
        let (bucket, _store, _clock) = setup(BucketWrite::default());
        let p = params(3, 2, 10);
        assert_eq!(bucket.is_allowed(&p).await.unwrap(), Verdict::allow(2));
        assert_eq!(bucket.is_allowed(&p).await.unwrap(), Verdict::allow(1));
        assert_eq!(bucket.is_allowed(&p).await.unwrap(), Verdict::allow(0));
        assert_eq!(bucket.is_allowed(&p).await.unwrap(), Verdict::deny(0));
    }

    #[tokio::test]
    async fn refill_is_discrete_and_exact() {
        let (bucket, _store, clock) = setup(BucketWrite::default());
        let p = params(5, 2, 10);
        for _ in 0..5 {
            assert!(bucket.is_allowed(&p).await.unwrap().allowed);
        }
        assert!(!bucket.is_allowed(&p).await.unwrap().allowed);

        // Part of an interval grants nothing.
        clock.advance(Duration::from_secs(9));
        assert!(!bucket.is_allowed(&p).await.unwrap().allowed);

        clock.advance(Duration::from_secs(1));
        assert!(bucket.is_allowed(&p).await.unwrap().allowed);
        assert!(bucket.is_allowed(&p).await.unwrap().allowed);
        assert!(!bucket.is_allowed(&p).await.unwrap().allowed, "exactly refill_rate more");
    }

    #[tokio::test]
    async fn long_idle_never_exceeds_capacity() {
        let (bucket, _store, clock) = setup(BucketWrite::default());
        let p = params(3, 10, 1);
        bucket.is_allowed(&p).await.unwrap();
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(bucket.is_allowed(&p).await.unwrap(), Verdict::allow(2));
    }

    #[tokio::test]
    async fn refill_time_moves_only_on_refill() {
        let (bucket, store, clock) = setup(BucketWrite::default());
        let p = params(5, 1, 10);
        bucket.is_allowed(&p).await.unwrap();
        let start = store.hash_get_all("bucket:10.1.1.1").await.unwrap()["LastRefillTime"].clone();
        clock.advance(Duration::from_secs(4));
        bucket.is_allowed(&p).await.unwrap();
        let after = store.hash_get_all("bucket:10.1.1.1").await.unwrap();
        assert_eq!(after["LastRefillTime"], start);
        assert_eq!(after["TokensRemaining"], "3");
    }

    #[tokio::test]
    async fn zero_capacity_always_denies() {
        let (bucket, store, _clock) = setup(BucketWrite::default());
        let p = params(0, 5, 1);
        assert_eq!(bucket.is_allowed(&p).await.unwrap(), Verdict::deny(0));
        assert!(store.is_empty(), "misconfigured bucket writes nothing");
    }

    #[tokio::test]
    async fn empty_bucket_abuse_leads_to_suspension() {
        let (bucket, store, clock) = setup(BucketWrite::default());
        let mut p = params(1, 1, 10);
        p.suspension_threshold = 2;
        p.suspension_duration_secs = 120;
        assert!(bucket.is_allowed(&p).await.unwrap().allowed);
        for _ in 0..3 {
            assert!(!bucket.is_allowed(&p).await.unwrap().allowed);
        }
        assert!(store.exists("suspended:10.1.1.1").await.unwrap());

        // A refill is due, but the suspension wins and the bucket is untouched.
        clock.advance(Duration::from_secs(10));
        assert!(!bucket.is_allowed(&p).await.unwrap().allowed);
        assert_eq!(bucket.stored_tokens("10.1.1.1").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn spending_a_token_clears_abuse_counter() {
        let (bucket, store, clock) = setup(BucketWrite::default());
        let p = params(1, 1, 10);
        bucket.is_allowed(&p).await.unwrap();
        bucket.is_allowed(&p).await.unwrap();
        assert!(store.exists("bucket:noTokens:10.1.1.1").await.unwrap());
        clock.advance(Duration::from_secs(10));
        assert!(bucket.is_allowed(&p).await.unwrap().allowed);
        assert!(!store.exists("bucket:noTokens:10.1.1.1").await.unwrap());
    }

    #[tokio::test]
    async fn bucket_ttl_is_refreshed() {
        let (bucket, store, clock) = setup(BucketWrite::LastWriteWins);
        let mut p = params(5, 1, 10);
        p.bucket_ttl_secs = 30;
        bucket.is_allowed(&p).await.unwrap();
        clock.advance(Duration::from_secs(20));
        bucket.is_allowed(&p).await.unwrap();
        assert_eq!(store.ttl("bucket:10.1.1.1").await.unwrap(), Some(30));
    }

    #[tokio::test]
    async fn reset_matches_unseen_client() {
        let (bucket, _store, _clock) = setup(BucketWrite::default());
        let p = params(2, 1, 10);
        let fresh = bucket.is_allowed(&p).await.unwrap();
        bucket.is_allowed(&p).await.unwrap();
        bucket.is_allowed(&p).await.unwrap();
        bucket.reset("10.1.1.1").await.unwrap();
        assert_eq!(bucket.stored_tokens("10.1.1.1").await.unwrap(), None);
        assert_eq!(bucket.is_allowed(&p).await.unwrap(), fresh);
    }
}
