//! Rate limiting algorithms.
//!
//! This module provides the building blocks for a per-client verdict:
//! - [`RateLimiter`]: the core trait every algorithm implements.
//! - [`Verdict`]: the result of one check (allowed + remaining quota).
//! - [`Limiter`]: the algorithm selected at startup, as a tagged variant.
//!
//! # Architecture
//!
//! - **Logic**: [`FixedWindowCounter`], [`TokenBucket`] and [`LeakyBucket`] each own one temporal
//!   model (fixed intervals, discrete refills, continuous drip).
//! - **Storage**: all state lives behind [`CounterStore`](crate::store::CounterStore) so that
//!   every instance sharing a backend enforces the same limit.
//! - **Suspension**: every algorithm consults the
//!   [`SuspensionTracker`](crate::suspension::SuspensionTracker) itself, and marks repeat
//!   offenders.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use crate::clock::Clock;
use crate::config::{Algorithm, BucketWrite, GlobalConfig};
use crate::error::StoreError;
use crate::store::{HashFields, SharedStore};

pub mod fixed_window;
pub mod leaky_bucket;
pub mod token_bucket;

pub use fixed_window::FixedWindowCounter;
pub use leaky_bucket::LeakyBucket;
pub use token_bucket::TokenBucket;

/// Outcome of one algorithm check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Quota figure reported in `X-Remaining-Requests`.
    ///
    /// Buckets report the tokens left after this request. The window counter reports the raw
    /// stored hit count for the current window.
    pub remaining: i64,
}

impl Verdict {
    /// Admit with the given remaining figure.
    pub fn allow(remaining: i64) -> Self {
        Self { allowed: true, remaining }
    }

    /// Reject with the given remaining figure.
    pub fn deny(remaining: i64) -> Self {
        Self { allowed: false, remaining }
    }
}

/// Everything an algorithm needs for one check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitParams {
    /// Client partition key.
    pub identifier: String,
    /// Requests per window (window counter).
    pub max_requests: u32,
    /// Window length in seconds (window counter).
    pub window_secs: u64,
    /// Bucket capacity.
    pub bucket_capacity: i64,
    /// Tokens per refill event (token bucket).
    pub refill_rate: i64,
    /// Seconds between refill events (token bucket).
    pub refill_interval_secs: u64,
    /// Token bucket key lifetime.
    pub bucket_ttl_secs: u64,
    /// Tokens per second (leaky bucket).
    pub drip_rate: i64,
    /// Hits beyond which the client is suspended.
    pub suspension_threshold: i64,
    /// Suspension length.
    pub suspension_duration_secs: i64,
}

impl RateLimitParams {
    /// Assemble parameters from the resolved limit and window plus global bucket and
    /// suspension settings.
    pub fn new(
        identifier: impl Into<String>,
        max_requests: u32,
        window_secs: u64,
        config: &GlobalConfig,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            max_requests,
            window_secs,
            bucket_capacity: config.bucket.capacity,
            refill_rate: config.bucket.refill_rate,
            refill_interval_secs: config.bucket.refill_interval_secs,
            bucket_ttl_secs: config.bucket.ttl_secs,
            drip_rate: config.bucket.drip_rate,
            suspension_threshold: config.suspension.threshold,
            suspension_duration_secs: config.suspension.duration_secs,
        }
    }
}

/// Write a bucket's new fields according to the configured commit strategy.
///
/// Returns `false` only under [`BucketWrite::CompareAndSet`], when `current` no longer matches
/// what is stored and the caller should re-read.
pub(crate) async fn commit_bucket(
    store: &SharedStore,
    write: BucketWrite,
    key: &str,
    current: &HashFields,
    next: &HashFields,
    ttl_secs: u64,
) -> Result<bool, StoreError> {
    match write {
        BucketWrite::CompareAndSet { .. } => {
            store.hash_compare_and_set(key, current, next, ttl_secs).await
        }
        BucketWrite::LastWriteWins => {
            store.hash_set_all(key, next).await?;
            store.expire(key, ttl_secs).await?;
            Ok(true)
        }
    }
}

/// Start the TTL on a counter the caller just created.
///
/// When the expire fails the counter is deleted again, so the next request opens a fresh window
/// instead of incrementing a key that never expires.
pub(crate) async fn start_ttl(
    store: &SharedStore,
    key: &str,
    ttl_secs: u64,
) -> Result<(), StoreError> {
    let Err(e) = store.expire(key, ttl_secs).await else {
        return Ok(());
    };
    if let Err(cleanup) = store.delete(key).await {
        warn!(
            target: "floodgate::rate_limit",
            key,
            error = %cleanup,
            "could not drop counter after failed expire"
        );
    }
    Err(e)
}

/// Read-compute-write rounds a bucket check may take.
pub(crate) fn commit_attempts(write: BucketWrite) -> u32 {
    match write {
        BucketWrite::CompareAndSet { max_attempts } => max_attempts.max(1),
        BucketWrite::LastWriteWins => 1,
    }
}

/// Core interface for limiting logic.
#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Decide whether one more request from `params.identifier` fits.
    ///
    /// Errors mean the shared store failed mid-check; callers treat that as "store down".
    async fn is_allowed(&self, params: &RateLimitParams) -> Result<Verdict, StoreError>;

    /// Drop all per-client state so the client looks never seen.
    async fn reset(&self, identifier: &str) -> Result<(), StoreError>;
}

/// The configured algorithm, chosen once when the pipeline is built.
#[derive(Debug, Clone)]
pub enum Limiter {
    /// Fixed window counter.
    FixedWindow(FixedWindowCounter),
    /// Fixed window counter under its "sliding window" name.
    SlidingWindow(FixedWindowCounter),
    /// Discretely refilled bucket.
    TokenBucket(TokenBucket),
    /// Continuously refilled bucket.
    LeakyBucket(LeakyBucket),
}

impl Limiter {
    /// Build the limiter for `algorithm` over a shared store.
    pub fn new(
        algorithm: Algorithm,
        store: SharedStore,
        clock: Arc<dyn Clock>,
        write: BucketWrite,
    ) -> Self {
        match algorithm {
            Algorithm::FixedWindow => Limiter::FixedWindow(FixedWindowCounter::new(store)),
            Algorithm::SlidingWindow => Limiter::SlidingWindow(FixedWindowCounter::new(store)),
            Algorithm::TokenBucket => Limiter::TokenBucket(TokenBucket::new(store, clock, write)),
            Algorithm::LeakyBucket => Limiter::LeakyBucket(LeakyBucket::new(store, clock, write)),
        }
    }

    /// Which algorithm this is.
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Limiter::FixedWindow(_) => Algorithm::FixedWindow,
            Limiter::SlidingWindow(_) => Algorithm::SlidingWindow,
            Limiter::TokenBucket(_) => Algorithm::TokenBucket,
            Limiter::LeakyBucket(_) => Algorithm::LeakyBucket,
        }
    }
}

#[async_trait]
impl RateLimiter for Limiter {
    async fn is_allowed(&self, params: &RateLimitParams) -> Result<Verdict, StoreError> {
        match self {
            Limiter::FixedWindow(l) | Limiter::SlidingWindow(l) => l.is_allowed(params).await,
            Limiter::TokenBucket(l) => l.is_allowed(params).await,
            Limiter::LeakyBucket(l) => l.is_allowed(params).await,
        }
    }

    async fn reset(&self, identifier: &str) -> Result<(), StoreError> {
        match self {
            Limiter::FixedWindow(l) | Limiter::SlidingWindow(l) => l.reset(identifier).await,
            Limiter::TokenBucket(l) => l.reset(identifier).await,
            Limiter::LeakyBucket(l) => l.reset(identifier).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::InMemoryStore;

    #[test]
    fn params_pull_bucket_and_suspension_settings() {
        let mut cfg = GlobalConfig::default();
        cfg.bucket.capacity = 7;
        cfg.suspension.threshold = 3;
        let p = RateLimitParams::new("c", 5, 10, &cfg);
        assert_eq!(p.identifier, "c");
        assert_eq!((p.max_requests, p.window_secs), (5, 10));
        assert_eq!(p.bucket_capacity, 7);
        assert_eq!(p.suspension_threshold, 3);
        assert_eq!(p.drip_rate, 60);
    }

    #[test]
    fn limiter_reports_selected_algorithm() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
            Algorithm::LeakyBucket,
        ] {
            let clock = Arc::new(SystemClock);
            let limiter = Limiter::new(algorithm, store.clone(), clock, BucketWrite::default());
            assert_eq!(limiter.algorithm(), algorithm);
        }
    }

    #[tokio::test]
    async fn sliding_window_shares_the_window_strategy() {
        let store: SharedStore = Arc::new(InMemoryStore::new());
        let limiter = Limiter::new(
            Algorithm::SlidingWindow,
            store.clone(),
            Arc::new(SystemClock),
            BucketWrite::default(),
        );
        let params = RateLimitParams::new("c", 1, 60, &GlobalConfig::default());
        assert!(limiter.is_allowed(&params).await.unwrap().allowed);
        assert!(!limiter.is_allowed(&params).await.unwrap().allowed);
        assert_eq!(store.get("rate_limit:c").await.unwrap().as_deref(), Some("2"));
    }
}
