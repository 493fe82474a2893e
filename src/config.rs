//! Process-wide admission configuration.
//!
//! Loading is left to the host (files, env, a control plane); with the `serde` feature every type
//! here deserializes from kebab-case keys. Readers take an immutable snapshot per request through
//! [`ConfigHandle`], so a reload never tears an in-flight decision.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Suspension length used when a non-positive duration is requested.
pub const DEFAULT_SUSPENSION_SECS: u64 = 600;

/// Lifetime of a leaky bucket hash after its last successful drain.
pub const LEAKY_BUCKET_TTL_SECS: u64 = 24 * 60 * 60;

/// Limiting algorithm, chosen once when the pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Algorithm {
    /// Counter per fixed interval, reset by key expiry.
    FixedWindow,
    /// Same strategy as [`Algorithm::FixedWindow`]; kept as a separate name for configs that
    /// ask for short, frequent windows.
    SlidingWindow,
    /// Capacity-bounded bucket refilled in discrete grants.
    TokenBucket,
    /// Capacity-bounded bucket refilled proportionally to elapsed time.
    #[default]
    LeakyBucket,
}

impl Algorithm {
    /// Stable lowercase name for logs and headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

/// What to do with a request when the shared store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum FallbackStrategy {
    /// Admit in degraded mode.
    #[default]
    Allow,
    /// Fail closed.
    Block,
}

/// How a route-level blacklist hit is reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RouteBlacklistResponse {
    /// Deny with `403 Forbidden` and the blacklist message.
    #[default]
    Forbidden,
    /// Deny without overriding the status; the host decides what to send.
    Silent,
}

/// How bucket algorithms commit their read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum BucketWrite {
    /// Optimistic concurrency: write only if the bucket is unchanged since it was read, retrying
    /// up to `max_attempts` times. Concurrent requests can never both spend the same token.
    CompareAndSet {
        /// Read-compute-write rounds before the request is denied for contention.
        #[cfg_attr(feature = "serde", serde(rename = "max-attempts"))]
        max_attempts: u32,
    },
    /// Plain overwrite with separate hash-write and expire calls. Two requests racing on one
    /// client may both spend the same token, so the limit is soft by one request per race.
    LastWriteWins,
}

impl Default for BucketWrite {
    fn default() -> Self {
        BucketWrite::CompareAndSet { max_attempts: 3 }
    }
}

/// Load-driven adjustment of per-endpoint limits.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct AdaptiveConfig {
    /// Master switch.
    pub enabled: bool,
    /// Load above which limits shrink.
    pub high_load_threshold: f64,
    /// Load below which limits grow.
    pub low_load_threshold: f64,
    /// Applied under high load; values below 1 shrink the limit.
    pub high_load_multiplier: f64,
    /// Applied under low load; values above 1 grow the limit.
    pub low_load_multiplier: f64,
    /// Allow shrinking under high load.
    pub decrease_on_high_load: bool,
    /// Allow growth under low load.
    pub increase_on_low_load: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            high_load_threshold: 0.8,
            low_load_threshold: 0.5,
            high_load_multiplier: 0.8,
            low_load_multiplier: 1.1,
            decrease_on_high_load: false,
            increase_on_low_load: false,
        }
    }
}

/// Repeat-offender suspension.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct SuspensionConfig {
    /// Hits (or empty-bucket hits) beyond which a client is suspended.
    pub threshold: i64,
    /// Suspension length; non-positive values fall back to [`DEFAULT_SUSPENSION_SECS`].
    pub duration_secs: i64,
}

impl Default for SuspensionConfig {
    fn default() -> Self {
        Self { threshold: 1000, duration_secs: DEFAULT_SUSPENSION_SECS as i64 }
    }
}

/// Token and leaky bucket parameters shared by every client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct BucketConfig {
    /// Maximum tokens per bucket. Non-positive capacity denies every request.
    pub capacity: i64,
    /// Tokens granted per refill event (token bucket).
    pub refill_rate: i64,
    /// Seconds that must pass before a refill event (token bucket).
    pub refill_interval_secs: u64,
    /// Token bucket key lifetime, refreshed on every drain.
    pub ttl_secs: u64,
    /// Tokens added per elapsed second (leaky bucket).
    pub drip_rate: i64,
    /// Commit strategy for the bucket read-modify-write.
    pub write: BucketWrite,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            refill_rate: 10,
            refill_interval_secs: 60,
            ttl_secs: 3 * 60,
            drip_rate: 60,
            write: BucketWrite::default(),
        }
    }
}

/// Process-wide defaults and switches.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct GlobalConfig {
    /// Requests per window when a route declares none. `None` means routes must declare one.
    pub default_max_requests: Option<u32>,
    /// Window length when a route declares none. `None` means routes must declare one.
    pub default_window_secs: Option<u64>,
    /// Clients admitted on every route.
    pub whitelist: HashSet<String>,
    /// Clients rejected on every route.
    pub blacklist: HashSet<String>,
    /// Fallback when neither the route nor anything else says otherwise.
    pub fallback: FallbackStrategy,
    /// Reporting style for route-level blacklist hits.
    pub route_blacklist_response: RouteBlacklistResponse,
    /// Load-driven limit adjustment.
    pub adaptive: AdaptiveConfig,
    /// Repeat-offender suspension.
    pub suspension: SuspensionConfig,
    /// Bucket defaults.
    pub bucket: BucketConfig,
    /// Algorithm used for every route.
    pub algorithm: Algorithm,
    /// Budget for one store round-trip before it counts as "store down".
    pub store_timeout_millis: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_max_requests: Some(100),
            default_window_secs: Some(60),
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
            fallback: FallbackStrategy::Allow,
            route_blacklist_response: RouteBlacklistResponse::Forbidden,
            adaptive: AdaptiveConfig::default(),
            suspension: SuspensionConfig::default(),
            bucket: BucketConfig::default(),
            algorithm: Algorithm::default(),
            store_timeout_millis: 3_000,
        }
    }
}

impl GlobalConfig {
    /// Store round-trip budget as a `Duration`.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_millis)
    }

    /// Suspension length with the non-positive substitution applied.
    pub fn suspension_secs(&self) -> u64 {
        effective_suspension_secs(self.suspension.duration_secs)
    }

    /// Reject values that would make limiting meaningless.
    ///
    /// Missing defaults are not an error here; they only matter for routes that rely on them,
    /// which [`crate::policy::RouteTable::validate`] checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(0) = self.default_max_requests {
            return Err(ConfigError::InvalidDefault { field: "default-max-requests", value: 0 });
        }
        if let Some(0) = self.default_window_secs {
            return Err(ConfigError::InvalidDefault { field: "default-window-secs", value: 0 });
        }
        if self.store_timeout_millis == 0 {
            return Err(ConfigError::InvalidDefault { field: "store-timeout-millis", value: 0 });
        }
        if let BucketWrite::CompareAndSet { max_attempts: 0 } = self.bucket.write {
            let field = "bucket.write.max-attempts";
            return Err(ConfigError::InvalidDefault { field, value: 0 });
        }
        if self.adaptive.enabled {
            let a = &self.adaptive;
            let (low, high) = (a.low_load_threshold, a.high_load_threshold);
            if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
                return Err(ConfigError::InvalidThresholds { low, high });
            }
            let m = a.high_load_multiplier;
            if !m.is_finite() || m <= 0.0 || m > 1.0 {
                return Err(ConfigError::InvalidMultiplier { which: "high-load", value: m });
            }
            let m = a.low_load_multiplier;
            if !m.is_finite() || m < 1.0 {
                return Err(ConfigError::InvalidMultiplier { which: "low-load", value: m });
            }
        }
        Ok(())
    }
}

/// Substitute [`DEFAULT_SUSPENSION_SECS`] for non-positive durations.
pub fn effective_suspension_secs(requested: i64) -> u64 {
    if requested <= 0 {
        DEFAULT_SUSPENSION_SECS
    } else {
        requested as u64
    }
}

/// Swappable configuration with lock-free snapshot reads.
///
/// Clones share the same slot; a `set` is visible to every clone on its next `get`.
#[derive(Debug)]
pub struct ConfigHandle<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for ConfigHandle<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> ConfigHandle<T> {
    /// Wrap an initial value.
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive a new value from the current one and swap it in.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| f(cur));
    }
}
