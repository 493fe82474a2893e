//! Shared store health signal.
//!
//! The pipeline polls this once per request and never caches the answer: a store that just came
//! back is used on the very next request.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::config::{ConfigHandle, GlobalConfig};
use crate::error::StoreError;
use crate::store::SharedStore;

/// Up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum HealthStatus {
    /// The store answered in time.
    Up,
    /// The store failed or timed out; fallback applies.
    Down,
}

/// Detailed probe result for diagnostics endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Round-trip time of the probe.
    pub latency: Duration,
    /// Why the probe failed, when it did.
    pub error: Option<String>,
}

/// Anything that can tell whether the shared store is usable right now.
#[async_trait]
pub trait StoreHealth: Send + Sync + std::fmt::Debug {
    /// Probe with details.
    async fn report(&self) -> HealthReport;

    /// Probe, keeping only the verdict.
    async fn status(&self) -> HealthStatus {
        self.report().await.status
    }
}

#[derive(Debug, Clone)]
enum PingBudget {
    Fixed(Duration),
    Live(ConfigHandle<GlobalConfig>),
}

/// Health from a `PING` round-trip bounded by a timeout.
#[derive(Debug, Clone)]
pub struct StorePing {
    store: SharedStore,
    budget: PingBudget,
}

impl StorePing {
    /// Probe `store`, giving up after `timeout`.
    pub fn new(store: SharedStore, timeout: Duration) -> Self {
        Self { store, budget: PingBudget::Fixed(timeout) }
    }

    /// Probe `store` under whatever `store_timeout_millis` the handle holds at probe time.
    pub fn following(store: SharedStore, config: ConfigHandle<GlobalConfig>) -> Self {
        Self { store, budget: PingBudget::Live(config) }
    }

    /// Timeout the next probe will use.
    pub fn timeout(&self) -> Duration {
        match &self.budget {
            PingBudget::Fixed(timeout) => *timeout,
            PingBudget::Live(config) => config.get().store_timeout(),
        }
    }
}

#[async_trait]
impl StoreHealth for StorePing {
    async fn report(&self) -> HealthReport {
        let timeout = self.timeout();
        let start = Instant::now();
        let outcome = match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(timeout)),
        };
        let latency = start.elapsed();
        match outcome {
            Ok(()) => HealthReport { status: HealthStatus::Up, latency, error: None },
            Err(e) => {
                warn!(target: "floodgate::health", error = %e, "shared store is down");
                HealthReport { status: HealthStatus::Down, latency, error: Some(e.to_string()) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CounterStore, HashFields, InMemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn reachable_store_is_up() {
        let probe = StorePing::new(Arc::new(InMemoryStore::new()), Duration::from_secs(1));
        let report = probe.report().await;
        assert_eq!(report.status, HealthStatus::Up);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn every_poll_sees_the_current_state() {
        let store = InMemoryStore::new();
        let probe = StorePing::new(Arc::new(store.clone()), Duration::from_secs(1));
        store.set_available(false);
        let report = probe.report().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.error.unwrap().contains("unavailable"));

        store.set_available(true);
        assert_eq!(probe.status().await, HealthStatus::Up);
    }

    #[derive(Debug)]
    struct Hanging;

    #[async_trait]
    impl CounterStore for Hanging {
        async fn increment_by(&self, _: &str, _: i64) -> Result<i64, StoreError> {
            Ok(0)
        }
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
        async fn set_with_ttl(&self, _: &str, _: &str, _: u64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn expire(&self, _: &str, _: u64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn exists(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn ttl(&self, _: &str) -> Result<Option<u64>, StoreError> {
            Ok(None)
        }
        async fn hash_get_all(&self, _: &str) -> Result<HashFields, StoreError> {
            Ok(HashFields::new())
        }
        async fn hash_set_all(&self, _: &str, _: &HashFields) -> Result<(), StoreError> {
            Ok(())
        }
        async fn hash_compare_and_set(
            &self,
            _: &str,
            _: &HashFields,
            _: &HashFields,
            _: u64,
        ) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn live_budget_picks_up_reloaded_timeout() {
        let config = ConfigHandle::new(GlobalConfig::default());
        let probe = StorePing::following(Arc::new(Hanging), config.clone());
        assert_eq!(probe.timeout(), Duration::from_secs(3));

        config.update(|c| GlobalConfig { store_timeout_millis: 75, ..c.clone() });
        assert_eq!(probe.timeout(), Duration::from_millis(75));
        let report = probe.report().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.error.unwrap().contains("75ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ping_counts_as_down() {
        let probe = StorePing::new(Arc::new(Hanging), Duration::from_millis(50));
        let report = probe.report().await;
        assert_eq!(report.status, HealthStatus::Down);
        assert!(report.error.unwrap().contains("timed out"));
    }
}
