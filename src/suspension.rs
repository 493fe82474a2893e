//! Temporary suspension of repeat offenders.
//!
//! A suspension is nothing but the presence of `suspended:{client}` in the shared store; its TTL
//! is the remaining suspension time. Every check is a single-key operation, so it is race-free
//! across instances.

use tracing::warn;

use crate::config::effective_suspension_secs;
use crate::error::StoreError;
use crate::store::SharedStore;

/// Store key holding the suspension flag for `client`.
pub fn suspension_key(client: &str) -> String {
    format!("suspended:{client}")
}

/// Marks, queries and clears suspensions.
#[derive(Debug, Clone)]
pub struct SuspensionTracker {
    store: SharedStore,
}

impl SuspensionTracker {
    /// Tracker over `store`.
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Whether `client` is currently suspended.
    pub async fn is_suspended(&self, client: &str) -> Result<bool, StoreError> {
        self.store.exists(&suspension_key(client)).await
    }

    /// Suspend `client` for `duration_secs`; non-positive durations become the 600 s default.
    pub async fn suspend(&self, client: &str, duration_secs: i64) -> Result<(), StoreError> {
        let secs = effective_suspension_secs(duration_secs);
        self.store.set_with_ttl(&suspension_key(client), "true", secs).await?;
        warn!(target: "floodgate::suspension", client, secs, "client suspended");
        Ok(())
    }

    /// Lift a suspension early.
    pub async fn remove_suspension(&self, client: &str) -> Result<(), StoreError> {
        self.store.delete(&suspension_key(client)).await
    }

    /// Seconds left on the suspension; zero when the client is not suspended.
    pub async fn remaining_suspension_secs(&self, client: &str) -> Result<u64, StoreError> {
        Ok(self.store.ttl(&suspension_key(client)).await?.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn tracker() -> (SuspensionTracker, ManualClock) {
        let clock = ManualClock::at_secs(10_000);
        let store = InMemoryStore::with_clock(clock.clone());
        (SuspensionTracker::new(Arc::new(store)), clock)
    }

    #[tokio::test]
    async fn suspend_then_expire() {
        let (tracker, clock) = tracker();
        assert!(!tracker.is_suspended("1.1.1.1").await.unwrap());

        tracker.suspend("1.1.1.1", 30).await.unwrap();
        assert!(tracker.is_suspended("1.1.1.1").await.unwrap());
        assert_eq!(tracker.remaining_suspension_secs("1.1.1.1").await.unwrap(), 30);

        clock.advance(Duration::from_secs(30));
        assert!(!tracker.is_suspended("1.1.1.1").await.unwrap());
        assert_eq!(tracker.remaining_suspension_secs("1.1.1.1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_positive_duration_uses_safe_default() {
        let (tracker, clock) = tracker();
        tracker.suspend("c", 0).await.unwrap();
        assert_eq!(tracker.remaining_suspension_secs("c").await.unwrap(), 600);

        tracker.suspend("d", -1).await.unwrap();
        clock.advance(Duration::from_secs(599));
        assert!(tracker.is_suspended("d").await.unwrap());
    }

    #[tokio::test]
    async fn removal_clears_immediately() {
        let (tracker, _clock) = tracker();
        tracker.suspend("c", 60).await.unwrap();
        tracker.remove_suspension("c").await.unwrap();
        assert!(!tracker.is_suspended("c").await.unwrap());
    }

    #[tokio::test]
    async fn store_failure_propagates() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let tracker = SuspensionTracker::new(Arc::new(store));
        assert!(tracker.is_suspended("c").await.is_err());
    }
}
