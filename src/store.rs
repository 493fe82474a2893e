//! Shared counter store contract.
//!
//! Every limiter keeps its per-client state behind this trait so that several service instances
//! pointed at the same backend enforce one limit. The contract mirrors a small subset of a
//! Redis-like key-value store: string counters with TTLs and flat string hashes.
//!
//! Each call is atomic on its own. Nothing here promises atomicity across two calls; the bucket
//! algorithms close that gap with [`CounterStore::hash_compare_and_set`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StoreError;

pub mod memory;

pub use memory::InMemoryStore;

/// Flat string hash as stored under one key.
pub type HashFields = HashMap<String, String>;

/// Shared, type-erased store handle used throughout the crate.
pub type SharedStore = Arc<dyn CounterStore>;

/// Abstract storage interface for admission state.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Atomically add `delta` to the integer under `key`, creating it at zero first.
    ///
    /// Returns the value after the update. An existing TTL is left untouched.
    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError>;

    /// Atomically add one to the integer under `key`.
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.increment_by(key, 1).await
    }

    /// Read a plain string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a plain string value that expires after `ttl_secs`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Set the TTL of an existing key. Missing keys are ignored.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining lifetime in seconds; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Read every field of the hash under `key`; an absent key reads as an empty map.
    async fn hash_get_all(&self, key: &str) -> Result<HashFields, StoreError>;

    /// Write `fields` into the hash under `key`, keeping fields not mentioned.
    async fn hash_set_all(&self, key: &str, fields: &HashFields) -> Result<(), StoreError>;

    /// Replace the hash under `key` with `fields` and set its TTL, but only if its current
    /// content equals `expected` (an empty `expected` means "the key must not exist").
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn hash_compare_and_set(
        &self,
        key: &str,
        expected: &HashFields,
        fields: &HashFields,
        ttl_secs: u64,
    ) -> Result<bool, StoreError>;

    /// Remove `key` regardless of its type.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Cheap liveness round-trip.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Parse an integer held in the store, naming the key on failure.
pub(crate) fn parse_int(key: &str, raw: &str) -> Result<i64, StoreError> {
    raw.trim().parse::<i64>().map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        detail: format!("`{raw}` is not an integer: {e}"),
    })
}

/// Parse an optional integer field out of a hash.
pub(crate) fn hash_int(
    key: &str,
    fields: &HashFields,
    field: &str,
) -> Result<Option<i64>, StoreError> {
    fields.get(field).map(|raw| parse_int(key, raw)).transpose()
}
