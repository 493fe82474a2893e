//! In-process store backed by a mutex-guarded map.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{parse_int, CounterStore, HashFields};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// New keys written between two full sweeps of expired entries.
const SWEEP_EVERY: u64 = 1_024;

#[derive(Debug, Clone)]
enum Value {
    Counter(String),
    Hash(HashFields),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_millis: Option<u64>,
}

/// Single-process [`CounterStore`].
///
/// Expired keys are evicted when touched, and every [`SWEEP_EVERY`] new keys the whole map is
/// swept, so one-off clients don't accumulate. Suitable for tests and single-instance
/// deployments. Clones share the same data. The store can be switched offline with
/// [`InMemoryStore::set_available`] to exercise fallback paths.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
    inserts: Arc<AtomicU64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store whose TTLs are evaluated against `clock`.
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
            available: Arc::new(AtomicBool::new(true)),
            inserts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate the backend going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        match self.data.lock() {
            Ok(map) => map.values().filter(|e| !is_expired(e, now)).count(),
            Err(_) => 0,
        }
    }

    /// Whether no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key now, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        Ok(sweep(&mut map, now))
    }

    fn insert(&self, map: &mut HashMap<String, Entry>, key: &str, entry: Entry, now: u64) {
        if map.insert(key.to_string(), entry).is_none()
            && self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1
        {
            sweep(map, now);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory store switched offline"));
        }
        self.data.lock().map_err(|_| StoreError::Poisoned)
    }

    fn deadline(&self, ttl_secs: u64) -> u64 {
        self.clock.now_millis().saturating_add(ttl_secs.saturating_mul(1_000))
    }
}

fn is_expired(entry: &Entry, now: u64) -> bool {
    entry.expires_at_millis.map_or(false, |at| at <= now)
}

fn sweep(map: &mut HashMap<String, Entry>, now: u64) -> usize {
    let before = map.len();
    map.retain(|_, e| !is_expired(e, now));
    before - map.len()
}

/// Fetch a live entry, evicting it first if its TTL has passed.
fn live<'a>(map: &'a mut HashMap<String, Entry>, key: &str, now: u64) -> Option<&'a mut Entry> {
    if map.get(key).map_or(false, |e| is_expired(e, now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn wrong_type(key: &str, expected: &str) -> StoreError {
    StoreError::Corrupt { key: key.to_string(), detail: format!("value is not a {expected}") }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        match live(&mut map, key, now) {
            Some(entry) => match &mut entry.value {
                Value::Counter(raw) => {
                    let next = parse_int(key, raw)?.saturating_add(delta);
                    *raw = next.to_string();
                    Ok(next)
                }
                Value::Hash(_) => Err(wrong_type(key, "counter")),
            },
            None => {
                let entry =
                    Entry { value: Value::Counter(delta.to_string()), expires_at_millis: None };
                self.insert(&mut map, key, entry, now);
                Ok(delta)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        match live(&mut map, key, now) {
            Some(Entry { value: Value::Counter(raw), .. }) => Ok(Some(raw.clone())),
            Some(_) => Err(wrong_type(key, "string")),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let deadline = self.deadline(ttl_secs);
        let mut map = self.lock()?;
        let entry =
            Entry { value: Value::Counter(value.to_string()), expires_at_millis: Some(deadline) };
        self.insert(&mut map, key, entry, now);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let deadline = self.deadline(ttl_secs);
        let mut map = self.lock()?;
        if let Some(entry) = live(&mut map, key, now) {
            entry.expires_at_millis = Some(deadline);
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        Ok(live(&mut map, key, now).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        Ok(live(&mut map, key, now)
            .and_then(|e| e.expires_at_millis)
            .map(|at| (at.saturating_sub(now) + 999) / 1_000))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashFields, StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        match live(&mut map, key, now) {
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key, "hash")),
            None => Ok(HashFields::new()),
        }
    }

    async fn hash_set_all(&self, key: &str, fields: &HashFields) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let mut map = self.lock()?;
        match live(&mut map, key, now) {
            Some(Entry { value: Value::Hash(current), .. }) => {
                current.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(())
            }
            Some(_) => Err(wrong_type(key, "hash")),
            None => {
                let entry = Entry { value: Value::Hash(fields.clone()), expires_at_millis: None };
                self.insert(&mut map, key, entry, now);
                Ok(())
            }
        }
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        expected: &HashFields,
        fields: &HashFields,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let deadline = self.deadline(ttl_secs);
        let mut map = self.lock()?;
        let matches = match live(&mut map, key, now) {
            Some(Entry { value: Value::Hash(current), .. }) => *current == *expected,
            Some(_) => return Err(wrong_type(key, "hash")),
            None => expected.is_empty(),
        };
        if !matches {
            return Ok(false);
        }
        let entry = Entry { value: Value::Hash(fields.clone()), expires_at_millis: Some(deadline) };
        self.insert(&mut map, key, entry, now);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut map = self.lock()?;
        map.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}
