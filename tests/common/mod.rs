#![allow(dead_code)]

use async_trait::async_trait;
use floodgate::store::{CounterStore, HashFields};
use floodgate::{
    AdmissionPipeline, Algorithm, GlobalConfig, InMemoryStore, ManualClock, RouteTable, StoreError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Barrier;

pub const START_SECS: u64 = 1_700_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn config(algorithm: Algorithm, max: u32) -> GlobalConfig {
    GlobalConfig { algorithm, default_max_requests: Some(max), ..GlobalConfig::default() }
}

pub fn pipeline(
    store: impl CounterStore + 'static,
    config: GlobalConfig,
    routes: RouteTable,
    clock: ManualClock,
) -> AdmissionPipeline {
    AdmissionPipeline::builder(Arc::new(store))
        .config(config)
        .routes(routes)
        .clock(clock)
        .build()
        .expect("valid test configuration")
}

struct Gate {
    barrier: Arc<Barrier>,
    reads_left: usize,
}

/// In-memory store with switchable faults.
///
/// `ping` is never faulted, so the health check keeps reporting "up" while data calls fail,
/// which is how a store dying between two calls looks to the pipeline.
#[derive(Clone)]
pub struct FaultyStore {
    pub inner: InMemoryStore,
    fail_data: Arc<AtomicBool>,
    hang_data: Arc<AtomicBool>,
    gate: Arc<Mutex<Option<Gate>>>,
}

impl std::fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyStore").field("inner", &self.inner).finish()
    }
}

impl FaultyStore {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            inner: InMemoryStore::with_clock(clock),
            fail_data: Arc::new(AtomicBool::new(false)),
            hang_data: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(Mutex::new(None)),
        }
    }

    /// Make every data call fail with `Unavailable`.
    pub fn fail_data(&self, fail: bool) {
        self.fail_data.store(fail, Ordering::SeqCst);
    }

    /// Make every data call hang forever.
    pub fn hang_data(&self, hang: bool) {
        self.hang_data.store(hang, Ordering::SeqCst);
    }

    /// Hold the next `reads` hash reads at a barrier of `parties`, after they have read.
    ///
    /// Concurrent bucket checks then all see the same state before any of them writes.
    pub fn gate_hash_reads(&self, parties: usize, reads: usize) {
        let gate = Gate { barrier: Arc::new(Barrier::new(parties)), reads_left: reads };
        *self.gate.lock().unwrap() = Some(gate);
    }

    async fn guard(&self) -> Result<(), StoreError> {
        if self.hang_data.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_data.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected fault"));
        }
        Ok(())
    }

    fn take_gate(&self) -> Option<Arc<Barrier>> {
        let mut slot = self.gate.lock().unwrap();
        let gate = slot.as_mut()?;
        if gate.reads_left == 0 {
            return None;
        }
        gate.reads_left -= 1;
        Some(gate.barrier.clone())
    }
}

#[async_trait]
impl CounterStore for FaultyStore {
    async fn increment_by(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.guard().await?;
        self.inner.increment_by(key, delta).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.guard().await?;
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.guard().await?;
        self.inner.set_with_ttl(key, value, ttl_secs).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.guard().await?;
        self.inner.expire(key, ttl_secs).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.guard().await?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.guard().await?;
        self.inner.ttl(key).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashFields, StoreError> {
        self.guard().await?;
        let fields = self.inner.hash_get_all(key).await?;
        if let Some(barrier) = self.take_gate() {
            barrier.wait().await;
        }
        Ok(fields)
    }

    async fn hash_set_all(&self, key: &str, fields: &HashFields) -> Result<(), StoreError> {
        self.guard().await?;
        self.inner.hash_set_all(key, fields).await
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        expected: &HashFields,
        fields: &HashFields,
        ttl_secs: u64,
    ) -> Result<bool, StoreError> {
        self.guard().await?;
        self.inner.hash_compare_and_set(key, expected, fields, ttl_secs).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.guard().await?;
        self.inner.delete(key).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}
