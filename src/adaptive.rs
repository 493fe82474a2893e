//! Load-driven per-endpoint limits.
//!
//! The controller keeps one request ceiling per registered route in a sharded concurrent map.
//! Every admission check (when adaptive limiting is on) samples a [`LoadGauge`] and compounds the
//! stored value by the high- or low-load multiplier. The table is a cache: [`reseed`] throws the
//! learned values away and starts again from the declared limits.
//!
//! [`reseed`]: AdaptiveLimitController::reseed

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::GlobalConfig;
use crate::policy::RouteTable;

/// Source of the current system load, typically CPU usage in `0.0..=1.0`.
pub trait LoadGauge: Send + Sync + std::fmt::Debug {
    /// Sample the load now. Never cached by the controller.
    fn load(&self) -> f64;
}

/// Load value set from outside, e.g. by a metrics poller.
///
/// Clones share the same value.
#[derive(Debug, Clone, Default)]
pub struct SharedLoad {
    bits: Arc<AtomicU64>,
}

impl SharedLoad {
    /// Gauge starting at `load`.
    pub fn new(load: f64) -> Self {
        Self { bits: Arc::new(AtomicU64::new(load.to_bits())) }
    }

    /// Publish a new sample.
    pub fn set(&self, load: f64) {
        self.bits.store(load.to_bits(), Ordering::Relaxed);
    }
}

impl LoadGauge for SharedLoad {
    fn load(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Per-endpoint limits that follow system load.
#[derive(Debug, Clone)]
pub struct AdaptiveLimitController {
    limits: Arc<DashMap<String, u32>>,
    default_max: Arc<AtomicU32>,
    gauge: Arc<dyn LoadGauge>,
}

impl AdaptiveLimitController {
    /// Controller sampling `gauge`, seeded from `routes`.
    pub fn new(gauge: Arc<dyn LoadGauge>, routes: &RouteTable, config: &GlobalConfig) -> Self {
        let controller =
            Self { limits: Arc::new(DashMap::new()), default_max: Arc::default(), gauge };
        controller.seed(routes, config);
        controller
    }

    /// Record each route's declared limit, or the global default for routes declaring none.
    ///
    /// Routes with neither are skipped; they can't be admitted anyway.
    pub fn seed(&self, routes: &RouteTable, config: &GlobalConfig) {
        self.track_default(config);
        for (id, policy) in routes.iter() {
            let declared = policy.and_then(|p| p.max_requests);
            if let Some(max) = declared.or(config.default_max_requests) {
                self.limits.insert(id.to_string(), max);
            }
        }
    }

    /// Drop every learned value and seed again.
    pub fn reseed(&self, routes: &RouteTable, config: &GlobalConfig) {
        self.limits.clear();
        self.seed(routes, config);
        let endpoints = self.limits.len();
        info!(target: "floodgate::adaptive", endpoints, "adaptive limits reseeded");
    }

    /// Sample the load and move `endpoint`'s limit one step, returning the new value.
    ///
    /// High load takes priority over low load. Results are truncated toward zero and replace the
    /// stored value, so repeated steps compound. Endpoints that were never seeded are computed
    /// from `global`'s current default and not remembered.
    pub fn adjust(&self, endpoint: &str, global: &GlobalConfig) -> u32 {
        self.track_default(global);
        let config = &global.adaptive;
        let load = self.gauge.load();
        let step = |current: u32| -> u32 {
            if config.decrease_on_high_load && load > config.high_load_threshold {
                scale(current, config.high_load_multiplier)
            } else if config.increase_on_low_load && load < config.low_load_threshold {
                scale(current, config.low_load_multiplier)
            } else {
                current
            }
        };

        let next = match self.limits.get_mut(endpoint) {
            Some(mut entry) => {
                *entry = step(*entry);
                *entry
            }
            None => step(self.default_max.load(Ordering::Relaxed)),
        };
        debug!(target: "floodgate::adaptive", endpoint, load, limit = next, "adaptive step");
        next
    }

    /// Current limit for `endpoint` without adjusting it.
    pub fn current_limit(&self, endpoint: &str) -> u32 {
        match self.limits.get(endpoint) {
            Some(limit) => *limit,
            None => self.default_max.load(Ordering::Relaxed),
        }
    }

    fn track_default(&self, config: &GlobalConfig) {
        self.default_max.store(config.default_max_requests.unwrap_or(0), Ordering::Relaxed);
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.limits.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

fn scale(value: u32, multiplier: f64) -> u32 {
    // `as` saturates and maps NaN to zero.
    (f64::from(value) * multiplier) as u32
}
