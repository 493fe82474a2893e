#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Floodgate
//!
//! Distributed HTTP admission control: per-client rate limiting whose state lives in a shared
//! counter store, so every instance behind a load balancer enforces the same limits.
//!
//! ## Features
//!
//! - **Four algorithms** selected at startup: fixed window, sliding window (same strategy),
//!   token bucket and leaky bucket
//! - **Global and per-route lists**: whitelists admit, blacklists reject
//! - **Suspension** of clients that keep hammering a limit
//! - **Fallback** when the shared store is down: admit degraded or fail closed
//! - **Adaptive limits** that follow system load
//! - **Tower middleware** for any `http` based service
//!
//! ## Quick Start
//!
//! ```rust
//! use floodgate::{AdmissionPipeline, GlobalConfig, InMemoryStore, RoutePolicy, RouteTable};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let routes = RouteTable::new()
//!         .route("/search", Some(RoutePolicy::new().max_requests(20).window_secs(60)))
//!         .route("/health", None);
//!     let pipeline = AdmissionPipeline::builder(Arc::new(InMemoryStore::new()))
//!         .config(GlobalConfig::default())
//!         .routes(routes)
//!         .build()
//!         .expect("valid configuration");
//!
//!     let decision = pipeline.decide_route("203.0.113.9", "/search").await;
//!     assert!(decision.admit);
//! }
//! ```

pub mod adaptive;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod middleware;
pub mod pipeline;
pub mod policy;
pub mod rate_limit;
pub mod store;
pub mod suspension;

// Re-exports
pub use adaptive::{AdaptiveLimitController, LoadGauge, SharedLoad};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AdaptiveConfig, Algorithm, BucketConfig, BucketWrite, ConfigHandle, FallbackStrategy,
    GlobalConfig, RouteBlacklistResponse, SuspensionConfig,
};
pub use error::{ConfigError, StoreError};
pub use health::{HealthReport, HealthStatus, StoreHealth, StorePing};
pub use identity::{resolve_client_id, ClientId};
pub use middleware::{rejection_response, AdmissionError, AdmissionLayer, AdmissionService};
pub use pipeline::{AdmissionPipeline, AdmissionPipelineBuilder, Decision, DecisionReason};
pub use policy::{RateLimitPolicy, RoutePolicy, RouteTable};
pub use rate_limit::{
    FixedWindowCounter, LeakyBucket, Limiter, RateLimitParams, RateLimiter, TokenBucket, Verdict,
};
pub use store::{CounterStore, HashFields, InMemoryStore, SharedStore};
pub use suspension::SuspensionTracker;
