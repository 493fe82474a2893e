//! The admission pipeline.
//!
//! One call to [`AdmissionPipeline::decide`] walks a fixed sequence of checks and stops at the
//! first one that decides:
//!
//! 1. global whitelist: admit
//! 2. global blacklist: `403`
//! 3. route whitelist: admit
//! 4. route blacklist: `403`, or a silent deny (see
//!    [`RouteBlacklistResponse`](crate::config::RouteBlacklistResponse))
//! 5. store health: when down, the fallback strategy decides
//! 6. suspension: `429`
//! 7. the configured algorithm: admit or `429`, with `X-Remaining-Requests`
//!
//! Nothing on this path returns an error. A store call that fails or exceeds the configured
//! budget is treated as "store down" for that request and routed to the fallback.

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::adaptive::{AdaptiveLimitController, LoadGauge, SharedLoad};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigHandle, FallbackStrategy, GlobalConfig, RouteBlacklistResponse};
use crate::error::{ConfigError, StoreError};
use crate::health::{HealthStatus, StoreHealth, StorePing};
use crate::policy::{RateLimitPolicy, RoutePolicy, RouteTable};
use crate::rate_limit::{Limiter, RateLimitParams, RateLimiter};
use crate::store::SharedStore;
use crate::suspension::SuspensionTracker;

/// Response header carrying the algorithm's remaining figure.
pub static REMAINING_REQUESTS: HeaderName = HeaderName::from_static("x-remaining-requests");
/// Response header set on requests admitted under the allow fallback. Carries
/// [`DEGRADED_MESSAGE`].
pub static SERVICE_DEGRADED: HeaderName = HeaderName::from_static("x-service-degraded");

/// Body message for blacklisted clients.
pub const BLACKLISTED_MESSAGE: &str = "You have been blacklisted.";
/// Body message when the store is down and the request is admitted anyway.
pub const DEGRADED_MESSAGE: &str = "Service is currently experiencing issues, \
    but your request is being processed with degraded performance.";
/// Body message when the store is down and the request is refused.
pub const UNAVAILABLE_MESSAGE: &str = "Service is currently unavailable due to technical issues.";

/// Which step of the pipeline produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionReason {
    /// Client is on the global whitelist.
    GlobalWhitelist,
    /// Client is on the global blacklist.
    GlobalBlacklist,
    /// Client is on the route whitelist.
    RouteWhitelist,
    /// Client is on the route blacklist.
    RouteBlacklist,
    /// Store is down; admitted under the allow fallback.
    Degraded,
    /// Store is down; refused under the block fallback.
    Unavailable,
    /// Client is serving a suspension.
    Suspended,
    /// The algorithm admitted the request.
    WithinLimit,
    /// The algorithm refused the request.
    LimitExceeded,
    /// Neither the route nor the globals supply a limit and window.
    Unconfigured,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may reach the handler.
    pub admit: bool,
    /// Status the host should respond with, when the pipeline dictates one.
    pub status: Option<StatusCode>,
    /// Remaining figure reported by the algorithm, when it ran.
    pub remaining: Option<i64>,
    /// Headers to add to the response.
    pub headers: HeaderMap,
    /// Message for the JSON response body, when there is one.
    pub message: Option<&'static str>,
    /// Step that decided.
    pub reason: DecisionReason,
}

impl Decision {
    fn admit(reason: DecisionReason) -> Self {
        Self {
            admit: true,
            status: None,
            remaining: None,
            headers: HeaderMap::new(),
            message: None,
            reason,
        }
    }

    fn deny(status: Option<StatusCode>, reason: DecisionReason) -> Self {
        Self { admit: false, status, ..Self::admit(reason) }
    }

    fn with_message(mut self, message: &'static str) -> Self {
        self.message = Some(message);
        self
    }

    fn with_remaining(mut self, remaining: i64) -> Self {
        self.remaining = Some(remaining);
        self.headers.insert(REMAINING_REQUESTS.clone(), HeaderValue::from(remaining));
        self
    }

    /// JSON body `{"message": "..."}` for decisions that carry a message.
    pub fn body(&self) -> Option<String> {
        self.message.map(|m| format!(r#"{{"message": "{m}"}}"#))
    }
}

/// Entry point that ties configuration, algorithm, suspension, health and adaptive limits
/// together.
///
/// Cheap to clone; clones share every component.
#[derive(Debug, Clone)]
pub struct AdmissionPipeline {
    config: ConfigHandle<GlobalConfig>,
    routes: Arc<RouteTable>,
    limiter: Limiter,
    suspension: SuspensionTracker,
    health: Arc<dyn StoreHealth>,
    adaptive: AdaptiveLimitController,
}

impl AdmissionPipeline {
    /// Start building a pipeline over `store`.
    pub fn builder(store: SharedStore) -> AdmissionPipelineBuilder {
        AdmissionPipelineBuilder::new(store)
    }

    /// Live configuration handle; `set` takes effect on the next request.
    ///
    /// The algorithm is fixed at build time and ignores later changes to
    /// [`GlobalConfig::algorithm`].
    pub fn config(&self) -> &ConfigHandle<GlobalConfig> {
        &self.config
    }

    /// Registered routes.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Algorithm in use.
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// Adaptive limit table.
    pub fn adaptive(&self) -> &AdaptiveLimitController {
        &self.adaptive
    }

    /// Suspension tracker over the same store.
    pub fn suspension(&self) -> &SuspensionTracker {
        &self.suspension
    }

    /// Decide for a request to `path`, looking its policy up in the route table.
    pub async fn decide_route(&self, client: &str, path: &str) -> Decision {
        self.decide(client, path, self.routes.policy(path)).await
    }

    /// Decide whether `client` may call `path` under the optional route policy.
    pub async fn decide(&self, client: &str, path: &str, route: Option<&RoutePolicy>) -> Decision {
        let config = self.config.get();
        let decision = self.evaluate(&config, client, path, route).await;
        debug!(
            target: "floodgate::pipeline",
            client,
            path,
            admit = decision.admit,
            reason = ?decision.reason,
            remaining = ?decision.remaining,
            "admission decided"
        );
        decision
    }

    async fn evaluate(
        &self,
        config: &GlobalConfig,
        client: &str,
        path: &str,
        route: Option<&RoutePolicy>,
    ) -> Decision {
        if config.whitelist.contains(client) {
            return Decision::admit(DecisionReason::GlobalWhitelist);
        }
        if config.blacklist.contains(client) {
            return Decision::deny(Some(StatusCode::FORBIDDEN), DecisionReason::GlobalBlacklist)
                .with_message(BLACKLISTED_MESSAGE);
        }
        if let Some(route) = route {
            if route.whitelist.contains(client) {
                return Decision::admit(DecisionReason::RouteWhitelist);
            }
            if route.blacklist.contains(client) {
                return match config.route_blacklist_response {
                    RouteBlacklistResponse::Forbidden => {
                        Decision::deny(Some(StatusCode::FORBIDDEN), DecisionReason::RouteBlacklist)
                            .with_message(BLACKLISTED_MESSAGE)
                    }
                    RouteBlacklistResponse::Silent => {
                        Decision::deny(None, DecisionReason::RouteBlacklist)
                    }
                };
            }
        }

        let fallback = route.and_then(|r| r.fallback).unwrap_or(config.fallback);
        if self.health.status().await == HealthStatus::Down {
            return degrade(fallback, client, "store health check failed");
        }

        let budget = config.store_timeout();
        match bounded(budget, self.suspension.is_suspended(client)).await {
            Ok(true) => {
                let status = Some(StatusCode::TOO_MANY_REQUESTS);
                return Decision::deny(status, DecisionReason::Suspended);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    target: "floodgate::pipeline",
                    client,
                    error = %e,
                    "suspension lookup failed"
                );
                return degrade(fallback, client, "suspension lookup failed");
            }
        }

        let policy = match RateLimitPolicy::resolve(path, route, config) {
            Ok(policy) => policy,
            Err(e) => {
                error!(
                    target: "floodgate::pipeline",
                    path,
                    error = %e,
                    "no limit applies; denying"
                );
                return Decision::deny(None, DecisionReason::Unconfigured);
            }
        };

        let adapted = config.adaptive.enabled.then(|| self.adaptive.adjust(path, config));
        let max_requests = if policy.route_override {
            policy.max_requests
        } else {
            adapted.unwrap_or(policy.max_requests)
        };

        let params = RateLimitParams::new(client, max_requests, policy.window_secs, config);
        match bounded(budget, self.limiter.is_allowed(&params)).await {
            Ok(verdict) if verdict.allowed => {
                Decision::admit(DecisionReason::WithinLimit).with_remaining(verdict.remaining)
            }
            Ok(verdict) => {
                Decision::deny(Some(StatusCode::TOO_MANY_REQUESTS), DecisionReason::LimitExceeded)
                    .with_remaining(verdict.remaining)
            }
            Err(e) => {
                warn!(
                    target: "floodgate::pipeline",
                    client,
                    algorithm = self.limiter.algorithm().as_str(),
                    error = %e,
                    "algorithm check failed"
                );
                degrade(policy.fallback, client, "algorithm check failed")
            }
        }
    }

    /// Return `client` to the never-seen state: algorithm keys and any suspension are removed.
    pub async fn reset_client(&self, client: &str) -> Result<(), StoreError> {
        self.limiter.reset(client).await?;
        self.suspension.remove_suspension(client).await
    }
}

fn degrade(fallback: FallbackStrategy, client: &str, cause: &'static str) -> Decision {
    warn!(target: "floodgate::pipeline", client, cause, ?fallback, "store down; applying fallback");
    match fallback {
        FallbackStrategy::Allow => {
            let mut admitted =
                Decision::admit(DecisionReason::Degraded).with_message(DEGRADED_MESSAGE);
            admitted
                .headers
                .insert(SERVICE_DEGRADED.clone(), HeaderValue::from_static(DEGRADED_MESSAGE));
            Decision { status: Some(StatusCode::OK), ..admitted }
        }
        FallbackStrategy::Block => {
            Decision::deny(Some(StatusCode::TOO_MANY_REQUESTS), DecisionReason::Unavailable)
                .with_message(UNAVAILABLE_MESSAGE)
        }
    }
}

async fn bounded<T, F>(budget: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(budget)),
    }
}

/// Builder for [`AdmissionPipeline`].
pub struct AdmissionPipelineBuilder {
    store: SharedStore,
    config: Option<ConfigHandle<GlobalConfig>>,
    routes: RouteTable,
    clock: Arc<dyn Clock>,
    health: Option<Arc<dyn StoreHealth>>,
    gauge: Option<Arc<dyn LoadGauge>>,
}

impl AdmissionPipelineBuilder {
    /// Builder with default configuration, no routes and the system clock.
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            config: None,
            routes: RouteTable::new(),
            clock: Arc::new(SystemClock),
            health: None,
            gauge: None,
        }
    }

    /// Use a fixed configuration.
    pub fn config(mut self, config: GlobalConfig) -> Self {
        self.config = Some(ConfigHandle::new(config));
        self
    }

    /// Share an existing configuration handle, e.g. one a reloader writes to.
    pub fn config_handle(mut self, handle: ConfigHandle<GlobalConfig>) -> Self {
        self.config = Some(handle);
        self
    }

    /// Register the host's routes.
    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes = routes;
        self
    }

    /// Time source for the bucket algorithms.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the default ping-based health signal.
    pub fn health(mut self, health: impl StoreHealth + 'static) -> Self {
        self.health = Some(Arc::new(health));
        self
    }

    /// Load source for adaptive limiting. Required when it is enabled.
    pub fn load_gauge(mut self, gauge: impl LoadGauge + 'static) -> Self {
        self.gauge = Some(Arc::new(gauge));
        self
    }

    /// Validate the configuration against the routes and assemble the pipeline.
    pub fn build(self) -> Result<AdmissionPipeline, ConfigError> {
        let handle = self.config.unwrap_or_else(|| ConfigHandle::new(GlobalConfig::default()));
        let config = handle.get();
        config.validate()?;
        self.routes.validate(&config)?;

        let gauge: Arc<dyn LoadGauge> = match self.gauge {
            Some(gauge) => gauge,
            None if config.adaptive.enabled => return Err(ConfigError::MissingLoadGauge),
            None => Arc::new(SharedLoad::default()),
        };
        let health = self
            .health
            .unwrap_or_else(|| Arc::new(StorePing::following(self.store.clone(), handle.clone())));
        let limiter =
            Limiter::new(config.algorithm, self.store.clone(), self.clock, config.bucket.write);

        Ok(AdmissionPipeline {
            adaptive: AdaptiveLimitController::new(gauge, &self.routes, &config),
            suspension: SuspensionTracker::new(self.store),
            routes: Arc::new(self.routes),
            limiter,
            health,
            config: handle,
        })
    }
}
