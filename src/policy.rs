//! Route-level policy declarations and their resolution against global defaults.

use std::collections::{HashMap, HashSet};

use crate::config::{FallbackStrategy, GlobalConfig};
use crate::error::ConfigError;

/// Policy attached to one route. Every field is optional; unset fields inherit the global
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case", default))]
pub struct RoutePolicy {
    /// Requests allowed per window.
    pub max_requests: Option<u32>,
    /// Window length in seconds.
    pub window_secs: Option<u64>,
    /// Clients always admitted on this route.
    pub whitelist: HashSet<String>,
    /// Clients always rejected on this route.
    pub blacklist: HashSet<String>,
    /// Behaviour while the store is down.
    pub fallback: Option<FallbackStrategy>,
}

impl RoutePolicy {
    /// Empty declaration; everything inherits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-window request ceiling.
    pub fn max_requests(mut self, max: u32) -> Self {
        self.max_requests = Some(max);
        self
    }

    /// Set the window length.
    pub fn window_secs(mut self, secs: u64) -> Self {
        self.window_secs = Some(secs);
        self
    }

    /// Add clients to the route whitelist.
    pub fn whitelist<I, S>(mut self, clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(clients.into_iter().map(Into::into));
        self
    }

    /// Add clients to the route blacklist.
    pub fn blacklist<I, S>(mut self, clients: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blacklist.extend(clients.into_iter().map(Into::into));
        self
    }

    /// Set the store-down behaviour.
    pub fn fallback(mut self, fallback: FallbackStrategy) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Fully resolved policy for one call. Route values win; globals fill the gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Requests allowed per window (before any adaptive adjustment).
    pub max_requests: u32,
    /// Whether `max_requests` came from the route rather than the global default.
    pub route_override: bool,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Route whitelist.
    pub whitelist: HashSet<String>,
    /// Route blacklist.
    pub blacklist: HashSet<String>,
    /// Store-down behaviour.
    pub fallback: FallbackStrategy,
}

impl RateLimitPolicy {
    /// Merge a route declaration with the global defaults.
    ///
    /// `route_id` only labels the error when neither side supplies a limit or window. A zero
    /// limit or window declared on the route is rejected the same way a zero global default is.
    pub fn resolve(
        route_id: &str,
        route: Option<&RoutePolicy>,
        global: &GlobalConfig,
    ) -> Result<Self, ConfigError> {
        let declared_max = route.and_then(|r| r.max_requests);
        let max_requests = declared_max.or(global.default_max_requests).ok_or_else(|| {
            ConfigError::MissingDefaults { route: route_id.to_string(), field: "max-requests" }
        })?;
        let window_secs = route
            .and_then(|r| r.window_secs)
            .or(global.default_window_secs)
            .ok_or_else(|| ConfigError::MissingDefaults {
                route: route_id.to_string(),
                field: "window-secs",
            })?;
        if max_requests == 0 {
            return Err(ConfigError::InvalidDefault { field: "max-requests", value: 0 });
        }
        if window_secs == 0 {
            return Err(ConfigError::InvalidDefault { field: "window-secs", value: 0 });
        }

        Ok(Self {
            max_requests,
            route_override: declared_max.is_some(),
            window_secs,
            whitelist: route.map(|r| r.whitelist.clone()).unwrap_or_default(),
            blacklist: route.map(|r| r.blacklist.clone()).unwrap_or_default(),
            fallback: route.and_then(|r| r.fallback).unwrap_or(global.fallback),
        })
    }
}

/// Registered routes and their optional policies, keyed by route identifier (the request path).
///
/// Stands in for framework introspection: the host enumerates its routes once at startup and the
/// table seeds the adaptive controller and serves per-request policy lookups.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Option<RoutePolicy>>,
}

impl RouteTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route, replacing any earlier registration under the same id.
    pub fn route(mut self, id: impl Into<String>, policy: Option<RoutePolicy>) -> Self {
        self.insert(id, policy);
        self
    }

    /// Register a route in place.
    pub fn insert(&mut self, id: impl Into<String>, policy: Option<RoutePolicy>) {
        self.routes.insert(id.into(), policy);
    }

    /// Whether `id` was registered.
    pub fn contains(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }

    /// Declared policy for `id`, if it was registered with one.
    pub fn policy(&self, id: &str) -> Option<&RoutePolicy> {
        self.routes.get(id).and_then(Option::as_ref)
    }

    /// Iterate `(route id, declared policy)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&RoutePolicy>)> {
        self.routes.iter().map(|(id, p)| (id.as_str(), p.as_ref()))
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Check that every registered route resolves to a complete policy.
    pub fn validate(&self, global: &GlobalConfig) -> Result<(), ConfigError> {
        for (id, policy) in self.iter() {
            RateLimitPolicy::resolve(id, policy, global)?;
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<(S, Option<RoutePolicy>)> for RouteTable {
    fn from_iter<I: IntoIterator<Item = (S, Option<RoutePolicy>)>>(iter: I) -> Self {
        let mut table = RouteTable::new();
        for (id, policy) in iter {
            table.insert(id, policy);
        }
        table
    }
}
