//! Error types for the store contract and startup validation.
//!
//! Per-request failures never escape the pipeline: store errors are folded into the configured
//! fallback strategy. Only [`ConfigError`] is surfaced to callers, at construction time.

use std::time::Duration;

/// Failure reported by a [`CounterStore`](crate::store::CounterStore) backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or rejected the command.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),
    /// The call did not complete within the configured budget.
    #[error("shared store call timed out after {0:?}")]
    Timeout(Duration),
    /// A stored value could not be parsed into the expected shape.
    #[error("corrupt value under `{key}`: {detail}")]
    Corrupt {
        /// Key holding the unreadable value.
        key: String,
        /// What was wrong with it.
        detail: String,
    },
    /// An in-process lock guarding store state was poisoned.
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Build an [`StoreError::Unavailable`] from any displayable cause.
    pub fn unavailable(cause: impl std::fmt::Display) -> Self {
        StoreError::Unavailable(cause.to_string())
    }

    /// Check if this error means the store could not be reached in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

/// Startup configuration problems. The pipeline refuses to build when any is present.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A route declares no limit and no global default exists to fall back on.
    #[error("route `{route}` declares no {field} and no global default is configured")]
    MissingDefaults {
        /// Route identifier that could not be resolved.
        route: String,
        /// Field that had no value.
        field: &'static str,
    },
    /// A configured value would silently disable limiting (zero requests, zero window, ...).
    #[error("{field} must be > 0 (got {value})")]
    InvalidDefault {
        /// Offending setting.
        field: &'static str,
        /// Value provided.
        value: i64,
    },
    /// Load thresholds are outside `0.0..=1.0` or inverted.
    #[error("invalid load thresholds: low {low}, high {high}")]
    InvalidThresholds {
        /// Low-load threshold.
        low: f64,
        /// High-load threshold.
        high: f64,
    },
    /// A load multiplier is negative, non-finite, or points the wrong way.
    #[error("invalid {which} multiplier {value}")]
    InvalidMultiplier {
        /// `"high-load"` or `"low-load"`.
        which: &'static str,
        /// Value provided.
        value: f64,
    },
    /// Adaptive limiting is enabled but nothing reports the system load.
    #[error("adaptive limiting is enabled but no load gauge was provided")]
    MissingLoadGauge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display() {
        let err = StoreError::unavailable("connection refused");
        assert_eq!(err.to_string(), "shared store unavailable: connection refused");
        assert!(!err.is_timeout());

        let err = StoreError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
        assert!(err.is_timeout());
    }

    #[test]
    fn corrupt_names_key() {
        let err =
            StoreError::Corrupt { key: "bucket:1.2.3.4".into(), detail: "not a number".into() };
        let msg = err.to_string();
        assert!(msg.contains("bucket:1.2.3.4"));
        assert!(msg.contains("not a number"));
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::MissingDefaults { route: "/orders".into(), field: "max-requests" };
        assert!(err.to_string().contains("/orders"));
        assert!(err.to_string().contains("max-requests"));

        let err = ConfigError::InvalidDefault { field: "default-max-requests", value: 0 };
        assert_eq!(err.to_string(), "default-max-requests must be > 0 (got 0)");
    }
}
