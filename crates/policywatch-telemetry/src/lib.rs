//! PolicyWatch Telemetry
//!
//! Metrics and health reporting for the policy watcher.
//!
//! Provides:
//! - Lock-free pipeline counters mirrored to Prometheus
//! - Lifecycle status and a registry of health checkers
//! - A checker that judges the pipeline from its own metrics

pub mod health;
pub mod metrics;

pub use health::{CheckDetail, HealthChecker, HealthResponse, HealthState, HealthStatus, Probe, WatcherChecker};
pub use metrics::{MetricsSnapshot, WatcherMetrics};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::health::{HealthChecker, HealthState, HealthStatus, WatcherChecker};
    pub use crate::metrics::WatcherMetrics;
}
