//! Health status and checker registry
//!
//! [`HealthState`] holds the watcher's lifecycle status and the registered
//! [`HealthChecker`]s. The HTTP surface in the agent maps its probes onto
//! [`HealthState::liveness`], [`HealthState::readiness`] and
//! [`HealthState::detailed`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::WatcherMetrics;

/// Upper bound on one round of checker evaluation
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle status of the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    Stopping,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Starting => "starting",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Result of one checker in a detailed report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckDetail {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of every health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, CheckDetail>,
}

/// A probe answer: whether the probe passed plus the body to return
#[derive(Debug, Clone)]
pub struct Probe {
    pub ok: bool,
    pub response: HealthResponse,
}

/// A component that can report its own health
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `Err` carries the human-readable reason the component is unhealthy
    async fn check(&self) -> std::result::Result<(), String>;

    fn name(&self) -> &str;
}

/// Shared health state for the watcher and its HTTP surface
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthInner>,
}

struct HealthInner {
    status: RwLock<HealthStatus>,
    checkers: RwLock<Vec<Arc<dyn HealthChecker>>>,
    started: Instant,
    version: String,
}

impl HealthState {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HealthInner {
                status: RwLock::new(HealthStatus::Starting),
                checkers: RwLock::new(Vec::new()),
                started: Instant::now(),
                version: version.into(),
            }),
        }
    }

    pub fn register_checker(&self, checker: Arc<dyn HealthChecker>) {
        self.inner.checkers.write().push(checker);
    }

    pub fn set_status(&self, status: HealthStatus) {
        *self.inner.status.write() = status;
    }

    pub fn status(&self) -> HealthStatus {
        *self.inner.status.read()
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// Run every checker, bounded by [`CHECK_TIMEOUT`] overall.
    ///
    /// A checker that has not answered when the timeout fires is reported unhealthy.
    pub async fn check_all(&self) -> BTreeMap<String, CheckDetail> {
        let checkers: Vec<_> = self.inner.checkers.read().iter().cloned().collect();
        let deadline = tokio::time::Instant::now() + CHECK_TIMEOUT;

        let mut details = BTreeMap::new();
        for checker in checkers {
            let result = tokio::time::timeout_at(deadline, checker.check())
                .await
                .unwrap_or_else(|_| Err("health check timed out".to_string()));
            let detail = match result {
                Ok(()) => CheckDetail {
                    status: HealthStatus::Healthy,
                    error: None,
                },
                Err(e) => CheckDetail {
                    status: HealthStatus::Unhealthy,
                    error: Some(e),
                },
            };
            details.insert(checker.name().to_string(), detail);
        }
        details
    }

    /// Liveness: fails only while stopping, otherwise reports the current status
    pub fn liveness(&self) -> Probe {
        let status = self.status();
        Probe {
            ok: status != HealthStatus::Stopping,
            response: self.response(status, BTreeMap::new()),
        }
    }

    /// Readiness: passes only when healthy and every checker passes
    pub async fn readiness(&self) -> Probe {
        let status = self.status();
        if status != HealthStatus::Healthy {
            return Probe {
                ok: false,
                response: self.response(status, BTreeMap::new()),
            };
        }

        let details = self.check_all().await;
        let all_healthy = details.values().all(|d| d.status == HealthStatus::Healthy);
        let status = if all_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        Probe {
            ok: all_healthy,
            response: self.response(status, details),
        }
    }

    /// Detailed report; always passes
    pub async fn detailed(&self) -> Probe {
        let status = self.status();
        let details = self.check_all().await;
        Probe {
            ok: true,
            response: self.response(status, details),
        }
    }

    fn response(&self, status: HealthStatus, details: BTreeMap<String, CheckDetail>) -> HealthResponse {
        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime: format!("{:?}", self.inner.started.elapsed()),
            version: self.inner.version.clone(),
            details,
        }
    }
}

impl fmt::Debug for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthState")
            .field("status", &self.status())
            .field("checkers", &self.inner.checkers.read().len())
            .field("version", &self.inner.version)
            .finish()
    }
}

/// Health of the watcher pipeline, judged from its metrics
#[derive(Debug, Clone)]
pub struct WatcherChecker {
    metrics: WatcherMetrics,
    min_uptime: Duration,
}

impl WatcherChecker {
    pub const NAME: &'static str = "policy-watcher";
    pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(5);
    pub const MAX_DROP_PERCENTAGE: f64 = 50.0;
    pub const MAX_CHANNEL_UTILIZATION: f64 = 90.0;

    pub fn new(metrics: WatcherMetrics) -> Self {
        Self::with_min_uptime(metrics, Self::DEFAULT_MIN_UPTIME)
    }

    pub fn with_min_uptime(metrics: WatcherMetrics, min_uptime: Duration) -> Self {
        Self { metrics, min_uptime }
    }
}

#[async_trait]
impl HealthChecker for WatcherChecker {
    async fn check(&self) -> std::result::Result<(), String> {
        let snapshot = self.metrics.snapshot();

        if snapshot.uptime < self.min_uptime {
            return Err(format!("watcher still starting up (uptime: {:?})", snapshot.uptime));
        }

        if snapshot.events_processed > 0 {
            let drop_percentage = snapshot.drop_percentage();
            if drop_percentage > Self::MAX_DROP_PERCENTAGE {
                return Err(format!(
                    "high event drop rate: {:.2}% ({} dropped out of {} total)",
                    drop_percentage,
                    snapshot.events_dropped,
                    snapshot.events_processed + snapshot.events_dropped
                ));
            }
        }

        let utilization = snapshot.channel_utilization();
        if utilization > Self::MAX_CHANNEL_UTILIZATION {
            return Err(format!("high channel utilization: {:.2}%", utilization));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        Self::NAME
    }
}
