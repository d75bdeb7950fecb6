//! PolicyWatch Agent
//!
//! Watches a Kubernetes cluster for admission policy violations and reports
//! them to the Fairwinds Insights API.
//!
//! - `config`: CLI flags, environment and YAML configuration
//! - `sources`: audit log, CloudWatch Logs and Kubernetes event sources
//! - `server`: health and Prometheus endpoints
//! - `watcher`: lifecycle of the whole pipeline

pub mod config;
pub mod server;
pub mod sources;
pub mod watcher;

pub use config::{Cli, CloudWatchConfig, Command, FileConfig, KubernetesConfig, LogFormat, WatcherConfig};
pub use server::{create_router, AppState};
pub use sources::{
    AuditLogTailer, CloudWatchPoller, EventSink, EventSource, KubernetesEventSource, ScanStats, SourceContext,
    Submit,
};
pub use watcher::Watcher;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{Cli, WatcherConfig};
    pub use crate::sources::{EventSink, EventSource, SourceContext};
    pub use crate::watcher::Watcher;
}
