//! PolicyWatch Dispatch
//!
//! Routes classified policy violations to per-category handlers and delivers
//! the resulting payloads.
//!
//! Each category gets one generic handler parameterized by:
//! - a classifier function
//! - a forward policy (blocked-only or always)
//! - its own delivery sink and token bucket

pub mod delivery;
pub mod dispatcher;
pub mod handler;
pub mod rate_limit;

pub use delivery::{ConsoleSink, InsightsClient, InsightsConfig, Sink, DEFAULT_HOSTNAME, WATCHER_VERSION};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use handler::{FilterReason, ForwardPolicy, HandleOutcome, ViolationHandler};
pub use rate_limit::TokenBucket;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::delivery::{InsightsConfig, Sink};
    pub use crate::dispatcher::{DispatchOutcome, Dispatcher};
    pub use crate::handler::{HandleOutcome, ViolationHandler};
}
