//! PolicyWatch Core
//!
//! Core types and utilities shared across PolicyWatch components.
//!
//! This crate provides:
//! - The canonical `WatchedEvent` and the `PolicyViolationEvent` delivery payload
//! - The closed set of violation categories
//! - Kubernetes audit record model
//! - Normalization of raw source records into `WatchedEvent`s
//! - A TTL and size bounded deduplication cache
//! - Error types and result handling

pub mod audit;
pub mod category;
pub mod dedup;
pub mod error;
pub mod normalize;
pub mod types;

pub use audit::{AuditEvent, ObjectRef};
pub use category::ViolationCategory;
pub use dedup::DedupCache;
pub use error::{Error, Result};
pub use types::{EventType, Fields, Outcome, PolicyMap, PolicyViolationEvent, WatchedEvent, EVENT_VERSION};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::AuditEvent;
    pub use crate::category::ViolationCategory;
    pub use crate::dedup::DedupCache;
    pub use crate::error::{Error, Result};
    pub use crate::types::{EventType, Outcome, PolicyMap, PolicyViolationEvent, WatchedEvent};
}
