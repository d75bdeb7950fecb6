//! PolicyWatch Classifiers
//!
//! Heuristic classification of Kubernetes policy violations from free-text
//! admission messages and audit annotations. This is text pattern matching,
//! not policy re-evaluation.
//!
//! The crate is split into:
//! - `detect`: decides whether a raw record is a violation and of which category
//! - `extract`: pulls policy and rule names out of violation text
//! - `classifier`: per-category classifiers over normalized events
//! - `outcome`: blocked/success derivation from `policyResult` metadata
//!
//! All functions are pure and never panic on malformed input.

pub mod classifier;
pub mod detect;
pub mod extract;
pub mod outcome;
pub mod patterns;

pub use classifier::{classifier_for, ClassifierFn, Verdict};
pub use detect::{detect_audit, detect_denial, is_audit_only_allow, is_audit_only_cluster_policy};
pub use outcome::derive_outcome;
pub use patterns::{Marker, MarkerSet};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::classifier::{classifier_for, ClassifierFn, Verdict};
    pub use crate::detect::{detect_audit, is_audit_only_cluster_policy};
    pub use crate::outcome::derive_outcome;
}
