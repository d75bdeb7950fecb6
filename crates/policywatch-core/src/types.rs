//! Core types for PolicyWatch

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::category::ViolationCategory;

/// Version of the `WatchedEvent` payload shape; bump on incompatible changes
pub const EVENT_VERSION: u32 = 1;

/// Opaque key/value payload carried by events
pub type Fields = Map<String, Value>;

/// Policy name -> (rule name -> detail text)
pub type PolicyMap = BTreeMap<String, BTreeMap<String, String>>;

/// Kind of change observed at the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    #[default]
    Added,
    Modified,
    Deleted,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Added => "ADDED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Canonical record produced by every source adapter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WatchedEvent {
    pub event_version: u32,

    /// Processing time, epoch seconds
    pub timestamp: i64,

    /// Source-reported time, RFC3339
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_time: String,

    pub event_type: EventType,
    pub resource_type: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,

    #[serde(default)]
    pub data: Fields,

    #[serde(default)]
    pub metadata: Fields,

    #[serde(default)]
    pub event_source: String,

    #[serde(default)]
    pub success: bool,

    #[serde(default)]
    pub blocked: bool,

    /// Assigned once by the classifier, read by dispatch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ViolationCategory>,
}

impl WatchedEvent {
    /// Violation message, preferring the raw payload over metadata
    pub fn message(&self) -> Option<&str> {
        self.data
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| self.metadata.get("message").and_then(Value::as_str))
            .filter(|m| !m.is_empty())
    }

    /// Raw `policyResult` metadata entry, if present
    pub fn policy_result(&self) -> Option<&Value> {
        self.metadata.get("policyResult")
    }

    /// Annotation map from the payload, if it is one
    pub fn annotations(&self) -> Option<&Fields> {
        self.data.get("annotations").and_then(Value::as_object)
    }

    /// String field from the payload
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// String field from the metadata
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// Outcome of an admission decision as reported to the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outcome {
    pub blocked: bool,
    pub success: bool,
}

impl Outcome {
    pub const BLOCKED: Self = Self { blocked: true, success: false };
    pub const ALLOWED: Self = Self { blocked: false, success: true };
    pub const OBSERVED: Self = Self { blocked: false, success: false };
}

/// Delivery payload posted to the reporting API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyViolationEvent {
    pub event_type: EventType,
    pub resource_type: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub timestamp: i64,
    pub data: Fields,
    pub metadata: Fields,
    pub policies: PolicyMap,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_result: String,

    pub message: String,
    pub blocked: bool,
    pub success: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_time: String,
}

impl PolicyViolationEvent {
    /// Build the payload for a classified event
    pub fn from_watched(
        event: &WatchedEvent,
        policies: PolicyMap,
        message: impl Into<String>,
        policy_result: impl Into<String>,
        outcome: Outcome,
    ) -> Self {
        Self {
            event_type: event.event_type,
            resource_type: event.resource_type.clone(),
            namespace: event.namespace.clone(),
            name: event.name.clone(),
            uid: event.uid.clone(),
            timestamp: event.timestamp,
            data: event.data.clone(),
            metadata: event.metadata.clone(),
            policies,
            policy_result: policy_result.into(),
            message: message.into(),
            blocked: outcome.blocked,
            success: outcome.success,
            event_time: event.event_time.clone(),
        }
    }

    /// Comma separated policy names, for logging
    pub fn policy_names(&self) -> String {
        self.policies.keys().cloned().collect::<Vec<_>>().join(",")
    }
}
