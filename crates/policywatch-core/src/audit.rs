//! Kubernetes audit log record model
//!
//! Only the fields the watcher consumes are modelled; everything else in the
//! audit line is ignored during deserialization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Annotation carrying the admission decision
pub const DECISION_ANNOTATION: &str = "authorization.k8s.io/decision";

/// Annotation carrying ValidatingAdmissionPolicy failures as a JSON array
pub const VALIDATION_FAILURE_ANNOTATION: &str =
    "validation.policy.admission.k8s.io/validation_failure";

/// One Kubernetes audit event (`audit.k8s.io/v1`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditEvent {
    pub kind: String,
    pub api_version: String,
    pub level: String,
    #[serde(rename = "auditID")]
    pub audit_id: String,
    pub stage: String,
    #[serde(rename = "requestURI")]
    pub request_uri: String,
    pub verb: String,
    pub user: AuditUser,
    #[serde(rename = "sourceIPs")]
    pub source_ips: Vec<String>,
    pub user_agent: String,
    pub object_ref: ObjectRef,
    pub response_status: ResponseStatus,
    pub annotations: BTreeMap<String, String>,
    pub request_received_timestamp: Option<DateTime<Utc>>,
    pub stage_timestamp: Option<DateTime<Utc>>,
}

impl AuditEvent {
    /// Parse one audit log line
    pub fn from_json(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|e| Error::parse(format!("invalid audit event: {e}")))
    }

    pub fn code(&self) -> i32 {
        self.response_status.code
    }

    pub fn message(&self) -> &str {
        &self.response_status.message
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditUser {
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
}

/// Reference to the object the request acted on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectRef {
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub api_group: String,
    pub api_version: String,
    pub resource_version: String,
    pub subresource: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseStatus {
    pub code: i32,
    pub status: String,
    pub message: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_audit_line() {
        let line = r#"{"kind":"Event","apiVersion":"audit.k8s.io/v1","level":"Metadata","auditID":"4f5e","stage":"ResponseComplete","verb":"create","user":{"username":"admin"},"objectRef":{"resource":"pods","namespace":"default","name":"nginx","apiVersion":"v1"},"responseStatus":{"metadata":{},"status":"Failure","message":"denied","reason":"BadRequest","code":400},"requestReceivedTimestamp":"2024-05-01T10:00:00.000000Z","stageTimestamp":"2024-05-01T10:00:00.250000Z","annotations":{"authorization.k8s.io/decision":"allow"}}"#;

        let event = AuditEvent::from_json(line).unwrap();
        assert_eq!(event.audit_id, "4f5e");
        assert_eq!(event.code(), 400);
        assert_eq!(event.message(), "denied");
        assert_eq!(event.object_ref.resource, "pods");
        assert_eq!(event.user.username, "admin");
        assert_eq!(event.annotation(DECISION_ANNOTATION), Some("allow"));
        assert!(event.stage_timestamp.is_some());
    }

    #[test]
    fn test_missing_fields_default() {
        let event = AuditEvent::from_json(r#"{"auditID":"x"}"#).unwrap();
        assert_eq!(event.code(), 0);
        assert!(event.annotations.is_empty());
        assert!(event.request_received_timestamp.is_none());
    }

    #[test]
    fn test_malformed_line_is_parse_error() {
        let err = AuditEvent::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
