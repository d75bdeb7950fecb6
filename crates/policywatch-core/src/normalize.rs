//! Conversion of raw source records into `WatchedEvent`s
//!
//! Three inputs are supported:
//! - unstructured Kubernetes objects (`serde_json::Value`)
//! - audit log records already classified into a violation category
//! - Kyverno `PolicyViolation` core/v1 Events

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::audit::{AuditEvent, ObjectRef};
use crate::category::ViolationCategory;
use crate::error::{Error, Result};
use crate::types::{EventType, Fields, Outcome, WatchedEvent, EVENT_VERSION};

/// Build a `WatchedEvent` from an unstructured Kubernetes object.
///
/// `managedFields` is stripped from the object metadata. A missing or
/// unparseable `eventTime` is replaced by the current time.
pub fn from_object(event_type: EventType, obj: Value, resource_type: &str) -> Result<WatchedEvent> {
    let mut object = match obj {
        Value::Object(map) => map,
        other => return Err(Error::UnsupportedObjectType(json_type_name(&other).to_string())),
    };

    let metadata = match object.get_mut("metadata") {
        None => return Err(Error::MissingMetadata),
        Some(Value::Object(metadata)) => metadata,
        Some(_) => return Err(Error::InvalidMetadataType),
    };
    metadata.remove("managedFields");
    let metadata = metadata.clone();

    let field = |key: &str| {
        metadata
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let name = field("name");
    let namespace = field("namespace");
    let uid = field("uid");

    let event_time = resolve_event_time(object.get("eventTime").and_then(Value::as_str));

    Ok(WatchedEvent {
        event_version: EVENT_VERSION,
        timestamp: Utc::now().timestamp(),
        event_time,
        event_type,
        resource_type: resource_type.to_string(),
        namespace,
        name,
        uid,
        data: object,
        metadata,
        ..Default::default()
    })
}

/// Build a `WatchedEvent` from an audit record the classifier matched.
///
/// `source` names the adapter the record came from and ends up in
/// `data.source.component`.
pub fn from_audit_event(audit: &AuditEvent, category: ViolationCategory, source: &str) -> WatchedEvent {
    let message = audit.message();
    let object_ref = if category.is_audit_only() {
        audit.object_ref.clone()
    } else {
        object_ref_from_message(message, &audit.object_ref)
    };

    let (outcome, policy_result) = if category.is_audit_only() {
        (Outcome::OBSERVED, "audit")
    } else {
        (Outcome::BLOCKED, "fail")
    };

    let received = audit.request_received_timestamp;
    let decided = audit.stage_timestamp.or(received);
    let at = if category.is_audit_only() {
        received.or(decided)
    } else {
        decided
    }
    .unwrap_or_else(Utc::now);

    let reason = if audit.code() >= 400 { "Blocked" } else { "Allowed" };
    let event_time = format_time(at);
    let first = format_time(received.unwrap_or(at));
    let last = format_time(decided.unwrap_or(at));

    let name = format!(
        "{}-{}-{}-{}",
        category.prefix(),
        object_ref.resource,
        object_ref.name,
        audit.audit_id
    );

    let annotations: Fields = audit
        .annotations
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let data = into_fields(json!({
        "reason": reason,
        "type": "Warning",
        "message": message,
        "source": { "component": source },
        "involvedObject": {
            "apiVersion": object_ref.api_version,
            "apiGroup": object_ref.api_group,
            "kind": object_ref.resource,
            "name": object_ref.name,
            "namespace": object_ref.namespace,
            "uid": audit.audit_id,
        },
        "firstTimestamp": first,
        "lastTimestamp": last,
        "count": 1,
        "annotations": annotations,
        "user": audit.user.username,
    }));

    let metadata = into_fields(json!({
        "audit_id": audit.audit_id,
        "resource_name": object_ref.name,
        "namespace": object_ref.namespace,
        "action": reason,
        "status": audit.response_status.status,
        "message": message,
        "policyResult": policy_result,
        "timestamp": last,
        "event_time": event_time,
    }));

    WatchedEvent {
        event_version: EVENT_VERSION,
        timestamp: at.timestamp(),
        event_time,
        event_type: EventType::Added,
        resource_type: object_ref.resource.clone(),
        namespace: object_ref.namespace.clone(),
        name,
        uid: audit.audit_id.clone(),
        data,
        metadata,
        event_source: source.to_string(),
        success: outcome.success,
        blocked: outcome.blocked,
        category: Some(category),
    }
}

/// Build a `WatchedEvent` from a Kyverno audit-mode core/v1 Event.
///
/// The event is named after the related resource, not the Event object.
pub fn from_policy_event(event: Value) -> Result<WatchedEvent> {
    let mut watched = from_object(EventType::Added, event, "Event")?;

    let text = |path: &[&str]| str_at(&watched.data, path);

    let event_uid = watched.uid.clone();
    let related_kind = text(&["related", "kind"]);
    let related_name = text(&["related", "name"]);
    let related_namespace = text(&["related", "namespace"]);
    let related_uid = text(&["related", "uid"]);
    let policy_name = text(&["involvedObject", "name"]);
    let message = text(&["message"]);
    let reason = text(&["reason"]);
    let event_type = text(&["type"]);
    let reporting_instance = text(&["reportingInstance"]);
    let related = watched.data.get("related").cloned().unwrap_or(Value::Null);
    let source = watched.data.get("source").cloned().unwrap_or(Value::Null);

    let mut metadata = watched.metadata.clone();
    metadata.insert("policyName".into(), json!(policy_name));
    metadata.insert("reason".into(), json!(reason));
    metadata.insert("message".into(), json!(message));
    metadata.insert("related".into(), related);
    metadata.insert("reportingInstance".into(), json!(reporting_instance));
    metadata.insert("source".into(), source);
    metadata.insert("type".into(), json!(event_type));
    metadata.insert("policyResult".into(), json!("pass"));

    watched.data.insert("policyName".into(), json!(policy_name));

    let category = ViolationCategory::AuditOnlyClusterPolicy;
    watched.name = format!(
        "{}-{}-{}-{}",
        category.prefix(),
        related_kind,
        related_name,
        event_uid
    );
    watched.resource_type = related_kind;
    watched.namespace = related_namespace;
    watched.uid = related_uid;
    watched.metadata = metadata;
    watched.event_source = "kubernetes_events".to_string();
    watched.blocked = Outcome::ALLOWED.blocked;
    watched.success = Outcome::ALLOWED.success;
    watched.category = Some(category);
    if let Ok(at) = DateTime::parse_from_rfc3339(&watched.event_time) {
        watched.timestamp = at.timestamp();
    }

    Ok(watched)
}

/// Recover the target object from a denial message when the audit record
/// carries an incomplete object reference.
///
/// Looks for `resource Kind/namespace/name was blocked` after
/// `denied the request:`; any part that cannot be found keeps the value from
/// `object_ref`.
pub fn object_ref_from_message(message: &str, object_ref: &ObjectRef) -> ObjectRef {
    let mut recovered = object_ref.clone();
    if !object_ref.uid.is_empty() {
        return recovered;
    }

    let Some((_, after_denied)) = message.split_once("denied the request:") else {
        return recovered;
    };
    let Some((_, after_resource)) = after_denied.split_once("resource ") else {
        return recovered;
    };
    let Some((kind, rest)) = after_resource.split_once('/') else {
        return recovered;
    };
    recovered.resource = kind.to_string();

    let Some((namespace, rest)) = rest.split_once('/') else {
        return recovered;
    };
    recovered.namespace = namespace.to_string();

    if let Some((name, _)) = rest.split_once(" was blocked") {
        recovered.name = name.to_string();
    }
    recovered
}

/// Validate an RFC3339 source time, falling back to now
pub fn resolve_event_time(raw: Option<&str>) -> String {
    match raw {
        Some(value) if DateTime::parse_from_rfc3339(value).is_ok() => value.to_string(),
        Some(value) => {
            warn!(event_time = value, "Unparseable eventTime, using current time");
            format_time(Utc::now())
        }
        None => {
            warn!("Event has no eventTime, using current time");
            format_time(Utc::now())
        }
    }
}

fn str_at(fields: &Fields, path: &[&str]) -> String {
    let Some((first, rest)) = path.split_first() else {
        return String::new();
    };
    let mut cur = fields.get(*first);
    for key in rest {
        cur = cur.and_then(|v| v.get(*key));
    }
    cur.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn format_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn into_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
