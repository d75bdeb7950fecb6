//! Per-category classifiers over normalized events

use policywatch_core::audit::VALIDATION_FAILURE_ANNOTATION;
use policywatch_core::{Error, PolicyMap, Result, ViolationCategory, WatchedEvent};
use serde_json::Value;

use crate::extract;

/// Policies implicated by an event plus the message reported with them
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub policies: PolicyMap,
    pub message: String,
}

impl Verdict {
    /// No recognizable policy marker; the event is filtered, not an error
    pub fn is_miss(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Classifier signature shared by every category
pub type ClassifierFn = fn(&WatchedEvent) -> Result<Verdict>;

/// The classifier for a category
pub fn classifier_for(category: ViolationCategory) -> ClassifierFn {
    match category {
        ViolationCategory::Kyverno => classify_kyverno,
        ViolationCategory::ValidatingPolicy | ViolationCategory::NamespacedValidatingPolicy => {
            classify_validating_policy
        }
        ViolationCategory::ImageValidatingPolicy => classify_image_validating_policy,
        ViolationCategory::ValidatingAdmissionPolicy => classify_validating_admission_policy,
        ViolationCategory::AuditOnlyValidatingAdmissionPolicy => classify_audit_only_admission_policy,
        ViolationCategory::AuditOnlyClusterPolicy => classify_audit_only_cluster_policy,
    }
}

pub fn classify_kyverno(event: &WatchedEvent) -> Result<Verdict> {
    from_message(event, extract::kyverno_policies)
}

pub fn classify_validating_policy(event: &WatchedEvent) -> Result<Verdict> {
    from_message(event, extract::validating_policies)
}

pub fn classify_image_validating_policy(event: &WatchedEvent) -> Result<Verdict> {
    from_message(event, extract::image_validating_policies)
}

pub fn classify_validating_admission_policy(event: &WatchedEvent) -> Result<Verdict> {
    from_message(event, extract::validating_admission_policies)
}

/// Reads the `validation_failure` annotation rather than the message
pub fn classify_audit_only_admission_policy(event: &WatchedEvent) -> Result<Verdict> {
    let annotations = match event.data.get("annotations") {
        None => {
            return Err(Error::missing_field(
                "no annotations field in event or annotations is not a map",
            ))
        }
        Some(Value::Object(annotations)) => annotations,
        Some(_) => {
            return Err(Error::invalid_field_type(
                "no annotations field in event or annotations is not a map",
            ))
        }
    };

    let failure = annotations
        .get(VALIDATION_FAILURE_ANNOTATION)
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::missing_field(VALIDATION_FAILURE_ANNOTATION))?;

    Ok(Verdict {
        policies: extract::audit_only_admission_policies(failure),
        message: failure.to_string(),
    })
}

pub fn classify_audit_only_cluster_policy(event: &WatchedEvent) -> Result<Verdict> {
    let message = require_message(event)?;
    let policy_name = event
        .data_str("policyName")
        .or_else(|| event.metadata_str("policyName"))
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::missing_field("policyName"))?;

    Ok(Verdict {
        policies: extract::audit_only_cluster_policies(policy_name, message),
        message: message.to_string(),
    })
}

fn from_message(event: &WatchedEvent, extractor: fn(&str) -> PolicyMap) -> Result<Verdict> {
    let message = require_message(event)?;
    Ok(Verdict {
        policies: extractor(message),
        message: message.to_string(),
    })
}

fn require_message(event: &WatchedEvent) -> Result<&str> {
    event
        .message()
        .ok_or_else(|| Error::missing_field("no message field in event or message is empty"))
}
