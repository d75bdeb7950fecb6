//! Violation detection for raw source records

use policywatch_core::audit::{DECISION_ANNOTATION, VALIDATION_FAILURE_ANNOTATION};
use policywatch_core::{AuditEvent, ViolationCategory};
use serde_json::Value;

use crate::patterns::{Marker, MarkerSet};

/// Field selector for listing Kyverno policy events
pub const POLICY_VIOLATION_FIELD_SELECTOR: &str = "reason=PolicyViolation";

/// Decide which violation category, if any, an audit record belongs to.
///
/// Denials (response code >= 400) are checked first in table order, then the
/// audit-only allow case. `None` means the record is not a violation.
pub fn detect_audit(audit: &AuditEvent) -> Option<ViolationCategory> {
    if let Some(category) = detect_denial(audit.code(), audit.message()) {
        return Some(category);
    }
    if is_audit_only_allow(
        audit.annotation(DECISION_ANNOTATION),
        audit.annotation(VALIDATION_FAILURE_ANNOTATION),
    ) {
        return Some(ViolationCategory::AuditOnlyValidatingAdmissionPolicy);
    }
    None
}

/// Classify a denied admission response by its message
pub fn detect_denial(code: i32, message: &str) -> Option<ViolationCategory> {
    if code < 400 {
        return None;
    }
    let markers = MarkerSet::scan(message);

    if markers.has_all(&[Marker::Kyverno, Marker::BlockedDueToPolicies]) {
        Some(ViolationCategory::Kyverno)
    } else if markers.has_all(&[Marker::ValidatingPolicy, Marker::Kyverno])
        && !markers.has(Marker::ImageValidatingPolicy)
        && !markers.has(Marker::NamespacedValidatingPolicy)
    {
        Some(ViolationCategory::ValidatingPolicy)
    } else if markers.has_all(&[Marker::NamespacedValidatingPolicy, Marker::Kyverno]) {
        Some(ViolationCategory::NamespacedValidatingPolicy)
    } else if markers.has_all(&[Marker::ImageValidatingPolicy, Marker::Kyverno]) {
        Some(ViolationCategory::ImageValidatingPolicy)
    } else if markers.has(Marker::ValidatingAdmissionPolicy) {
        Some(ViolationCategory::ValidatingAdmissionPolicy)
    } else {
        None
    }
}

/// An allowed request that still failed a ValidatingAdmissionPolicy in
/// `Audit` mode
pub fn is_audit_only_allow(decision: Option<&str>, validation_failure: Option<&str>) -> bool {
    decision == Some("allow") && validation_failure.is_some_and(|v| !v.is_empty())
}

/// Kyverno audit-mode policy event (core/v1 Event object)
pub fn is_audit_only_cluster_policy(event: &Value) -> bool {
    let kind = event
        .pointer("/involvedObject/kind")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let reason = event.get("reason").and_then(Value::as_str).unwrap_or_default();
    let action = event.get("action").and_then(Value::as_str).unwrap_or_default();

    matches!(kind, "ClusterPolicy" | "Policy")
        && reason == "PolicyViolation"
        && action == "Resource Passed"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KYVERNO: &str = "admission webhook \"validate.kyverno.svc-fail\" denied the request: \n\nresource Pod/default/nginx was blocked due to the following policies \n\ndisallow-privileged:\n  privileged-containers: 'validation error'\n";
    const VPOL: &str = "admission webhook \"vpol.validate.kyverno.svc-fail\" denied the request: Policy check-labels failed: label 'environment' is required";
    const NVPOL: &str = "admission webhook \"nvpol.validate.kyverno.svc-fail\" denied the request: Policy check-deployment-replicas failed: deployments must have at least 5 replicas";
    const IVPOL: &str = "admission webhook \"ivpol.validate.kyverno.svc-fail\" denied the request: Policy require-signed-images error: failed to evaluate policy";
    const VAP: &str = "deployments.apps \"nginx-deployment\" is forbidden: ValidatingAdmissionPolicy 'check-deployment-replicas' with binding 'check-deployment-replicas-binding' denied request: failed expression: object.spec.replicas >= 5";

    #[test]
    fn test_detect_denials() {
        assert_eq!(detect_denial(400, KYVERNO), Some(ViolationCategory::Kyverno));
        assert_eq!(detect_denial(400, VPOL), Some(ViolationCategory::ValidatingPolicy));
        assert_eq!(detect_denial(400, NVPOL), Some(ViolationCategory::NamespacedValidatingPolicy));
        assert_eq!(detect_denial(400, IVPOL), Some(ViolationCategory::ImageValidatingPolicy));
        assert_eq!(detect_denial(422, VAP), Some(ViolationCategory::ValidatingAdmissionPolicy));
    }

    #[test]
    fn test_success_codes_are_not_denials() {
        assert_eq!(detect_denial(200, KYVERNO), None);
        assert_eq!(detect_denial(399, VAP), None);
        assert_eq!(detect_denial(500, "etcd unavailable"), None);
    }

    #[test]
    fn test_detect_audit_only_allow() {
        let mut audit = AuditEvent::default();
        audit.response_status.code = 201;
        audit.annotations.insert(DECISION_ANNOTATION.into(), "allow".into());
        assert_eq!(detect_audit(&audit), None);

        audit.annotations.insert(
            VALIDATION_FAILURE_ANNOTATION.into(),
            r#"[{"policy":"check-deployment-replicas","validationActions":["Audit"]}]"#.into(),
        );
        assert_eq!(
            detect_audit(&audit),
            Some(ViolationCategory::AuditOnlyValidatingAdmissionPolicy)
        );

        audit.annotations.insert(DECISION_ANNOTATION.into(), "forbid".into());
        assert_eq!(detect_audit(&audit), None);
    }

    #[test]
    fn test_denial_wins_over_audit_annotation() {
        let mut audit = AuditEvent::default();
        audit.response_status.code = 400;
        audit.response_status.message = VPOL.into();
        audit.annotations.insert(DECISION_ANNOTATION.into(), "allow".into());
        audit.annotations.insert(VALIDATION_FAILURE_ANNOTATION.into(), "[]".into());
        assert_eq!(detect_audit(&audit), Some(ViolationCategory::ValidatingPolicy));
    }

    #[test]
    fn test_audit_only_cluster_policy_event() {
        let event = json!({
            "reason": "PolicyViolation",
            "action": "Resource Passed",
            "involvedObject": { "kind": "ClusterPolicy", "name": "require-labels" },
        });
        assert!(is_audit_only_cluster_policy(&event));

        let blocked = json!({
            "reason": "PolicyViolation",
            "action": "Resource Blocked",
            "involvedObject": { "kind": "ClusterPolicy" },
        });
        assert!(!is_audit_only_cluster_policy(&blocked));

        let pod = json!({
            "reason": "PolicyViolation",
            "action": "Resource Passed",
            "involvedObject": { "kind": "Pod" },
        });
        assert!(!is_audit_only_cluster_policy(&pod));
    }
}
