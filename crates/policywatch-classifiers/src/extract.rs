//! Policy extraction from violation text
//!
//! Every extractor is total: malformed input yields an empty map or an
//! `"unknown"` policy name, never a panic.

use policywatch_core::PolicyMap;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::patterns::{Marker, MarkerSet};

/// Policy name used when the message format is not recognized
pub const UNKNOWN_POLICY: &str = "unknown";

const POLICIES_MARKER: &str = "due to the following policies";
const POLICY_PREFIX: &str = "denied the request: Policy";

/// Kyverno ClusterPolicy/Policy denial:
///
/// ```text
/// admission webhook "validate.kyverno.svc-fail" denied the request:
///
/// resource Pod/default/nginx was blocked due to the following policies
///
/// disallow-privileged-containers:
///   privileged-containers: 'validation error: ...'
/// ```
///
/// The block after the marker is parsed as YAML into policy -> rule -> message.
pub fn kyverno_policies(message: &str) -> PolicyMap {
    let markers = MarkerSet::scan(message);
    if !markers.has_all(&[Marker::AdmissionWebhook, Marker::DeniedTheRequest]) {
        return PolicyMap::new();
    }
    let Some((_, block)) = message.split_once(POLICIES_MARKER) else {
        return PolicyMap::new();
    };
    if block.trim().is_empty() {
        return PolicyMap::new();
    }

    match serde_yaml::from_str::<YamlValue>(block) {
        Ok(YamlValue::Mapping(policies)) => policies
            .into_iter()
            .filter_map(|(policy, rules)| {
                let policy = yaml_scalar(&policy)?;
                let rules = match rules {
                    YamlValue::Mapping(rules) => rules
                        .into_iter()
                        .filter_map(|(rule, detail)| Some((yaml_scalar(&rule)?, yaml_text(&detail))))
                        .collect(),
                    other => BTreeMap::from([(policy.clone(), yaml_text(&other))]),
                };
                Some((policy, rules))
            })
            .collect(),
        Ok(_) => {
            debug!("Kyverno policy block is not a mapping");
            PolicyMap::new()
        }
        Err(e) => {
            warn!("Failed to parse Kyverno policy block: {}", e);
            PolicyMap::new()
        }
    }
}

/// Kyverno ValidatingPolicy / NamespacedValidatingPolicy denial:
/// `... denied the request: Policy <name> failed: <detail>`
pub fn validating_policies(message: &str) -> PolicyMap {
    single(&name_between(message, POLICY_PREFIX, " failed:"), message)
}

/// Kyverno ImageValidatingPolicy denial:
/// `... denied the request: Policy <name> error: <detail>`
pub fn image_validating_policies(message: &str) -> PolicyMap {
    single(&name_between(message, POLICY_PREFIX, " error:"), message)
}

/// Native ValidatingAdmissionPolicy denial:
/// `... ValidatingAdmissionPolicy '<name>' with binding '<binding>' denied request: ...`
///
/// Returns an empty map when the message is not in this format.
pub fn validating_admission_policies(message: &str) -> PolicyMap {
    let markers = MarkerSet::scan(message);
    if !markers.has_all(&[Marker::ValidatingAdmissionPolicy, Marker::DeniedRequest]) {
        return PolicyMap::new();
    }
    let name = name_between(message, Marker::ValidatingAdmissionPolicy.text(), " with binding ")
        .replace('\'', "");
    let name = match name.trim() {
        "" => UNKNOWN_POLICY.to_string(),
        trimmed => trimmed.to_string(),
    };
    single(&name, message)
}

#[derive(Debug, Deserialize)]
struct ValidationFailure {
    #[serde(default)]
    policy: String,
}

/// ValidatingAdmissionPolicy failures recorded in `Audit` mode.
///
/// `validation_failure` is the JSON array from the
/// `validation.policy.admission.k8s.io/validation_failure` annotation, e.g.
/// `[{"message":"failed expression: ...","policy":"check-replicas","binding":"check-replicas-binding","expressionIndex":0,"validationActions":["Audit"]}]`.
/// Each named policy maps to the full annotation text.
pub fn audit_only_admission_policies(validation_failure: &str) -> PolicyMap {
    match serde_json::from_str::<Vec<ValidationFailure>>(validation_failure) {
        Ok(failures) => {
            let mut policies = PolicyMap::new();
            for failure in failures.into_iter().filter(|f| !f.policy.is_empty()) {
                policies
                    .entry(failure.policy.clone())
                    .or_default()
                    .insert(failure.policy, validation_failure.to_string());
            }
            if policies.is_empty() {
                policies = single(UNKNOWN_POLICY, validation_failure);
            }
            policies
        }
        Err(e) => {
            debug!("validation_failure annotation is not a JSON array, scanning: {}", e);
            single(&scan_policy_field(validation_failure), validation_failure)
        }
    }
}

/// Kyverno audit-mode policy event:
/// `Deployment default/web: [check-for-labels] fail; validation error: ...`
///
/// The rule name is taken from the first bracketed token, defaulting to the
/// policy name.
pub fn audit_only_cluster_policies(policy_name: &str, message: &str) -> PolicyMap {
    let rule = message
        .split_once('[')
        .and_then(|(_, rest)| rest.split_once(']'))
        .map(|(rule, _)| rule.trim())
        .filter(|rule| !rule.is_empty())
        .unwrap_or(policy_name);

    let mut policies = PolicyMap::new();
    policies
        .entry(policy_name.to_string())
        .or_default()
        .insert(rule.to_string(), message.to_string());
    policies
}

fn single(name: &str, detail: &str) -> PolicyMap {
    let mut policies = PolicyMap::new();
    policies
        .entry(name.to_string())
        .or_default()
        .insert(name.to_string(), detail.to_string());
    policies
}

/// Trimmed text between `start` and the first `end` after it
fn name_between(message: &str, start: &str, end: &str) -> String {
    message
        .split_once(start)
        .and_then(|(_, rest)| rest.split_once(end))
        .map(|(name, _)| name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_POLICY)
        .to_string()
}

fn scan_policy_field(text: &str) -> String {
    text.split_once("\"policy\":")
        .and_then(|(_, rest)| rest.split(',').next())
        .map(|name| name.replace('"', "").trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| UNKNOWN_POLICY.to_string())
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_text(value: &YamlValue) -> String {
    match yaml_scalar(value) {
        Some(text) => text,
        None => serde_yaml::to_string(value).unwrap_or_default().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kyverno_policies() {
        let message = "admission webhook \"validate.kyverno.svc-fail\" denied the request: \n\nresource Pod/default/nginx was blocked due to the following policies \n\njames-disallow-privileged-containers:\n  privileged-containers: 'validation error: Privileged mode is disallowed. rule privileged-containers failed at path /spec/containers/0/securityContext/privileged/'\nrequire-labels:\n  check-team: 'label team is required'\n";

        let policies = kyverno_policies(message);
        assert_eq!(policies.len(), 2);
        assert!(policies["james-disallow-privileged-containers"]["privileged-containers"]
            .starts_with("validation error: Privileged mode is disallowed"));
        assert_eq!(policies["require-labels"]["check-team"], "label team is required");
    }

    #[test]
    fn test_kyverno_policies_without_markers() {
        assert!(kyverno_policies("blocked due to the following policies\nx:\n  y: z").is_empty());
        assert!(kyverno_policies("admission webhook denied the request: nothing").is_empty());
    }

    #[test]
    fn test_kyverno_policies_malformed_yaml() {
        let message = "admission webhook \"x\" denied the request: blocked due to the following policies \n\n: : [unclosed";
        assert!(kyverno_policies(message).is_empty());
    }

    #[test]
    fn test_validating_policies() {
        let message = "admission webhook \"vpol.validate.kyverno.svc-fail\" denied the request: Policy check-labels failed: label 'environment' is required";
        let policies = validating_policies(message);
        assert_eq!(policies.len(), 1);
        assert_eq!(policies["check-labels"]["check-labels"], message);
    }

    #[test]
    fn test_validating_policies_unknown_format() {
        let policies = validating_policies("something failed: but no policy prefix");
        assert_eq!(policies[UNKNOWN_POLICY][UNKNOWN_POLICY], "something failed: but no policy prefix");

        // end marker before start marker
        let policies = validating_policies(" failed: denied the request: Policy x");
        assert!(policies.contains_key(UNKNOWN_POLICY));
    }

    #[test]
    fn test_image_validating_policies() {
        let message = "admission webhook \"ivpol.validate.kyverno.svc-fail\" denied the request: Policy require-signed-images error: failed to evaluate policy: Get \"https://untrusted.registry.io/v2/\": dial tcp";
        let policies = image_validating_policies(message);
        assert!(policies.contains_key("require-signed-images"));
    }

    #[test]
    fn test_validating_admission_policies() {
        let message = "deployments.apps \"nginx-deployment\" is forbidden: ValidatingAdmissionPolicy 'check-deployment-replicas' with binding 'check-deployment-replicas-binding' denied request: failed expression: object.spec.replicas >= 5";
        let policies = validating_admission_policies(message);
        assert_eq!(policies["check-deployment-replicas"]["check-deployment-replicas"], message);
    }

    #[test]
    fn test_validating_admission_policies_without_binding() {
        let policies = validating_admission_policies("ValidatingAdmissionPolicy denied request: no binding here");
        assert!(policies.contains_key(UNKNOWN_POLICY));
        assert!(validating_admission_policies("ValidatingAdmissionPolicy 'x' with binding 'y'").is_empty());
    }

    #[test]
    fn test_audit_only_admission_policies() {
        let annotation = r#"[{"message":"failed expression: object.spec.replicas >= 5","policy":"check-deployment-replicas","binding":"check-deployment-replicas-binding","expressionIndex":0,"validationActions":["Audit"]},{"message":"m","policy":"require-owner","binding":"b","expressionIndex":0,"validationActions":["Audit"]}]"#;
        let policies = audit_only_admission_policies(annotation);
        assert_eq!(policies.len(), 2);
        assert_eq!(policies["check-deployment-replicas"]["check-deployment-replicas"], annotation);
        assert!(policies.contains_key("require-owner"));
    }

    #[test]
    fn test_audit_only_admission_policies_fallback_scan() {
        let policies = audit_only_admission_policies(r#"{"policy":"check-replicas","binding":"b"#);
        assert!(policies.contains_key("check-replicas"));

        let policies = audit_only_admission_policies("garbage");
        assert!(policies.contains_key(UNKNOWN_POLICY));
    }

    #[test]
    fn test_audit_only_cluster_policies() {
        let message = "Deployment default/james1-deployment: [check-for-labels] fail; validation error: The label `abcapp.kubernetes.io/name` is required.";
        let policies = audit_only_cluster_policies("abc-require-labels", message);
        assert_eq!(policies["abc-require-labels"]["check-for-labels"], message);

        let policies = audit_only_cluster_policies("abc-require-labels", "no rule ] here [");
        assert!(policies["abc-require-labels"].contains_key("abc-require-labels"));
    }
}
