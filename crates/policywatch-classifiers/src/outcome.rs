//! Admission outcome derivation from `policyResult` metadata

use policywatch_core::Outcome;
use serde_json::Value;
use tracing::warn;

/// Map a `policyResult` metadata value to the reported outcome.
///
/// `"fail"` is blocked, `"pass"` is allowed, any other string (e.g.
/// `"audit"`) is observed only. A missing or non-string value fails closed:
/// the event is treated as blocked.
pub fn derive_outcome(policy_result: Option<&Value>) -> (Outcome, String) {
    match policy_result {
        Some(Value::String(result)) => match result.as_str() {
            "fail" => (Outcome::BLOCKED, result.clone()),
            "pass" => (Outcome::ALLOWED, result.clone()),
            _ => (Outcome::OBSERVED, result.clone()),
        },
        Some(other) => {
            warn!(policy_result = %other, "policyResult is not a string, treating event as blocked");
            (Outcome::BLOCKED, "fail".to_string())
        }
        None => {
            warn!("No policy result found in metadata, treating event as blocked");
            (Outcome::BLOCKED, "fail".to_string())
        }
    }
}
