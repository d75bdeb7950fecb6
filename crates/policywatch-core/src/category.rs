//! Violation categories

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of violation kinds the watcher understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationCategory {
    /// Kyverno ClusterPolicy/Policy admission denial
    Kyverno,
    /// Kyverno ValidatingPolicy (`vpol.`) denial
    ValidatingPolicy,
    /// Kyverno NamespacedValidatingPolicy (`nvpol.`) denial
    NamespacedValidatingPolicy,
    /// Kyverno ImageValidatingPolicy (`ivpol.`) denial
    ImageValidatingPolicy,
    /// Native ValidatingAdmissionPolicy denial
    ValidatingAdmissionPolicy,
    /// ValidatingAdmissionPolicy failure with `Audit` action, request allowed
    AuditOnlyValidatingAdmissionPolicy,
    /// Kyverno audit-mode policy event reported through the Kubernetes API
    AuditOnlyClusterPolicy,
}

impl ViolationCategory {
    /// Every category, in detection order
    pub const ALL: [ViolationCategory; 7] = [
        Self::Kyverno,
        Self::ValidatingPolicy,
        Self::NamespacedValidatingPolicy,
        Self::ImageValidatingPolicy,
        Self::ValidatingAdmissionPolicy,
        Self::AuditOnlyValidatingAdmissionPolicy,
        Self::AuditOnlyClusterPolicy,
    ];

    /// Prefix used when naming events of this category
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Kyverno => "kyverno-policy-violation",
            Self::ValidatingPolicy => "vpol-violation",
            Self::NamespacedValidatingPolicy => "nvpol-violation",
            Self::ImageValidatingPolicy => "ivpol-violation",
            Self::ValidatingAdmissionPolicy => "vap-violation",
            Self::AuditOnlyValidatingAdmissionPolicy => "audit-only-vap",
            Self::AuditOnlyClusterPolicy => "audit-only-cp",
        }
    }

    /// Whether the category reports requests that were let through
    pub fn is_audit_only(&self) -> bool {
        matches!(
            self,
            Self::AuditOnlyValidatingAdmissionPolicy | Self::AuditOnlyClusterPolicy
        )
    }

    /// Look a category up by event name prefix
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| {
            name.strip_prefix(c.prefix())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('-'))
        })
    }
}

impl fmt::Display for ViolationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}
