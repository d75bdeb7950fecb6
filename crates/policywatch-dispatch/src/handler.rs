//! Generic violation handler
//!
//! One [`ViolationHandler`] is built per category from a classifier function
//! and a forward policy. Each owns its sink and its token bucket.

use policywatch_classifiers::{classifier_for, derive_outcome, ClassifierFn};
use policywatch_core::{PolicyViolationEvent, Result, ViolationCategory, WatchedEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::delivery::Sink;
use crate::rate_limit::{TokenBucket, DEFAULT_ACQUIRE_TIMEOUT};

/// Which derived outcomes a handler forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardPolicy {
    /// Deliver only when the admission request was blocked
    BlockedOnly,
    /// Deliver regardless of outcome (observability-only signals)
    Always,
}

impl ForwardPolicy {
    /// Audit-only categories always forward, everything else forwards blocked events only
    pub fn for_category(category: ViolationCategory) -> Self {
        if category.is_audit_only() {
            Self::Always
        } else {
            Self::BlockedOnly
        }
    }

    pub fn allows(self, blocked: bool) -> bool {
        match self {
            Self::BlockedOnly => blocked,
            Self::Always => true,
        }
    }
}

/// Why an event was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// The classifier found no policy marker
    NoPolicies,
    /// The forward policy rejected the outcome
    NotBlocked,
}

/// Result of handling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Delivered,
    Filtered(FilterReason),
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Filtered(FilterReason::NoPolicies) => "no_policies",
            Self::Filtered(FilterReason::NotBlocked) => "not_blocked",
        }
    }
}

/// Turns a classified event into a delivery
pub struct ViolationHandler {
    category: ViolationCategory,
    classify: ClassifierFn,
    forward: ForwardPolicy,
    sink: Arc<dyn Sink>,
    limiter: TokenBucket,
    acquire_timeout: Duration,
}

impl ViolationHandler {
    /// Handler for `category` with its standard classifier and forward policy
    pub fn new(category: ViolationCategory, sink: Arc<dyn Sink>, requests_per_minute: u32) -> Self {
        Self {
            category,
            classify: classifier_for(category),
            forward: ForwardPolicy::for_category(category),
            sink,
            limiter: TokenBucket::new(requests_per_minute),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Override the bound on rate-limiter waits
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn category(&self) -> ViolationCategory {
        self.category
    }

    pub fn forward_policy(&self) -> ForwardPolicy {
        self.forward
    }

    /// Classify, apply the forward policy, build the payload and deliver it.
    ///
    /// Precondition failures, rate-limit timeouts and delivery failures are
    /// returned as errors; a classification miss or a rejected outcome is a
    /// filtered result.
    pub async fn handle(&self, event: &WatchedEvent) -> Result<HandleOutcome> {
        let verdict = (self.classify)(event)?;
        if verdict.is_miss() {
            debug!(category = %self.category, name = %event.name, "No policies found in event, skipping");
            return Ok(HandleOutcome::Filtered(FilterReason::NoPolicies));
        }

        let (outcome, policy_result) = derive_outcome(event.policy_result());
        if !self.forward.allows(outcome.blocked) {
            debug!(
                category = %self.category,
                name = %event.name,
                policy_result = %policy_result,
                "Violation was not blocked, skipping"
            );
            return Ok(HandleOutcome::Filtered(FilterReason::NotBlocked));
        }

        let violation =
            PolicyViolationEvent::from_watched(event, verdict.policies, verdict.message, policy_result, outcome);

        self.limiter.acquire(self.acquire_timeout).await?;
        self.sink.deliver(&violation).await?;

        info!(
            category = %self.category,
            sink = self.sink.name(),
            name = %violation.name,
            namespace = %violation.namespace,
            policies = %violation.policy_names(),
            blocked = violation.blocked,
            "Policy violation reported"
        );
        Ok(HandleOutcome::Delivered)
    }
}

impl std::fmt::Debug for ViolationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViolationHandler")
            .field("category", &self.category)
            .field("forward", &self.forward)
            .field("sink", &self.sink.name())
            .finish_non_exhaustive()
    }
}
