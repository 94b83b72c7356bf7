//! Combines per-rule verdicts into the decision for a request.

use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::verdict::{Outcome, Quota, RuleRef, Verdict};
use crate::policy::{ResponseSettings, Strategy};

pub const X_ENVOY_RATELIMITED: HeaderName = HeaderName::from_static("x-envoy-ratelimited");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Observability record for one evaluated descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    /// Serialized descriptor, `k=v,k=v`
    pub descriptor: String,
    pub rule: RuleRef,
    pub strategy: Strategy,
    pub outcome: Outcome,
    /// The strategy failed and `outcome` came from the failure mode
    pub failed: bool,
    pub shadow: bool,
    pub latency_us: u64,
}

/// The response to send in place of the upstream when a request is denied.
#[derive(Debug, Clone)]
pub struct DenyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// The merged decision for a request.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    /// Longest wait among the denying rules
    pub retry_after: Option<Duration>,
    /// Every rule that denied, in evaluation order
    pub denied_by: Vec<RuleRef>,
    /// Rules that would have denied but run in shadow mode
    pub shadow_denied: Vec<RuleRef>,
    /// The most restrictive quota reported by any rule
    pub quota: Option<Quota>,
    pub records: Vec<DecisionRecord>,
    pub policy_version: u64,
    /// Present only when the request is denied
    pub response: Option<DenyResponse>,
}

impl Decision {
    /// Decision for a request no rule applies to.
    pub fn unrestricted(policy_version: u64) -> Self {
        Self {
            allowed: true,
            retry_after: None,
            denied_by: Vec::new(),
            shadow_denied: Vec::new(),
            quota: None,
            records: Vec::new(),
            policy_version,
            response: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Merge resolved verdicts into one decision.
///
/// The request is admitted only if every enforced verdict admits. Errors must
/// be resolved through the rule's failure mode before reaching this point; an
/// unresolved one is treated as a denial.
pub fn merge(
    verdicts: &[Verdict],
    records: Vec<DecisionRecord>,
    settings: &ResponseSettings,
    policy_version: u64,
) -> Decision {
    let mut decision = Decision::unrestricted(policy_version);
    decision.records = records;

    for verdict in verdicts {
        debug_assert!(
            verdict.outcome != Outcome::Error,
            "unresolved error verdict reached the merger"
        );

        // Shadow rules never shape an enforced response
        if let Some(quota) = verdict.quota.filter(|_| !verdict.shadow) {
            if decision.quota.map_or(true, |q| more_restrictive(&quota, &q)) {
                decision.quota = Some(quota);
            }
        }

        if verdict.is_admit() {
            continue;
        }

        if verdict.shadow {
            if let Some(rule) = &verdict.rule {
                decision.shadow_denied.push(rule.clone());
            }
            continue;
        }

        decision.allowed = false;
        if let Some(rule) = &verdict.rule {
            decision.denied_by.push(rule.clone());
        }
        if let Some(retry) = verdict.retry_after {
            decision.retry_after = Some(decision.retry_after.map_or(retry, |r| r.max(retry)));
        }
    }

    if !decision.shadow_denied.is_empty() {
        debug!(
            rules = ?decision.shadow_denied.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            "Shadow rules would have denied the request"
        );
    }

    if !decision.allowed {
        decision.response = Some(deny_response(&decision, settings));
    }
    decision
}

fn more_restrictive(a: &Quota, b: &Quota) -> bool {
    (a.remaining, std::cmp::Reverse(a.reset_after)) < (b.remaining, std::cmp::Reverse(b.reset_after))
}

/// Whole seconds, rounded up.
fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

fn deny_response(decision: &Decision, settings: &ResponseSettings) -> DenyResponse {
    let status =
        StatusCode::from_u16(settings.deny_status).unwrap_or(StatusCode::TOO_MANY_REQUESTS);

    let mut headers = HeaderMap::new();
    headers.insert(X_ENVOY_RATELIMITED, HeaderValue::from_static("true"));

    let retry_secs = ceil_secs(decision.retry_after.unwrap_or_default()).max(1);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_secs));

    if settings.rate_limit_headers {
        if let Some(quota) = decision.quota {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(quota.reset_after)));
        }
    }

    DenyResponse { status, headers }
}
