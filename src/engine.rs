//! Per-request rate limit decisions.
//!
//! The engine reads the active policy snapshot once per request, matches the
//! request to descriptors, checks local descriptors against in-process
//! buckets and sends global descriptors to the counting service in one
//! batch. Failed global checks are resolved through the rule's failure mode
//! before the verdicts are merged.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::MeshguardConfig;
use crate::error::Result;
use crate::policy::{Policy, PolicyError, PolicyStore, Strategy};
use crate::ratelimit::{
    match_request, merge, Decision, DecisionRecord, GlobalCheckError, GlobalLimitClient,
    GlobalLimiter, LocalBucketEngine, MatchedDescriptor, RequestAttributes, Verdict,
};

/// The rate limit decision engine.
///
/// This struct is thread-safe; share it behind an `Arc` across request tasks.
pub struct RateLimitEngine {
    policy: PolicyStore,
    local: LocalBucketEngine,
    global: Option<Arc<dyn GlobalLimiter>>,
}

impl RateLimitEngine {
    /// Create an engine without a global limiter. Global rules then resolve
    /// through their failure mode.
    pub fn new(policy: PolicyStore, local: LocalBucketEngine) -> Self {
        Self {
            policy,
            local,
            global: None,
        }
    }

    pub fn with_global(mut self, global: Arc<dyn GlobalLimiter>) -> Self {
        self.global = Some(global);
        self
    }

    /// Build an engine from configuration, loading the policy file if one is
    /// set. Must be called within a Tokio runtime when a global endpoint is
    /// configured.
    pub fn from_config(config: &MeshguardConfig) -> Result<Self> {
        let policy = match &config.policy_path {
            Some(path) => PolicyStore::new(Policy::from_file(path)?)?,
            None => PolicyStore::empty(),
        };
        let engine = Self::new(policy, LocalBucketEngine::new(&config.local));

        if config.global.endpoint.is_some() {
            let client = GlobalLimitClient::new(&config.global)?;
            return Ok(engine.with_global(Arc::new(client)));
        }
        Ok(engine)
    }

    pub fn policy(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn local(&self) -> &LocalBucketEngine {
        &self.local
    }

    /// Validate and activate a new policy. An invalid policy is refused and
    /// the previous one keeps serving.
    pub fn update_policy(&self, policy: Policy) -> std::result::Result<u64, PolicyError> {
        self.policy.update(policy)
    }

    /// Decide whether to admit a request.
    ///
    /// Never fails: unreachable or misbehaving counting services resolve to a
    /// definite outcome through the failure mode. Dropping the returned future
    /// abandons any in-flight global call and leaves the engine untouched.
    pub async fn check(&self, attrs: &RequestAttributes) -> Decision {
        let snapshot = self.policy.snapshot();
        let policy = &snapshot.policy;

        let matched = match_request(policy, attrs);
        if matched.is_empty() {
            trace!(path = %attrs.path, version = snapshot.version, "No rate limit rules apply");
            return Decision::unrestricted(snapshot.version);
        }

        let (local, global): (Vec<_>, Vec<_>) = matched
            .into_iter()
            .partition(|m| m.strategy() == Strategy::Local);

        let mut verdicts = Vec::with_capacity(local.len() + 1);
        let mut records = Vec::with_capacity(local.len() + global.len());

        for m in &local {
            let started = Instant::now();
            let verdict = self
                .local
                .check(&m.bucket_key(), &m.limit)
                .for_rule(m.rule.clone())
                .in_shadow(m.shadow);
            records.push(record(m, &verdict, false, started));
            verdicts.push(verdict);
        }

        if let Some(first) = global.first() {
            let started = Instant::now();
            let result = match &self.global {
                Some(limiter) => limiter.check(&policy.domain, &global).await,
                None => Err(GlobalCheckError::NotConfigured),
            };

            let failed = result.is_err();
            let verdict = match result {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(
                        rule = %first.rule,
                        error = %e,
                        on_failure = ?first.failure_mode,
                        "Global check failed, applying failure mode"
                    );
                    Verdict::error().resolve(first.failure_mode)
                }
            }
            .for_rule(first.rule.clone())
            .in_shadow(first.shadow);

            for m in &global {
                records.push(record(m, &verdict, failed, started));
            }
            verdicts.push(verdict);
        }

        for r in &records {
            trace!(
                record = %serde_json::to_string(r).unwrap_or_default(),
                "Rate limit decision record"
            );
        }

        let decision = merge(&verdicts, records, &policy.response, snapshot.version);
        debug!(
            path = %attrs.path,
            route = ?attrs.route,
            allowed = decision.allowed,
            retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
            denied_by = ?decision.denied_by.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            version = decision.policy_version,
            "Rate limit decision"
        );
        decision
    }
}

fn record(m: &MatchedDescriptor, verdict: &Verdict, failed: bool, started: Instant) -> DecisionRecord {
    DecisionRecord {
        descriptor: m.descriptor.to_string(),
        rule: m.rule.clone(),
        strategy: m.strategy(),
        outcome: verdict.outcome,
        failed,
        shadow: m.shadow,
        latency_us: started.elapsed().as_micros() as u64,
    }
}
