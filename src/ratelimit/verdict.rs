//! Per-rule verdicts produced by the local and global strategies.

use serde::Serialize;
use std::time::Duration;

use crate::policy::{FailureMode, RuleScope, Strategy};

/// The result of evaluating one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Admit,
    Deny,
    /// The strategy could not reach a decision
    Error,
}

/// Identifies the rule behind a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RuleRef {
    pub scope: RuleScope,
    pub strategy: Strategy,
    pub name: Option<String>,
}

impl std::fmt::Display for RuleRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.strategy)?;
        if let Some(name) = &self.name {
            write!(f, "({})", name)?;
        }
        Ok(())
    }
}

/// Quota state reported alongside a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    /// Requests allowed per window
    pub limit: u64,
    pub window: Duration,
    /// Requests left before the limit is hit
    pub remaining: u64,
    /// Time until the quota is fully replenished
    pub reset_after: Duration,
}

/// An immutable verdict for one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub outcome: Outcome,
    /// How long the client should wait before retrying
    pub retry_after: Option<Duration>,
    pub rule: Option<RuleRef>,
    pub quota: Option<Quota>,
    /// A shadow-mode denial is reported but not enforced
    pub shadow: bool,
}

impl Verdict {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            retry_after: None,
            rule: None,
            quota: None,
            shadow: false,
        }
    }

    pub fn admit() -> Self {
        Self::with_outcome(Outcome::Admit)
    }

    pub fn deny(retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::with_outcome(Outcome::Deny)
        }
    }

    pub fn error() -> Self {
        Self::with_outcome(Outcome::Error)
    }

    pub fn for_rule(mut self, rule: RuleRef) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn with_quota(mut self, quota: Quota) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn in_shadow(mut self, shadow: bool) -> Self {
        self.shadow = shadow;
        self
    }

    pub fn is_admit(&self) -> bool {
        self.outcome == Outcome::Admit
    }

    pub fn is_deny(&self) -> bool {
        self.outcome == Outcome::Deny
    }

    /// Turn an error into a definite outcome according to `mode`.
    pub fn resolve(self, mode: FailureMode) -> Self {
        if self.outcome != Outcome::Error {
            return self;
        }
        let outcome = match mode {
            FailureMode::Allow => Outcome::Admit,
            FailureMode::Deny => Outcome::Deny,
        };
        Self { outcome, ..self }
    }
}
