//! Rate limit policy documents and validation.
//!
//! A policy declares a vhost-default scope and per-route override scopes.
//! Each scope holds at most one local rule (in-process token buckets) and at
//! most one global rule (shared counting service). A route override replaces
//! the vhost scope entirely for that route.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors raised while loading or validating a policy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("failed to parse policy: {0}")]
    Parse(String),
    #[error("rule {rule}: {reason}")]
    InvalidLimit { rule: String, reason: String },
    #[error("rule {rule} has no descriptors")]
    NoDescriptors { rule: String },
    #[error("rule {rule}: descriptor {index} has no entries")]
    EmptyDescriptor { rule: String, index: usize },
    #[error("rule {rule}: descriptor {index} has no limit and the rule declares none")]
    MissingLimit { rule: String, index: usize },
    #[error("rule {rule}: descriptor {index}: {reason}")]
    InvalidEntry {
        rule: String,
        index: usize,
        reason: String,
    },
    #[error("rule {rule}: on_failure only applies to global rules")]
    FailureModeOnLocal { rule: String },
    #[error("invalid deny status {0}, expected a 4xx or 5xx code")]
    InvalidStatus(u16),
    #[error("route id must not be empty")]
    EmptyRouteId,
}

/// Where a rule's counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Token buckets held in this process
    Local,
    /// Counters held by the shared counting service
    Global,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Local => f.write_str("local"),
            Strategy::Global => f.write_str("global"),
        }
    }
}

/// What a global rule does when the counting service cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request (fail open)
    #[default]
    Allow,
    /// Reject the request (fail closed)
    Deny,
}

/// The policy level a rule was declared at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "route", rename_all = "snake_case")]
pub enum RuleScope {
    VhostDefault,
    Route(String),
}

impl RuleScope {
    /// Stable label used to namespace bucket keys and in log fields.
    pub fn label(&self) -> String {
        match self {
            RuleScope::VhostDefault => "vhost".to_string(),
            RuleScope::Route(id) => format!("route:{}", id),
        }
    }
}

impl std::fmt::Display for RuleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Longest accepted window.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// A request quota: `requests` per `window`, with an optional burst size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    /// Number of requests allowed per window
    pub requests: u64,
    /// Window length, written as a duration string such as `10s` or `1m`
    #[serde(with = "window_format")]
    pub window: Duration,
    /// Bucket capacity; defaults to `requests`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u64>,
}

impl Limit {
    pub fn new(requests: u64, window: Duration) -> Self {
        Self {
            requests,
            window,
            burst: None,
        }
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Maximum tokens a bucket for this limit can hold.
    pub fn capacity(&self) -> f64 {
        self.burst.unwrap_or(self.requests) as f64
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.requests as f64 / self.window.as_secs_f64()
    }

    fn validate(&self, rule: &str) -> Result<(), PolicyError> {
        let invalid = |reason: &str| PolicyError::InvalidLimit {
            rule: rule.to_string(),
            reason: reason.to_string(),
        };

        if self.requests == 0 {
            return Err(invalid("requests must be greater than zero"));
        }
        if self.requests > u32::MAX as u64 {
            return Err(invalid("requests must fit in 32 bits"));
        }
        if self.window.is_zero() {
            return Err(invalid("window must be greater than zero"));
        }
        if self.window > MAX_WINDOW {
            return Err(invalid("window must not exceed 366 days"));
        }
        match self.burst {
            Some(0) => return Err(invalid("burst must be at least one")),
            Some(burst) if burst > u32::MAX as u64 => {
                return Err(invalid("burst must fit in 32 bits"))
            }
            _ => {}
        }
        Ok(())
    }
}

mod window_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(window: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*window).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// One component of a descriptor, resolved from request attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryTemplate {
    /// The downstream client address
    RemoteAddress {
        #[serde(default)]
        key: Option<String>,
    },
    /// The matched route id
    Route {
        #[serde(default)]
        key: Option<String>,
    },
    /// The request method
    Method {
        #[serde(default)]
        key: Option<String>,
    },
    /// The request path
    Path {
        #[serde(default)]
        key: Option<String>,
    },
    /// The value of a request header
    RequestHeader {
        header_name: String,
        descriptor_key: String,
    },
    /// A fixed key/value pair
    GenericKey {
        #[serde(default = "default_generic_key")]
        descriptor_key: String,
        descriptor_value: String,
    },
}

fn default_generic_key() -> String {
    "generic_key".to_string()
}

impl EntryTemplate {
    /// The descriptor key this template produces.
    pub fn descriptor_key(&self) -> &str {
        match self {
            EntryTemplate::RemoteAddress { key } => key.as_deref().unwrap_or("remote_address"),
            EntryTemplate::Route { key } => key.as_deref().unwrap_or("route"),
            EntryTemplate::Method { key } => key.as_deref().unwrap_or("method"),
            EntryTemplate::Path { key } => key.as_deref().unwrap_or("path"),
            EntryTemplate::RequestHeader { descriptor_key, .. } => descriptor_key,
            EntryTemplate::GenericKey { descriptor_key, .. } => descriptor_key,
        }
    }
}

/// An ordered list of entry templates, optionally with its own limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorTemplate {
    pub entries: Vec<EntryTemplate>,
    /// Overrides the rule's limit for this descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Limit>,
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Optional name, reported with decisions
    #[serde(default)]
    pub name: Option<String>,
    /// Limit applied to descriptors without their own
    #[serde(default)]
    pub limit: Option<Limit>,
    /// Descriptors produced for each matching request
    #[serde(default)]
    pub descriptors: Vec<DescriptorTemplate>,
    /// Behavior when the counting service cannot answer (global only)
    #[serde(default)]
    pub on_failure: Option<FailureMode>,
    /// Count and report denials without enforcing them
    #[serde(default)]
    pub shadow: bool,
}

impl Rule {
    /// The failure mode, defaulting to allow.
    pub fn failure_mode(&self) -> FailureMode {
        self.on_failure.unwrap_or_default()
    }

    /// The effective limit for the descriptor at `index`.
    pub fn limit_for(&self, index: usize) -> Option<&Limit> {
        self.descriptors
            .get(index)
            .and_then(|d| d.limit.as_ref())
            .or(self.limit.as_ref())
    }

    fn validate(&self, label: &str, strategy: Strategy) -> Result<(), PolicyError> {
        if strategy == Strategy::Local && self.on_failure.is_some() {
            return Err(PolicyError::FailureModeOnLocal {
                rule: label.to_string(),
            });
        }
        if let Some(limit) = &self.limit {
            limit.validate(label)?;
        }
        if self.descriptors.is_empty() {
            return Err(PolicyError::NoDescriptors {
                rule: label.to_string(),
            });
        }

        for (index, descriptor) in self.descriptors.iter().enumerate() {
            if descriptor.entries.is_empty() {
                return Err(PolicyError::EmptyDescriptor {
                    rule: label.to_string(),
                    index,
                });
            }
            match &descriptor.limit {
                Some(limit) => limit.validate(label)?,
                None if self.limit.is_none() => {
                    return Err(PolicyError::MissingLimit {
                        rule: label.to_string(),
                        index,
                    })
                }
                None => {}
            }
            for entry in &descriptor.entries {
                validate_entry(entry).map_err(|reason| PolicyError::InvalidEntry {
                    rule: label.to_string(),
                    index,
                    reason,
                })?;
            }
        }
        Ok(())
    }
}

fn validate_entry(entry: &EntryTemplate) -> Result<(), String> {
    if let EntryTemplate::RequestHeader { header_name, .. } = entry {
        if header_name.is_empty() {
            return Err("header_name must not be empty".to_string());
        }
    }
    if entry.descriptor_key().is_empty() {
        return Err("descriptor key must not be empty".to_string());
    }
    Ok(())
}

/// The rules declared at one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeRules {
    #[serde(default)]
    pub local: Option<Rule>,
    #[serde(default)]
    pub global: Option<Rule>,
}

impl ScopeRules {
    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.global.is_none()
    }

    fn validate(&self, scope: &RuleScope) -> Result<(), PolicyError> {
        if let Some(rule) = &self.local {
            rule.validate(&format!("{}/local", scope), Strategy::Local)?;
        }
        if let Some(rule) = &self.global {
            rule.validate(&format!("{}/global", scope), Strategy::Global)?;
        }
        Ok(())
    }
}

/// How denials are rendered to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSettings {
    /// HTTP status for denied requests
    #[serde(default = "default_deny_status")]
    pub deny_status: u16,
    /// Add `x-ratelimit-limit`, `-remaining` and `-reset` to denials
    #[serde(default)]
    pub rate_limit_headers: bool,
}

impl Default for ResponseSettings {
    fn default() -> Self {
        Self {
            deny_status: default_deny_status(),
            rate_limit_headers: false,
        }
    }
}

fn default_deny_status() -> u16 {
    429
}

/// A complete rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Counter namespace sent to the shared counting service
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Whether header templates match header names exactly
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive_headers: bool,
    #[serde(default)]
    pub response: ResponseSettings,
    /// Rules applied to routes without an override
    #[serde(default)]
    pub vhost: ScopeRules,
    /// Per-route overrides, keyed by route id
    #[serde(default)]
    pub routes: HashMap<String, ScopeRules>,
}

fn default_domain() -> String {
    "mesh".to_string()
}

fn default_case_sensitive() -> bool {
    true
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            case_sensitive_headers: default_case_sensitive(),
            response: ResponseSettings::default(),
            vhost: ScopeRules::default(),
            routes: HashMap::new(),
        }
    }
}

impl Policy {
    /// Load a policy from a YAML file and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policy");

        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&contents)?)
    }

    /// Parse a policy from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self, PolicyError> {
        let policy: Policy =
            serde_yaml::from_str(yaml).map_err(|e| PolicyError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Check every rule and response setting.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let status = self.response.deny_status;
        if !(400..=599).contains(&status) {
            return Err(PolicyError::InvalidStatus(status));
        }

        self.vhost.validate(&RuleScope::VhostDefault)?;
        for (route, rules) in &self.routes {
            if route.is_empty() {
                return Err(PolicyError::EmptyRouteId);
            }
            rules.validate(&RuleScope::Route(route.clone()))?;
        }
        Ok(())
    }

    /// Select the scope governing a request.
    ///
    /// A route with an override entry always wins over the vhost default,
    /// even when the override declares no rules.
    pub fn scope_for(&self, route: Option<&str>) -> (RuleScope, &ScopeRules) {
        match route.and_then(|r| self.routes.get_key_value(r)) {
            Some((id, rules)) => (RuleScope::Route(id.clone()), rules),
            None => (RuleScope::VhostDefault, &self.vhost),
        }
    }
}
