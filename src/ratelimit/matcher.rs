//! Descriptor matching: turns a request into the descriptors to evaluate.

use http::Method;
use std::net::IpAddr;
use tracing::trace;

use super::descriptor::{Descriptor, DescriptorKey};
use super::verdict::RuleRef;
use crate::policy::{
    DescriptorTemplate, EntryTemplate, FailureMode, Limit, Policy, Rule, RuleScope, Strategy,
};

/// The request attributes descriptors are resolved from.
#[derive(Debug, Clone, Default)]
pub struct RequestAttributes {
    pub method: Method,
    pub path: String,
    /// Header names as received
    pub headers: Vec<(String, String)>,
    pub remote_address: Option<IpAddr>,
    /// Id of the route the proxy matched, if any
    pub route: Option<String>,
}

impl RequestAttributes {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_remote_address(mut self, addr: IpAddr) -> Self {
        self.remote_address = Some(addr);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    /// First value of header `name`.
    pub fn header(&self, name: &str, case_sensitive: bool) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| {
                if case_sensitive {
                    k == name
                } else {
                    k.eq_ignore_ascii_case(name)
                }
            })
            .map(|(_, v)| v.as_str())
    }
}

/// A descriptor resolved from a request, with everything needed to check it.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedDescriptor {
    pub rule: RuleRef,
    pub descriptor: Descriptor,
    pub limit: Limit,
    pub failure_mode: FailureMode,
    pub shadow: bool,
}

impl MatchedDescriptor {
    pub fn strategy(&self) -> Strategy {
        self.rule.strategy
    }

    /// Key for the local bucket map, namespaced by the owning scope.
    pub fn bucket_key(&self) -> DescriptorKey {
        DescriptorKey::new(&self.rule.scope.label(), &self.descriptor)
    }
}

/// Resolve the descriptors that apply to a request.
///
/// The route override scope, when the request's route has one, fully shadows
/// the vhost default. Within the chosen scope local descriptors come before
/// global ones, each in declaration order. An empty result means no rule
/// applies and the request is admitted.
pub fn match_request(policy: &Policy, attrs: &RequestAttributes) -> Vec<MatchedDescriptor> {
    let (scope, rules) = policy.scope_for(attrs.route.as_deref());

    let mut matched = Vec::new();
    let candidates = [
        (Strategy::Local, rules.local.as_ref()),
        (Strategy::Global, rules.global.as_ref()),
    ];
    for (strategy, rule) in candidates {
        if let Some(rule) = rule {
            collect_rule(policy, &scope, strategy, rule, attrs, &mut matched);
        }
    }

    trace!(
        scope = %scope,
        route = ?attrs.route,
        matched = matched.len(),
        "Matched request against policy"
    );
    matched
}

fn collect_rule(
    policy: &Policy,
    scope: &RuleScope,
    strategy: Strategy,
    rule: &Rule,
    attrs: &RequestAttributes,
    out: &mut Vec<MatchedDescriptor>,
) {
    let rule_ref = RuleRef {
        scope: scope.clone(),
        strategy,
        name: rule.name.clone(),
    };

    for (index, template) in rule.descriptors.iter().enumerate() {
        // Validation guarantees a limit, but a snapshot built by hand may not
        let Some(limit) = rule.limit_for(index) else {
            trace!(rule = %rule_ref, index = index, "Skipping descriptor without a limit");
            continue;
        };

        out.push(MatchedDescriptor {
            rule: rule_ref.clone(),
            descriptor: resolve(template, attrs, policy.case_sensitive_headers),
            limit: limit.clone(),
            failure_mode: rule.failure_mode(),
            shadow: rule.shadow,
        });
    }
}

/// Resolve a template against a request. Missing attributes become "".
fn resolve(template: &DescriptorTemplate, attrs: &RequestAttributes, case_sensitive: bool) -> Descriptor {
    let mut descriptor = Descriptor::new();
    for entry in &template.entries {
        let value = match entry {
            EntryTemplate::RemoteAddress { .. } => attrs
                .remote_address
                .map(|a| a.to_string())
                .unwrap_or_default(),
            EntryTemplate::Route { .. } => attrs.route.clone().unwrap_or_default(),
            EntryTemplate::Method { .. } => attrs.method.to_string(),
            EntryTemplate::Path { .. } => attrs.path.clone(),
            EntryTemplate::RequestHeader { header_name, .. } => attrs
                .header(header_name, case_sensitive)
                .unwrap_or_default()
                .to_string(),
            EntryTemplate::GenericKey {
                descriptor_value, ..
            } => descriptor_value.clone(),
        };
        descriptor.push(entry.descriptor_key(), value);
    }
    descriptor
}
