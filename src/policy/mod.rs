//! Rate limit policy model, validation and snapshot management.

mod rules;
mod store;

pub use rules::{
    DescriptorTemplate, EntryTemplate, FailureMode, Limit, Policy, PolicyError, ResponseSettings,
    Rule, RuleScope, ScopeRules, Strategy,
};
pub use store::{PolicySnapshot, PolicyStore};
