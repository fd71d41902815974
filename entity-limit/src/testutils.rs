//! Utilities used by the selection and evaluation tests.

use crate::condition::Violation;
use crate::rule::{Cap, LimitRule, RuleStatus};

/// Creates an enabled `node` rule.
pub fn rule(name: &str, bundles: &[&str], limit: Cap, conditions: Vec<Violation>) -> LimitRule {
    LimitRule {
        name: name.to_owned(),
        label: None,
        status: RuleStatus::Enabled,
        entity_type: "node".to_owned(),
        bundles: bundles.iter().map(|&b| b.to_owned()).collect(),
        limit,
        conditions,
    }
}
