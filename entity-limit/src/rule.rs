use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::condition::{UserLimit, Violation};
use crate::context::EvaluationContext;
use crate::query::{BUNDLE_FIELD, CountingQuery, EntityStore, Operator};

/// The serialized value of an [unlimited](Cap::Unlimited) cap.
pub const NO_LIMIT: i64 = -1;

/// The maximum number of existing entities before creation is denied.
///
/// In configuration, a cap is written as an integer. The sentinel [`NO_LIMIT`] (`-1`) marks a
/// cap that never denies. Other negative values are rejected.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Cap {
    /// Creation is denied once `count >= limit`.
    ///
    /// A limit of `0` denies every creation.
    Limited(u64),
    /// Creation is never denied.
    Unlimited,
}

impl Cap {
    /// Returns the numeric limit, or `None` if unlimited.
    pub fn as_limit(self) -> Option<u64> {
        match self {
            Self::Limited(limit) => Some(limit),
            Self::Unlimited => None,
        }
    }

    /// Returns `true` if `count` existing entities leave no room for another one.
    pub fn is_exceeded_by(self, count: u64) -> bool {
        match self {
            Self::Limited(limit) => count >= limit,
            Self::Unlimited => false,
        }
    }
}

impl fmt::Display for Cap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(limit) => limit.fmt(f),
            Self::Unlimited => f.write_str("unlimited"),
        }
    }
}

impl Serialize for Cap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Limited(limit) => serializer.serialize_u64(*limit),
            Self::Unlimited => serializer.serialize_i64(NO_LIMIT),
        }
    }
}

impl<'de> Deserialize<'de> for Cap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawCap {
            Limited(u64),
            Signed(i64),
        }

        match RawCap::deserialize(deserializer)? {
            RawCap::Limited(limit) => Ok(Self::Limited(limit)),
            RawCap::Signed(NO_LIMIT) => Ok(Self::Unlimited),
            RawCap::Signed(other) => Err(D::Error::custom(format_args!(
                "invalid limit {other}, expected a non-negative integer or {NO_LIMIT}"
            ))),
        }
    }
}

/// Whether a rule takes part in evaluation.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// The rule is visible to the engine.
    #[default]
    Enabled,
    /// The rule is kept in configuration but ignored.
    Disabled,
}

/// A configured quota on entity creation.
///
/// A rule governs one entity type and optionally a list of its bundles. Attached
/// [violations](Violation) scope the count to a sub-population, such as the entities owned by the
/// acting user.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LimitRule {
    /// Unique machine name of the rule.
    pub name: String,

    /// Human readable label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Whether the rule is enabled.
    #[serde(default)]
    pub status: RuleStatus,

    /// The entity type governed by this rule.
    pub entity_type: String,

    /// Bundles of the entity type governed by this rule.
    ///
    /// If empty, the rule applies to all bundles, including entities without bundle.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundles: Vec<String>,

    /// Number of existing entities at which creation is denied.
    pub limit: Cap,

    /// Violation conditions attached to this rule, in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Violation>,
}

impl LimitRule {
    /// Returns `true` if the rule is enabled.
    pub fn is_enabled(&self) -> bool {
        self.status == RuleStatus::Enabled
    }

    /// Returns `true` if this rule governs the given entity type.
    pub fn applies_to_entity(&self, entity_type: &str) -> bool {
        self.entity_type == entity_type
    }

    /// Returns `true` if this rule governs the given bundle.
    ///
    /// A rule without bundles applies to every bundle. A rule with bundles never applies to an
    /// entity without bundle.
    pub fn applies_to_bundle(&self, bundle: Option<&str>) -> bool {
        self.bundles.is_empty() || bundle.is_some_and(|b| self.bundles.iter().any(|r| r == b))
    }

    /// Returns `true` if this rule governs the entity described by `context`.
    pub fn matches(&self, context: &EvaluationContext) -> bool {
        self.applies_to_entity(&context.entity_type)
            && self.applies_to_bundle(context.bundle_name())
    }

    /// Returns the first attached per-user condition.
    pub fn user_limit(&self) -> Option<&UserLimit> {
        self.conditions.iter().find_map(|condition| match condition {
            Violation::UserLimit(user_limit) => Some(user_limit),
            _ => None,
        })
    }

    /// Builds the unscoped count query of this rule.
    ///
    /// The query covers all entities of `entity_type` and, if the rule lists bundles, restricts
    /// them to those bundles. The quota is shared across all bundles of the rule.
    pub fn base_count_query<S>(&self, store: &S, entity_type: &str) -> S::Query
    where
        S: EntityStore + ?Sized,
    {
        let mut query = store.count_query(entity_type);

        if !self.bundles.is_empty() {
            let bundles = self.bundles.iter().cloned().map(Value::String).collect();
            query.add_condition(BUNDLE_FIELD, Value::Array(bundles), Operator::In);
        }

        query
    }
}
