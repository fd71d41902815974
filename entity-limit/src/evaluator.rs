use serde::Serialize;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::condition::{ConditionError, ConditionId};
use crate::context::EvaluationContext;
use crate::query::{CountError, CountingQuery, EntityStore};
use crate::rule::LimitRule;
use crate::selector::GoverningGroup;

/// An error that prevents an admission decision.
///
/// None of these errors implies a decision. Callers choosing to fail closed must deny explicitly.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// The enabled rules could not be loaded.
    #[error("failed to load enabled limit rules")]
    Catalog(#[from] CatalogError),

    /// A condition attached to a rule could not be decided or applied.
    #[error("condition of limit rule {rule} failed")]
    Condition {
        /// Name of the rule.
        rule: String,
        /// The condition error.
        #[source]
        source: ConditionError,
    },

    /// The count query of a rule failed.
    #[error("failed to count entities for limit rule {rule}")]
    Count {
        /// Name of the rule.
        rule: String,
        /// The backend error.
        #[source]
        source: CountError,
    },
}

impl EvaluationError {
    pub(crate) fn condition(rule: &LimitRule, source: ConditionError) -> Self {
        Self::Condition {
            rule: rule.name.clone(),
            source,
        }
    }

    fn count(rule: &LimitRule, source: CountError) -> Self {
        Self::Count {
            rule: rule.name.clone(),
            source,
        }
    }
}

/// Describes the rule that denied an entity creation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LimitViolation {
    /// Name of the violated rule.
    pub rule: String,
    /// The condition kind that scoped the count, if any.
    pub condition: Option<ConditionId>,
    /// The number of existing entities counted.
    pub count: u64,
    /// The cap of the rule.
    pub limit: u64,
}

/// The admission decision for a pending entity creation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    /// The entity may be created.
    Admit,
    /// A limit is reached and creation must be blocked.
    Deny(LimitViolation),
}

impl Decision {
    /// Returns `true` if creation is admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }

    /// Returns `true` if a limit is violated.
    pub fn is_violated(&self) -> bool {
        !self.is_admitted()
    }

    /// Returns the violated limit of a denial.
    pub fn violation(&self) -> Option<&LimitViolation> {
        match self {
            Self::Admit => None,
            Self::Deny(violation) => Some(violation),
        }
    }
}

/// Compares the governing rules against their caps.
#[derive(Debug)]
pub struct LimitEvaluator<'s, S: ?Sized> {
    store: &'s S,
}

impl<'s, S> LimitEvaluator<'s, S>
where
    S: EntityStore + ?Sized,
{
    /// Creates an evaluator counting through `store`.
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Evaluates a governing group.
    ///
    /// Rules are visited in selection order. Each rule's base query is narrowed by its matched
    /// condition and counted. The first rule whose count reached its cap denies, and no further
    /// rules are counted. Unlimited rules are counted but never deny. An empty group admits.
    pub fn evaluate(
        &self,
        context: &EvaluationContext,
        group: &GoverningGroup<'_>,
    ) -> Result<Decision, EvaluationError> {
        for limit in group.iter() {
            let rule = limit.rule;
            let mut query = rule.base_count_query(self.store, &context.entity_type);

            if let Some(condition) = limit.condition {
                condition
                    .narrow(&mut query, context)
                    .map_err(|source| EvaluationError::condition(rule, source))?;
            }

            let count = query
                .execute_count()
                .map_err(|source| EvaluationError::count(rule, source))?;

            entity_limit_log::trace!(
                rule = rule.name.as_str(),
                count,
                limit = %rule.limit,
                "counted entities"
            );

            if let Some(cap) = rule.limit.as_limit().filter(|&cap| count >= cap) {
                return Ok(Decision::Deny(LimitViolation {
                    rule: rule.name.clone(),
                    condition: limit.condition.and_then(|condition| condition.id().ok()),
                    count,
                    limit: cap,
                }));
            }
        }

        Ok(Decision::Admit)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::condition::{ConditionCatalog, UserLimit, Violation};
    use crate::context::Actor;
    use crate::memory::{MemoryStore, StoredEntity};
    use crate::query::{BUNDLE_FIELD, OWNER_FIELD};
    use crate::rule::Cap;
    use crate::selector::RuleSelector;
    use crate::testutils::rule;

    fn evaluate(
        store: &MemoryStore,
        rules: &[LimitRule],
        context: &EvaluationContext,
    ) -> Result<Decision, EvaluationError> {
        let catalog = ConditionCatalog::builtin();
        let group = RuleSelector::new(&catalog).select_governing_group(rules, context)?;
        LimitEvaluator::new(store).evaluate(context, &group)
    }

    fn articles(store: &MemoryStore, owner: u64, count: usize) {
        for _ in 0..count {
            store.insert(StoredEntity::new("node").bundle("article").owner(owner));
        }
    }

    #[test]
    fn test_empty_group_admits() {
        entity_limit_log::init_test!();

        let store = MemoryStore::recording();
        let context = EvaluationContext::new("node");

        let decision = LimitEvaluator::new(&store)
            .evaluate(&context, &GoverningGroup::default())
            .unwrap();

        assert_eq!(decision, Decision::Admit);
        assert!(store.executed().is_empty());
    }

    #[test]
    fn test_unlimited_never_denies() {
        entity_limit_log::init_test!();

        let store = MemoryStore::recording();
        articles(&store, 1, 50);

        let rules = [rule("unlimited", &["article"], Cap::Unlimited, vec![])];
        let context = EvaluationContext::new("node").bundle("article");

        assert!(evaluate(&store, &rules, &context).unwrap().is_admitted());
        // The count still runs.
        assert_eq!(store.executed().len(), 1);
    }

    #[test]
    fn test_threshold_exactness() {
        entity_limit_log::init_test!();

        let store = MemoryStore::recording();
        articles(&store, 1, 2);

        let rules = [rule("three", &["article"], Cap::Limited(3), vec![])];
        let context = EvaluationContext::new("node").bundle("article");

        assert_eq!(evaluate(&store, &rules, &context).unwrap(), Decision::Admit);

        articles(&store, 1, 1);
        assert_eq!(
            evaluate(&store, &rules, &context).unwrap(),
            Decision::Deny(LimitViolation {
                rule: "three".to_owned(),
                condition: None,
                count: 3,
                limit: 3,
            })
        );
    }

    #[test]
    fn test_zero_limit_denies() {
        let store = MemoryStore::recording();
        let rules = [rule("closed", &[], Cap::Limited(0), vec![])];

        let decision = evaluate(&store, &rules, &EvaluationContext::new("node")).unwrap();
        assert!(decision.is_violated());
    }

    #[test]
    fn test_short_circuit() {
        entity_limit_log::init_test!();

        let store = MemoryStore::recording();
        articles(&store, 1, 1);
        store.insert(StoredEntity::new("node").bundle("page"));

        let rules = [
            rule("first", &["article", "page"], Cap::Limited(10), vec![]),
            rule("second", &["article"], Cap::Limited(1), vec![]),
            rule("third", &[], Cap::Limited(0), vec![]),
        ];
        let context = EvaluationContext::new("node").bundle("article");

        let decision = evaluate(&store, &rules, &context).unwrap();
        assert_eq!(decision.violation().map(|v| v.rule.as_str()), Some("second"));

        // Only the first two rules were counted, the third query never ran.
        let executed = store.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(
            executed[1].filter_value(BUNDLE_FIELD),
            Some(&json!(["article"]))
        );
        assert!(executed.iter().all(|query| !query.filters.is_empty()));
    }

    #[test]
    fn test_first_violation_reported() {
        let store = MemoryStore::recording();
        articles(&store, 1, 5);

        // The second rule is stricter, but the first violated rule is reported.
        let rules = [
            rule("loose", &[], Cap::Limited(4), vec![]),
            rule("strict", &[], Cap::Limited(1), vec![]),
        ];

        let decision = evaluate(&store, &rules, &EvaluationContext::new("node")).unwrap();
        assert_eq!(decision.violation().map(|v| v.rule.as_str()), Some("loose"));
    }

    #[test]
    fn test_condition_narrows_count() {
        entity_limit_log::init_test!();

        let store = MemoryStore::recording();
        articles(&store, 1, 3);
        articles(&store, 2, 1);

        let rules = [rule(
            "per_user",
            &["article"],
            Cap::Limited(2),
            vec![Violation::UserLimit(UserLimit::default())],
        )];

        let first = EvaluationContext::new("node")
            .bundle("article")
            .actor(Actor::new(1));
        let decision = evaluate(&store, &rules, &first).unwrap();

        assert_eq!(
            decision,
            Decision::Deny(LimitViolation {
                rule: "per_user".to_owned(),
                condition: Some(ConditionId::UserLimit),
                count: 3,
                limit: 2,
            })
        );

        let second = EvaluationContext::new("node")
            .bundle("article")
            .actor(Actor::new(2));
        assert!(evaluate(&store, &rules, &second).unwrap().is_admitted());
        assert_eq!(
            store.executed()[1].filter_value(OWNER_FIELD),
            Some(&json!(2))
        );
    }

    #[test]
    fn test_priority_precedence_skips_lower_kinds() {
        entity_limit_log::init_test!();

        let store = MemoryStore::recording();
        articles(&store, 1, 1);

        let rules = [
            rule(
                "per_role",
                &["article"],
                Cap::Limited(0),
                vec![Violation::RoleLimit(crate::condition::RoleLimit {
                    roles: vec!["editor".to_owned()],
                })],
            ),
            rule(
                "per_user",
                &[],
                Cap::Limited(5),
                vec![Violation::UserLimit(UserLimit::default())],
            ),
        ];
        let context = EvaluationContext::new("node")
            .bundle("article")
            .actor(Actor::new(1).with_role("editor"));

        // The role rule would deny, but the user kind outranks it and is the only one counted.
        assert!(evaluate(&store, &rules, &context).unwrap().is_admitted());

        let executed = store.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].filter_value(BUNDLE_FIELD), None);
    }

    #[test]
    fn test_count_failure_propagates() {
        let store = MemoryStore::recording();
        store.set_unavailable(true);

        let rules = [rule("any", &[], Cap::Unlimited, vec![])];
        let error = evaluate(&store, &rules, &EvaluationContext::new("node")).unwrap_err();

        assert!(matches!(error, EvaluationError::Count { ref rule, .. } if rule == "any"));
        assert_eq!(error.to_string(), "failed to count entities for limit rule any");
    }

    #[test]
    fn test_serialize_decision() {
        let decision = Decision::Deny(LimitViolation {
            rule: "per_user".to_owned(),
            condition: Some(ConditionId::UserLimit),
            count: 3,
            limit: 2,
        });

        insta::assert_json_snapshot!(decision, @r#"
        {
          "decision": "deny",
          "rule": "per_user",
          "condition": "user_limit",
          "count": 3,
          "limit": 2
        }
        "#);
    }
}
