//! Selection of the governing group of limit rules.
//!
//! Selection runs in two phases. First, every rule governing the pending entity is recorded under
//! the first of its conditions that applies, or under [`GroupKey::Unconditioned`] if none does.
//! Second, the group of the condition kind with the highest precedence in the
//! [`ConditionCatalog`] wins. The unconditioned group is only used if no condition kind has any
//! recorded rules.

use std::fmt;

use indexmap::IndexMap;

use crate::condition::{ConditionCatalog, ConditionId, Violation};
use crate::context::EvaluationContext;
use crate::evaluator::EvaluationError;
use crate::rule::LimitRule;

/// Key of a group of applicable rules.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum GroupKey {
    /// Rules whose first applying condition is of the given kind.
    Condition(ConditionId),
    /// Rules for which none of their conditions applies, including rules without conditions.
    Unconditioned,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Condition(id) => id.fmt(f),
            Self::Unconditioned => f.write_str("unconditioned"),
        }
    }
}

/// A rule recorded for evaluation together with the condition that scopes it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApplicableLimit<'a> {
    /// The governing rule.
    pub rule: &'a LimitRule,
    /// The condition narrowing the count of this rule, if any.
    pub condition: Option<&'a Violation>,
}

type LimitMap<'a> = IndexMap<&'a str, ApplicableLimit<'a>>;

/// All rules applicable to a pending entity, grouped by their matching condition kind.
///
/// Each rule is recorded under exactly one key. Groups keep the order in which rules were
/// recorded.
#[derive(Clone, Debug, Default)]
pub struct ApplicableSet<'a> {
    groups: IndexMap<GroupKey, LimitMap<'a>>,
}

impl<'a> ApplicableSet<'a> {
    /// Records a rule under `key`.
    ///
    /// A rule recorded twice under the same key replaces the earlier entry.
    pub fn insert(&mut self, key: GroupKey, limit: ApplicableLimit<'a>) {
        self.groups
            .entry(key)
            .or_default()
            .insert(limit.rule.name.as_str(), limit);
    }

    /// Returns the rules recorded under `key`.
    pub fn group(&self, key: GroupKey) -> Option<&LimitMap<'a>> {
        self.groups.get(&key)
    }

    /// Returns the keys of all non-empty groups.
    pub fn keys(&self) -> impl Iterator<Item = GroupKey> + '_ {
        self.groups
            .iter()
            .filter(|(_, limits)| !limits.is_empty())
            .map(|(key, _)| *key)
    }

    /// Returns `true` if no rule was recorded.
    pub fn is_empty(&self) -> bool {
        self.groups.values().all(IndexMap::is_empty)
    }

    /// Returns the total number of recorded rules.
    pub fn len(&self) -> usize {
        self.groups.values().map(IndexMap::len).sum()
    }

    fn take(&mut self, key: GroupKey) -> Option<LimitMap<'a>> {
        self.groups
            .swap_remove(&key)
            .filter(|limits| !limits.is_empty())
    }
}

/// The rules selected for evaluation.
#[derive(Clone, Debug, Default)]
pub struct GoverningGroup<'a> {
    key: Option<GroupKey>,
    limits: LimitMap<'a>,
}

impl<'a> GoverningGroup<'a> {
    /// Returns the key of the selected group, or `None` if no rule governs.
    pub fn key(&self) -> Option<GroupKey> {
        self.key
    }

    /// Returns `true` if no rule governs.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// Returns the number of governing rules.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Returns the governing rule with the given name.
    pub fn get(&self, name: &str) -> Option<&ApplicableLimit<'a>> {
        self.limits.get(name)
    }

    /// Iterates the governing rules in selection order.
    pub fn iter(&self) -> impl Iterator<Item = &ApplicableLimit<'a>> {
        self.limits.values()
    }

    /// Iterates the names of the governing rules in selection order.
    pub fn rule_names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.limits.keys().copied()
    }
}

/// Selects the rules governing a pending entity creation.
#[derive(Clone, Copy, Debug)]
pub struct RuleSelector<'c> {
    conditions: &'c ConditionCatalog,
}

impl<'c> RuleSelector<'c> {
    /// Creates a selector resolving precedence through `conditions`.
    pub fn new(conditions: &'c ConditionCatalog) -> Self {
        Self { conditions }
    }

    /// Groups all rules governing the entity described by `context`.
    ///
    /// For every rule matching the entity type and bundle, the attached conditions are checked in
    /// order and the first one that applies determines the group. A failing condition aborts the
    /// selection.
    pub fn applicable<'r>(
        &self,
        rules: &'r [LimitRule],
        context: &EvaluationContext,
    ) -> Result<ApplicableSet<'r>, EvaluationError> {
        let mut applicable = ApplicableSet::default();

        for rule in rules.iter().filter(|rule| rule.matches(context)) {
            let mut key = GroupKey::Unconditioned;
            let mut matched = None;

            for condition in &rule.conditions {
                let applies = condition
                    .applies(context)
                    .map_err(|source| EvaluationError::condition(rule, source))?;

                if applies {
                    let id = condition
                        .id()
                        .map_err(|source| EvaluationError::condition(rule, source))?;
                    if !self.conditions.contains(id) {
                        entity_limit_log::warn!(
                            rule = rule.name.as_str(),
                            condition = %id,
                            "limit rule matched an unregistered condition kind"
                        );
                    }
                    key = GroupKey::Condition(id);
                    matched = Some(condition);
                    break;
                }
            }

            entity_limit_log::trace!(
                rule = rule.name.as_str(),
                group = %key,
                "recorded applicable rule"
            );

            applicable.insert(
                key,
                ApplicableLimit {
                    rule,
                    condition: matched,
                },
            );
        }

        Ok(applicable)
    }

    /// Picks the governing group from an applicable set.
    ///
    /// Condition kinds are visited in [priority order](ConditionCatalog::priority_order) and the
    /// first kind with recorded rules wins. Groups of kinds missing from the catalog are never
    /// selected. If no kind has rules, the unconditioned group governs. Otherwise, the result is
    /// empty.
    pub fn select<'r>(&self, mut applicable: ApplicableSet<'r>) -> GoverningGroup<'r> {
        let candidates = self
            .conditions
            .priority_order()
            .into_iter()
            .map(GroupKey::Condition)
            .chain(std::iter::once(GroupKey::Unconditioned));

        for key in candidates {
            if let Some(limits) = applicable.take(key) {
                entity_limit_log::debug!(
                    group = %key,
                    rules = limits.len(),
                    "selected governing group"
                );
                return GoverningGroup {
                    key: Some(key),
                    limits,
                };
            }
        }

        GoverningGroup::default()
    }

    /// Selects the rules governing the entity described by `context`.
    ///
    /// This combines [`applicable`](Self::applicable) and [`select`](Self::select).
    pub fn select_governing_group<'r>(
        &self,
        rules: &'r [LimitRule],
        context: &EvaluationContext,
    ) -> Result<GoverningGroup<'r>, EvaluationError> {
        let applicable = self.applicable(rules, context)?;
        Ok(self.select(applicable))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::condition::{ConditionError, FieldLimit, RoleLimit, UserLimit};
    use crate::context::Actor;
    use crate::rule::Cap;
    use crate::testutils::rule;

    fn user_limit() -> Violation {
        Violation::UserLimit(UserLimit::default())
    }

    fn editor_limit() -> Violation {
        Violation::RoleLimit(RoleLimit {
            roles: vec!["editor".to_owned()],
        })
    }

    fn draft_limit() -> Violation {
        Violation::FieldLimit(FieldLimit {
            field: "status".to_owned(),
            value: json!("draft"),
        })
    }

    fn editor_context() -> EvaluationContext {
        EvaluationContext::new("node")
            .bundle("article")
            .actor(Actor::new(1).with_role("editor"))
    }

    fn names(group: &GoverningGroup<'_>) -> Vec<String> {
        group.rule_names().map(str::to_owned).collect()
    }

    #[test]
    fn test_no_rules() {
        let catalog = ConditionCatalog::builtin();
        let selector = RuleSelector::new(&catalog);

        let group = selector
            .select_governing_group(&[], &editor_context())
            .unwrap();

        assert!(group.is_empty());
        assert_eq!(group.key(), None);
    }

    #[test]
    fn test_first_applying_condition_wins() {
        let catalog = ConditionCatalog::builtin();
        let selector = RuleSelector::new(&catalog);
        let rules = [rule("both", &[], Cap::Limited(1), vec![draft_limit(), editor_limit()])];

        // The field condition does not apply, so the rule lands in the role group.
        let applicable = selector.applicable(&rules, &editor_context()).unwrap();
        assert_eq!(
            applicable.keys().collect::<Vec<_>>(),
            [GroupKey::Condition(ConditionId::RoleLimit)]
        );
        assert_eq!(applicable.len(), 1);

        // Once both apply, the first attached condition decides the group, regardless of priority.
        let context = editor_context().field("status", "draft");
        let rules = [rule("both", &[], Cap::Limited(1), vec![editor_limit(), draft_limit()])];
        let applicable = selector.applicable(&rules, &context).unwrap();
        let limits = applicable
            .group(GroupKey::Condition(ConditionId::RoleLimit))
            .unwrap();

        assert_eq!(limits.len(), 1);
        assert_eq!(limits["both"].condition, Some(&editor_limit()));
        assert!(applicable.group(GroupKey::Condition(ConditionId::FieldLimit)).is_none());
    }

    #[test]
    fn test_priority_precedence() {
        let catalog = ConditionCatalog::builtin();
        let selector = RuleSelector::new(&catalog);
        let rules = [
            rule("per_role", &[], Cap::Limited(1), vec![editor_limit()]),
            rule("per_user", &[], Cap::Limited(1), vec![user_limit()]),
            rule("per_user_articles", &["article"], Cap::Limited(1), vec![user_limit()]),
            rule("global", &[], Cap::Limited(1), vec![]),
        ];

        let group = selector
            .select_governing_group(&rules, &editor_context())
            .unwrap();

        assert_eq!(group.key(), Some(GroupKey::Condition(ConditionId::UserLimit)));
        assert_eq!(names(&group), ["per_user", "per_user_articles"]);
    }

    #[test]
    fn test_priority_reconfigured() {
        let catalog = ConditionCatalog::builtin().register(ConditionId::RoleLimit, -5);
        let selector = RuleSelector::new(&catalog);
        let rules = [
            rule("per_user", &[], Cap::Limited(1), vec![user_limit()]),
            rule("per_role", &[], Cap::Limited(1), vec![editor_limit()]),
        ];

        let group = selector
            .select_governing_group(&rules, &editor_context())
            .unwrap();

        assert_eq!(names(&group), ["per_role"]);
    }

    #[test]
    fn test_unconditioned_fallback() {
        let catalog = ConditionCatalog::builtin();
        let selector = RuleSelector::new(&catalog);
        let rules = [
            rule("drafts", &[], Cap::Limited(1), vec![draft_limit()]),
            rule("global", &[], Cap::Limited(1), vec![]),
        ];

        let context = EvaluationContext::new("node").bundle("article");
        let group = selector.select_governing_group(&rules, &context).unwrap();

        assert_eq!(group.key(), Some(GroupKey::Unconditioned));
        assert_eq!(names(&group), ["drafts", "global"]);
        assert_eq!(group.get("drafts").unwrap().condition, None);
    }

    #[test]
    fn test_unconditioned_ignored_when_condition_applies() {
        let catalog = ConditionCatalog::builtin();
        let selector = RuleSelector::new(&catalog);
        let rules = [
            rule("global", &[], Cap::Limited(1), vec![]),
            rule("per_user", &[], Cap::Limited(1), vec![user_limit()]),
        ];

        let group = selector
            .select_governing_group(&rules, &editor_context())
            .unwrap();

        assert_eq!(names(&group), ["per_user"]);
    }

    #[test]
    fn test_unregistered_kind_never_governs() {
        let catalog = ConditionCatalog::new().register(ConditionId::RoleLimit, 0);
        let selector = RuleSelector::new(&catalog);

        let rules = [rule("per_user", &[], Cap::Limited(1), vec![user_limit()])];
        let group = selector
            .select_governing_group(&rules, &editor_context())
            .unwrap();
        assert!(group.is_empty());

        let rules = [
            rule("per_user", &[], Cap::Limited(1), vec![user_limit()]),
            rule("global", &[], Cap::Limited(1), vec![]),
        ];
        let group = selector
            .select_governing_group(&rules, &editor_context())
            .unwrap();
        assert_eq!(names(&group), ["global"]);
    }

    #[test]
    fn test_bundle_and_type_scoping() {
        let catalog = ConditionCatalog::builtin();
        let selector = RuleSelector::new(&catalog);
        let rules = [
            rule("articles", &["article"], Cap::Limited(1), vec![]),
            rule("any_node", &[], Cap::Limited(1), vec![]),
        ];

        let page = EvaluationContext::new("node").bundle("page");
        let group = selector.select_governing_group(&rules, &page).unwrap();
        assert_eq!(names(&group), ["any_node"]);

        let article = EvaluationContext::new("node").bundle("article");
        let group = selector.select_governing_group(&rules, &article).unwrap();
        assert_eq!(names(&group), ["articles", "any_node"]);

        let comment = EvaluationContext::new("comment").bundle("article");
        let group = selector.select_governing_group(&rules, &comment).unwrap();
        assert!(group.is_empty());
    }

    #[test]
    fn test_unsupported_condition_fails() {
        let catalog = ConditionCatalog::builtin();
        let selector = RuleSelector::new(&catalog);
        let rules = [rule("broken", &[], Cap::Limited(1), vec![Violation::Unsupported])];

        let error = selector
            .select_governing_group(&rules, &editor_context())
            .unwrap_err();

        assert!(matches!(
            error,
            EvaluationError::Condition {
                ref rule,
                source: ConditionError::Unsupported,
            } if rule == "broken"
        ));
    }
}
