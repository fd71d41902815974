use entity_limit_log::LogError;

use crate::catalog::RuleCatalog;
use crate::condition::ConditionCatalog;
use crate::context::EvaluationContext;
use crate::evaluator::{Decision, EvaluationError, LimitEvaluator};
use crate::query::EntityStore;
use crate::selector::RuleSelector;

/// Decides whether entities may be created under the configured limits.
///
/// This is the entry point for the entity creation path. Every call loads the enabled rules,
/// selects the governing group and evaluates it. No state is kept between calls.
///
/// Concurrent creations are not serialized. Two requests checked at the same time may both be
/// admitted and overshoot a cap by one each.
#[derive(Debug)]
pub struct EntityLimitUsage<R, S> {
    rules: R,
    conditions: ConditionCatalog,
    store: S,
}

impl<R, S> EntityLimitUsage<R, S>
where
    R: RuleCatalog,
    S: EntityStore,
{
    /// Creates a new instance from its collaborators.
    pub fn new(rules: R, conditions: ConditionCatalog, store: S) -> Self {
        Self {
            rules,
            conditions,
            store,
        }
    }

    /// Returns the registry of condition kinds.
    pub fn conditions(&self) -> &ConditionCatalog {
        &self.conditions
    }

    /// Returns the entity store used for counting.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Computes the admission decision for the entity described by `context`.
    ///
    /// Every failure is logged before it is returned.
    pub fn check(&self, context: &EvaluationContext) -> Result<Decision, EvaluationError> {
        self.decide(context).inspect_err(|error| {
            entity_limit_log::error!(
                entity_type = context.entity_type.as_str(),
                bundle = context.bundle_name(),
                "entity limit check failed: {}",
                LogError(error)
            );
        })
    }

    fn decide(&self, context: &EvaluationContext) -> Result<Decision, EvaluationError> {
        let rules = self.rules.load_enabled()?;

        let group = RuleSelector::new(&self.conditions).select_governing_group(&rules, context)?;
        if group.is_empty() {
            entity_limit_log::debug!(
                entity_type = context.entity_type.as_str(),
                bundle = context.bundle_name(),
                "no limit rule governs entity"
            );
            return Ok(Decision::Admit);
        }

        let decision = LimitEvaluator::new(&self.store).evaluate(context, &group)?;

        if let Some(violation) = decision.violation() {
            entity_limit_log::debug!(
                entity_type = context.entity_type.as_str(),
                bundle = context.bundle_name(),
                rule = violation.rule.as_str(),
                count = violation.count,
                limit = violation.limit,
                "entity limit reached"
            );
        }

        Ok(decision)
    }

    /// Returns `true` if creating the entity described by `context` violates a limit.
    pub fn violation_check(&self, context: &EvaluationContext) -> Result<bool, EvaluationError> {
        Ok(self.check(context)?.is_violated())
    }
}
