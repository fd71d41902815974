//! Violation conditions that scope a limit rule to a sub-population.
//!
//! The root type is [`Violation`], a closed set of condition kinds attached to a
//! [`LimitRule`]. Each kind is identified by a [`ConditionId`]. The precedence between kinds is
//! configured separately in a [`ConditionCatalog`].

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::{ActorId, EvaluationContext};
use crate::query::{CountError, CountingQuery, EntityStore, OWNER_FIELD, Operator};
use crate::rule::{Cap, LimitRule};

/// Identifies a kind of violation condition.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionId {
    /// Counts the entities of the acting user, see [`UserLimit`].
    UserLimit,
    /// Counts the entities of users holding a role, see [`RoleLimit`].
    RoleLimit,
    /// Counts the entities sharing a field value, see [`FieldLimit`].
    FieldLimit,
}

impl ConditionId {
    /// Returns the canonical name of this condition kind.
    pub fn name(self) -> &'static str {
        match self {
            Self::UserLimit => "user_limit",
            Self::RoleLimit => "role_limit",
            Self::FieldLimit => "field_limit",
        }
    }
}

impl fmt::Display for ConditionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A registered condition kind and its priority.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
pub struct ConditionKind {
    /// The condition kind.
    pub id: ConditionId,
    /// Precedence of the kind. Lower values win.
    pub priority: i32,
}

/// Registry of known condition kinds and their priorities.
///
/// Only kinds registered here can govern an evaluation. Rules whose matching condition is of an
/// unregistered kind are never selected.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConditionCatalog {
    kinds: BTreeMap<ConditionId, i32>,
}

impl ConditionCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a catalog with all built-in kinds at their default priorities.
    ///
    /// Per-user limits take precedence over field limits, which in turn take precedence over
    /// role limits.
    pub fn builtin() -> Self {
        Self::new()
            .register(ConditionId::UserLimit, 0)
            .register(ConditionId::FieldLimit, 10)
            .register(ConditionId::RoleLimit, 20)
    }

    /// Registers a kind, replacing its priority if it was registered before.
    pub fn register(mut self, id: ConditionId, priority: i32) -> Self {
        self.insert(id, priority);
        self
    }

    /// Inserts a kind and returns its previous priority.
    pub fn insert(&mut self, id: ConditionId, priority: i32) -> Option<i32> {
        self.kinds.insert(id, priority)
    }

    /// Returns the priority of a kind, if registered.
    pub fn priority(&self, id: ConditionId) -> Option<i32> {
        self.kinds.get(&id).copied()
    }

    /// Returns `true` if the kind is registered.
    pub fn contains(&self, id: ConditionId) -> bool {
        self.kinds.contains_key(&id)
    }

    /// Returns `true` if no kinds are registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    /// Iterates all registered kinds.
    pub fn all_kinds(&self) -> impl Iterator<Item = ConditionKind> + '_ {
        self.kinds
            .iter()
            .map(|(&id, &priority)| ConditionKind { id, priority })
    }

    /// Returns the registered kinds in order of precedence.
    ///
    /// Kinds are sorted by ascending priority. Kinds with equal priority are ordered by their
    /// [name](ConditionId::name).
    pub fn priority_order(&self) -> Vec<ConditionId> {
        self.kinds
            .iter()
            .sorted_by_key(|(id, priority)| (**priority, id.name()))
            .map(|(id, _)| *id)
            .collect()
    }
}

impl FromIterator<ConditionKind> for ConditionCatalog {
    fn from_iter<T: IntoIterator<Item = ConditionKind>>(iter: T) -> Self {
        let kinds = iter
            .into_iter()
            .map(|kind| (kind.id, kind.priority))
            .collect();

        Self { kinds }
    }
}

/// An error raised while deciding or applying a condition.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum ConditionError {
    /// The condition was configured with a plugin this engine does not know.
    #[error("unsupported condition plugin")]
    Unsupported,

    /// The condition scopes by user, but the context has no acting user.
    #[error("condition {0} requires an acting user")]
    MissingActor(ConditionId),
}

/// Common interface of all condition kinds.
pub trait ViolationCondition {
    /// The kind of this condition.
    fn id(&self) -> ConditionId;

    /// Returns `true` if the condition applies to the pending entity creation.
    fn applies(&self, context: &EvaluationContext) -> bool;

    /// Restricts a count query to the scope of this condition.
    fn narrow<Q>(&self, query: &mut Q, context: &EvaluationContext) -> Result<(), ConditionError>
    where
        Q: CountingQuery + ?Sized;
}

/// Restricts `query` to the entities owned by the acting user.
fn narrow_to_actor<Q>(
    id: ConditionId,
    query: &mut Q,
    context: &EvaluationContext,
) -> Result<(), ConditionError>
where
    Q: CountingQuery + ?Sized,
{
    let actor = context
        .actor
        .as_ref()
        .ok_or(ConditionError::MissingActor(id))?;

    query.add_condition(OWNER_FIELD, Value::from(actor.id.value()), Operator::Equal);
    Ok(())
}

/// A per-user limit entry.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct ActorLimit {
    /// The user this entry applies to.
    pub id: ActorId,
    /// The cap configured for this user.
    pub limit: Cap,
}

/// Limits the number of entities per user.
///
/// The condition applies to the acting user if the table of per-user entries is empty or lists
/// the user. It scopes counts to the entities owned by that user.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct UserLimit {
    /// Per-user caps.
    #[serde(default)]
    pub limits: Vec<ActorLimit>,
}

impl UserLimit {
    /// Returns the cap configured for `actor`.
    ///
    /// If the user is listed more than once, the last entry wins. A user without an entry gets a
    /// limit of `0`, which denies any creation through [`check_access`](Self::check_access).
    pub fn limit_for(&self, actor: ActorId) -> Cap {
        self.limits
            .iter()
            .rev()
            .find(|entry| entry.id == actor)
            .map_or(Cap::Limited(0), |entry| entry.limit)
    }

    /// Checks whether `actor` may create another entity governed by `rule` under `limit`.
    ///
    /// This runs its own count over the entity type and bundles of the rule, filtered to the
    /// entities owned by `actor`. It does not consult any other rule. Returns `false` if the count
    /// reached the limit.
    pub fn check_access<S>(
        &self,
        limit: Cap,
        rule: &LimitRule,
        actor: ActorId,
        store: &S,
    ) -> Result<bool, CountError>
    where
        S: EntityStore + ?Sized,
    {
        if limit == Cap::Unlimited {
            return Ok(true);
        }

        let mut query = rule.base_count_query(store, &rule.entity_type);
        query.add_condition(OWNER_FIELD, Value::from(actor.value()), Operator::Equal);
        let count = query.execute_count()?;

        entity_limit_log::trace!(
            rule = rule.name.as_str(),
            actor = actor.value(),
            count,
            %limit,
            "checked per-user access"
        );

        Ok(!limit.is_exceeded_by(count))
    }
}

impl ViolationCondition for UserLimit {
    fn id(&self) -> ConditionId {
        ConditionId::UserLimit
    }

    fn applies(&self, context: &EvaluationContext) -> bool {
        let Some(actor) = context.actor.as_ref() else {
            return false;
        };

        self.limits.is_empty() || self.limits.iter().any(|entry| entry.id == actor.id)
    }

    fn narrow<Q>(&self, query: &mut Q, context: &EvaluationContext) -> Result<(), ConditionError>
    where
        Q: CountingQuery + ?Sized,
    {
        narrow_to_actor(self.id(), query, context)
    }
}

/// Limits the number of entities per user for users holding one of the configured roles.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct RoleLimit {
    /// Names of the roles this condition applies to.
    pub roles: Vec<String>,
}

impl ViolationCondition for RoleLimit {
    fn id(&self) -> ConditionId {
        ConditionId::RoleLimit
    }

    fn applies(&self, context: &EvaluationContext) -> bool {
        context
            .actor
            .as_ref()
            .is_some_and(|actor| actor.has_any_role(&self.roles))
    }

    fn narrow<Q>(&self, query: &mut Q, context: &EvaluationContext) -> Result<(), ConditionError>
    where
        Q: CountingQuery + ?Sized,
    {
        narrow_to_actor(self.id(), query, context)
    }
}

/// Limits the number of entities sharing a field value.
///
/// Applies when the pending entity carries `value` in `field`, and counts the existing entities
/// with the same value.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FieldLimit {
    /// Name of the field.
    pub field: String,
    /// The value the field must hold.
    pub value: Value,
}

impl ViolationCondition for FieldLimit {
    fn id(&self) -> ConditionId {
        ConditionId::FieldLimit
    }

    fn applies(&self, context: &EvaluationContext) -> bool {
        Operator::Equal.matches(context.fields.get(&self.field), &self.value)
    }

    fn narrow<Q>(&self, query: &mut Q, _context: &EvaluationContext) -> Result<(), ConditionError>
    where
        Q: CountingQuery + ?Sized,
    {
        query.add_condition(&self.field, self.value.clone(), Operator::Equal);
        Ok(())
    }
}

/// A violation condition attached to a limit rule.
///
/// Conditions are configured as objects tagged with their `plugin` name:
///
/// ```json
/// {"plugin": "user_limit", "limits": [{"id": 1, "limit": 10}]}
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "plugin", rename_all = "snake_case")]
pub enum Violation {
    /// See [`UserLimit`].
    UserLimit(UserLimit),
    /// See [`RoleLimit`].
    RoleLimit(RoleLimit),
    /// See [`FieldLimit`].
    FieldLimit(FieldLimit),
    /// A plugin unknown to this engine.
    #[serde(other)]
    Unsupported,
}

impl Violation {
    /// Returns `false` if the condition was configured with an unknown plugin.
    pub fn supported(&self) -> bool {
        !matches!(self, Self::Unsupported)
    }

    /// Returns the kind of this condition.
    pub fn id(&self) -> Result<ConditionId, ConditionError> {
        match self {
            Self::UserLimit(condition) => Ok(condition.id()),
            Self::RoleLimit(condition) => Ok(condition.id()),
            Self::FieldLimit(condition) => Ok(condition.id()),
            Self::Unsupported => Err(ConditionError::Unsupported),
        }
    }

    /// Returns `true` if the condition applies to the pending entity creation.
    ///
    /// Fails for unsupported plugins, since their intent cannot be decided.
    pub fn applies(&self, context: &EvaluationContext) -> Result<bool, ConditionError> {
        match self {
            Self::UserLimit(condition) => Ok(condition.applies(context)),
            Self::RoleLimit(condition) => Ok(condition.applies(context)),
            Self::FieldLimit(condition) => Ok(condition.applies(context)),
            Self::Unsupported => Err(ConditionError::Unsupported),
        }
    }

    /// Restricts a count query to the scope of this condition.
    pub fn narrow<Q>(&self, query: &mut Q, context: &EvaluationContext) -> Result<(), ConditionError>
    where
        Q: CountingQuery + ?Sized,
    {
        match self {
            Self::UserLimit(condition) => condition.narrow(query, context),
            Self::RoleLimit(condition) => condition.narrow(query, context),
            Self::FieldLimit(condition) => condition.narrow(query, context),
            Self::Unsupported => Err(ConditionError::Unsupported),
        }
    }
}
