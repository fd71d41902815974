use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The numeric identifier of a user acting on entities.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ActorId(u64);

impl ActorId {
    /// Creates a new actor id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric value of this id.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for ActorId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The user performing the entity creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Actor {
    /// Identifier of the user.
    pub id: ActorId,
    /// Names of the roles held by the user.
    pub roles: BTreeSet<String>,
}

impl Actor {
    /// Creates an actor without any roles.
    pub fn new(id: u64) -> Self {
        Self {
            id: ActorId(id),
            roles: BTreeSet::new(),
        }
    }

    /// Adds a role to this actor.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Returns `true` if the actor holds at least one of the given roles.
    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|role| self.roles.contains(role.as_ref()))
    }
}

/// Everything known about a pending entity creation.
///
/// The selector and evaluator only read the entity type and bundle. The remaining data is passed
/// through to violation conditions, which decide whether they apply and how to scope counts.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationContext {
    /// The type of the entity being created, for example `node`.
    pub entity_type: String,
    /// The bundle of the entity being created, if the entity type has bundles.
    pub bundle: Option<String>,
    /// The user creating the entity.
    pub actor: Option<Actor>,
    /// Field values of the pending entity.
    pub fields: BTreeMap<String, Value>,
}

impl EvaluationContext {
    /// Creates a context for an entity type without bundle, actor or fields.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            bundle: None,
            actor: None,
            fields: BTreeMap::new(),
        }
    }

    /// Sets the bundle of the pending entity.
    pub fn bundle(mut self, bundle: impl Into<String>) -> Self {
        self.bundle = Some(bundle.into());
        self
    }

    /// Sets the acting user.
    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    /// Sets a field value of the pending entity.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns the bundle as string slice.
    pub fn bundle_name(&self) -> Option<&str> {
        self.bundle.as_deref()
    }
}
