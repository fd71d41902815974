//! An in-process [`EntityStore`] holding entities in memory.
//!
//! Besides embedding the engine without a database, a [recording](MemoryStore::recording) store
//! keeps every executed query, which allows to observe which rules were counted during an
//! evaluation.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ActorId;
use crate::query::{BUNDLE_FIELD, CountError, CountingQuery, EntityStore, OWNER_FIELD, Operator};

/// An existing entity known to the [`MemoryStore`].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StoredEntity {
    /// The type of the entity.
    pub entity_type: String,
    /// The bundle of the entity.
    #[serde(default)]
    pub bundle: Option<String>,
    /// The user owning the entity.
    #[serde(default)]
    pub owner: Option<ActorId>,
    /// Additional field values.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl StoredEntity {
    /// Creates an entity without bundle, owner or fields.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            bundle: None,
            owner: None,
            fields: BTreeMap::new(),
        }
    }

    /// Sets the bundle.
    pub fn bundle(mut self, bundle: impl Into<String>) -> Self {
        self.bundle = Some(bundle.into());
        self
    }

    /// Sets the owner.
    pub fn owner(mut self, owner: u64) -> Self {
        self.owner = Some(ActorId::new(owner));
        self
    }

    /// Sets a field value.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Resolves the value of a field, including the reserved bundle and owner fields.
    fn value(&self, field: &str) -> Option<Value> {
        match field {
            BUNDLE_FIELD => self.bundle.clone().map(Value::String),
            OWNER_FIELD => self.owner.map(|owner| Value::from(owner.value())),
            _ => self.fields.get(field).cloned(),
        }
    }
}

/// A filter added to a [`MemoryQuery`].
#[derive(Clone, Debug, PartialEq)]
pub struct Filter {
    /// The filtered field.
    pub field: String,
    /// The value to compare against.
    pub value: Value,
    /// The comparison.
    pub operator: Operator,
}

impl Filter {
    fn matches(&self, entity: &StoredEntity) -> bool {
        self.operator
            .matches(entity.value(&self.field).as_ref(), &self.value)
    }
}

/// A record of a query executed against a [`MemoryStore`].
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutedQuery {
    /// The counted entity type.
    pub entity_type: String,
    /// Filters in the order they were added.
    pub filters: Vec<Filter>,
    /// The resulting count.
    pub count: u64,
}

impl ExecutedQuery {
    /// Returns the value of the first filter on `field`.
    pub fn filter_value(&self, field: &str) -> Option<&Value> {
        self.filters
            .iter()
            .find(|filter| filter.field == field)
            .map(|filter| &filter.value)
    }
}

#[derive(Debug, Default)]
struct Inner {
    entities: Vec<StoredEntity>,
    executed: Vec<ExecutedQuery>,
    recording: bool,
    unavailable: bool,
}

/// A thread-safe entity store backed by memory.
///
/// Clones share the same entities. Executed queries are only kept by stores created with
/// [`MemoryStore::recording`].
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that records every executed query.
    ///
    /// The record grows with every count. Use [`clear_executed`](Self::clear_executed) to reset it.
    pub fn recording() -> Self {
        let store = Self::new();
        store.inner.lock().recording = true;
        store
    }

    /// Adds an entity.
    pub fn insert(&self, entity: StoredEntity) {
        self.inner.lock().entities.push(entity);
    }

    /// Returns the number of stored entities.
    pub fn len(&self) -> usize {
        self.inner.lock().entities.len()
    }

    /// Returns `true` if no entities are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Makes all subsequent count queries fail, simulating an unreachable backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Returns all successfully executed queries in execution order.
    ///
    /// Always empty unless the store is [recording](Self::recording).
    pub fn executed(&self) -> Vec<ExecutedQuery> {
        self.inner.lock().executed.clone()
    }

    /// Forgets all recorded queries.
    pub fn clear_executed(&self) {
        self.inner.lock().executed.clear();
    }
}

impl Extend<StoredEntity> for MemoryStore {
    fn extend<T: IntoIterator<Item = StoredEntity>>(&mut self, iter: T) {
        self.inner.lock().entities.extend(iter);
    }
}

impl EntityStore for MemoryStore {
    type Query = MemoryQuery;

    fn count_query(&self, entity_type: &str) -> Self::Query {
        MemoryQuery {
            store: self.clone(),
            entity_type: entity_type.to_owned(),
            filters: Vec::new(),
        }
    }
}

/// A count query against a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryQuery {
    store: MemoryStore,
    entity_type: String,
    filters: Vec<Filter>,
}

impl CountingQuery for MemoryQuery {
    fn add_condition(&mut self, field: &str, value: Value, operator: Operator) {
        self.filters.push(Filter {
            field: field.to_owned(),
            value,
            operator,
        });
    }

    fn execute_count(&self) -> Result<u64, CountError> {
        let mut inner = self.store.inner.lock();

        if inner.unavailable {
            return Err(CountError::new("memory store is unavailable"));
        }

        let count = inner
            .entities
            .iter()
            .filter(|entity| entity.entity_type == self.entity_type)
            .filter(|entity| self.filters.iter().all(|filter| filter.matches(entity)))
            .count() as u64;

        if inner.recording {
            inner.executed.push(ExecutedQuery {
                entity_type: self.entity_type.clone(),
                filters: self.filters.clone(),
                count,
            });
        }

        Ok(count)
    }
}
