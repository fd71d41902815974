//! Creation limits for entities.
//!
//! A [`LimitRule`] caps the number of entities of an entity type and optionally a set of its
//! bundles. Attached [violation conditions](Violation) narrow the count to a sub-population, for
//! example the entities of the acting user. When several rules govern the same entity, a single
//! group is selected by the priority of the condition kinds registered in a
//! [`ConditionCatalog`], and every rule of that group is compared against its cap.
//!
//! # Usage
//!
//! ```
//! use entity_limit::{
//!     Actor, Cap, ConditionCatalog, EntityLimitUsage, EvaluationContext, LimitRule, MemoryStore,
//!     RuleStatus, StaticRuleCatalog, StoredEntity, UserLimit, Violation,
//! };
//!
//! let rule = LimitRule {
//!     name: "articles_per_user".to_owned(),
//!     label: None,
//!     status: RuleStatus::Enabled,
//!     entity_type: "node".to_owned(),
//!     bundles: vec!["article".to_owned()],
//!     limit: Cap::Limited(1),
//!     conditions: vec![Violation::UserLimit(UserLimit::default())],
//! };
//!
//! let store = MemoryStore::new();
//! store.insert(StoredEntity::new("node").bundle("article").owner(1));
//!
//! let usage = EntityLimitUsage::new(
//!     StaticRuleCatalog::new(vec![rule]),
//!     ConditionCatalog::builtin(),
//!     store,
//! );
//!
//! let context = EvaluationContext::new("node")
//!     .bundle("article")
//!     .actor(Actor::new(1));
//!
//! assert!(usage.violation_check(&context).unwrap());
//! ```

#![warn(missing_docs)]

mod catalog;
mod condition;
mod context;
mod evaluator;
mod memory;
mod query;
mod rule;
mod selector;
mod usage;

#[cfg(test)]
mod testutils;

pub use self::catalog::*;
pub use self::condition::*;
pub use self::context::*;
pub use self::evaluator::*;
pub use self::memory::*;
pub use self::query::*;
pub use self::rule::*;
pub use self::selector::*;
pub use self::usage::*;
