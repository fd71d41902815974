//! Contract of the counting backend.
//!
//! The engine never reads entities itself. It builds a [`CountingQuery`] per rule through an
//! [`EntityStore`], lets conditions add filters and executes a single count.

use std::error::Error;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Field holding the bundle of an entity.
pub const BUNDLE_FIELD: &str = "bundle";

/// Field holding the id of the user owning an entity.
pub const OWNER_FIELD: &str = "owner";

/// Comparison applied by a query filter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// The field equals the value.
    Equal,
    /// The field is missing or differs from the value.
    NotEqual,
    /// The field equals one of the values in an array.
    ///
    /// A non-array value behaves like [`Operator::Equal`].
    In,
    /// Negation of [`Operator::In`].
    NotIn,
}

impl Operator {
    /// Returns the canonical name of this operator.
    pub fn name(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "<>",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
        }
    }

    /// Checks whether the `actual` value of a field satisfies this operator against `expected`.
    pub fn matches(self, actual: Option<&Value>, expected: &Value) -> bool {
        match self {
            Self::Equal => actual == Some(expected),
            Self::NotEqual => actual != Some(expected),
            Self::In => match expected {
                Value::Array(values) => actual.is_some_and(|value| values.contains(value)),
                other => actual == Some(other),
            },
            Self::NotIn => !Self::In.matches(actual, expected),
        }
    }
}

/// An error returned by the counting backend.
#[derive(Debug, Error)]
#[error("failed to execute count query")]
pub struct CountError {
    #[source]
    source: Box<dyn Error + Send + Sync>,
}

impl CountError {
    /// Wraps a backend error.
    pub fn new<E>(source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            source: source.into(),
        }
    }
}

/// A count query over the entities of one entity type.
pub trait CountingQuery {
    /// Restricts the query to entities whose `field` satisfies `operator` against `value`.
    fn add_condition(&mut self, field: &str, value: Value, operator: Operator);

    /// Executes the query and returns the number of matching entities.
    fn execute_count(&self) -> Result<u64, CountError>;
}

/// Storage backend creating count queries.
pub trait EntityStore {
    /// The query type created by this store.
    type Query: CountingQuery;

    /// Creates an unfiltered count query over all entities of `entity_type`.
    fn count_query(&self, entity_type: &str) -> Self::Query;
}

impl<S: EntityStore + ?Sized> EntityStore for &S {
    type Query = S::Query;

    fn count_query(&self, entity_type: &str) -> Self::Query {
        (**self).count_query(entity_type)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_operator_equal() {
        assert!(Operator::Equal.matches(Some(&json!("article")), &json!("article")));
        assert!(!Operator::Equal.matches(Some(&json!("page")), &json!("article")));
        assert!(!Operator::Equal.matches(None, &json!("article")));
    }

    #[test]
    fn test_operator_not_equal_missing() {
        assert!(Operator::NotEqual.matches(None, &json!(1)));
        assert!(!Operator::NotEqual.matches(Some(&json!(1)), &json!(1)));
    }

    #[test]
    fn test_operator_in() {
        let bundles = json!(["article", "page"]);

        assert!(Operator::In.matches(Some(&json!("page")), &bundles));
        assert!(!Operator::In.matches(Some(&json!("blog")), &bundles));
        assert!(!Operator::In.matches(None, &bundles));
        assert!(Operator::In.matches(Some(&json!(4)), &json!(4)));
    }

    #[test]
    fn test_operator_not_in() {
        let bundles = json!(["article"]);

        assert!(Operator::NotIn.matches(Some(&json!("page")), &bundles));
        assert!(Operator::NotIn.matches(None, &bundles));
        assert!(!Operator::NotIn.matches(Some(&json!("article")), &bundles));
    }

    #[test]
    fn test_count_error_source() {
        let error = CountError::new("connection refused");

        assert_eq!(error.to_string(), "failed to execute count query");
        assert_eq!(
            error.source().map(ToString::to_string).as_deref(),
            Some("connection refused")
        );
    }
}
