use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

use crate::rule::LimitRule;

/// An error returned when limit rules cannot be loaded.
#[derive(Debug, Error)]
#[error("failed to load limit rules")]
pub struct CatalogError {
    #[source]
    source: Box<dyn Error + Send + Sync>,
}

impl CatalogError {
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

/// Source of the currently enabled limit rules.
pub trait RuleCatalog {
    /// Returns all enabled rules.
    ///
    /// Disabled rules must not be returned. The order of rules determines the order in which they
    /// are evaluated.
    fn load_enabled(&self) -> Result<Vec<LimitRule>, CatalogError>;
}

impl<C: RuleCatalog + ?Sized> RuleCatalog for &C {
    fn load_enabled(&self) -> Result<Vec<LimitRule>, CatalogError> {
        (**self).load_enabled()
    }
}

impl<C: RuleCatalog + ?Sized> RuleCatalog for Arc<C> {
    fn load_enabled(&self) -> Result<Vec<LimitRule>, CatalogError> {
        (**self).load_enabled()
    }
}

/// A rule catalog over a fixed list of rules.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StaticRuleCatalog {
    rules: Vec<LimitRule>,
}

impl StaticRuleCatalog {
    /// Creates a catalog from enabled and disabled rules.
    pub fn new(rules: Vec<LimitRule>) -> Self {
        Self { rules }
    }

    /// Returns all rules including disabled ones.
    pub fn rules(&self) -> &[LimitRule] {
        &self.rules
    }
}

impl FromIterator<LimitRule> for StaticRuleCatalog {
    fn from_iter<T: IntoIterator<Item = LimitRule>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl RuleCatalog for StaticRuleCatalog {
    fn load_enabled(&self) -> Result<Vec<LimitRule>, CatalogError> {
        Ok(self
            .rules
            .iter()
            .filter(|rule| rule.is_enabled())
            .cloned()
            .collect())
    }
}
