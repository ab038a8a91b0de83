//! Collations
//!
//! A collation normalizes key components before they are compared. The index
//! stores normalized keys and normalizes every lookup key the same way, so two
//! values that collate equal are the same key.
//!
//! Collations are looked up by name in a [`CollationRegistry`] when an index
//! definition is built. Unknown names are a validation error.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::key::KeyComponent;

/// Name of the identity collation
pub const DEFAULT_COLLATION: &str = "default";

/// Name of the case-insensitive collation
pub const CASE_INSENSITIVE_COLLATION: &str = "ci";

/// Value normalization applied before key comparison
pub trait Collation: Send + Sync + fmt::Debug {
    /// Registry name
    fn name(&self) -> &str;

    /// Normalize one component
    fn transform(&self, component: KeyComponent) -> KeyComponent;
}

/// Identity collation
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCollation;

impl Collation for DefaultCollation {
    fn name(&self) -> &str {
        DEFAULT_COLLATION
    }

    fn transform(&self, component: KeyComponent) -> KeyComponent {
        component
    }
}

/// Case-folding collation for string components
#[derive(Debug, Default, Clone, Copy)]
pub struct CaseInsensitiveCollation;

impl Collation for CaseInsensitiveCollation {
    fn name(&self) -> &str {
        CASE_INSENSITIVE_COLLATION
    }

    fn transform(&self, component: KeyComponent) -> KeyComponent {
        match component {
            KeyComponent::String(s) => KeyComponent::String(s.to_lowercase()),
            other => other,
        }
    }
}

/// Name-keyed collation lookup
#[derive(Debug, Clone)]
pub struct CollationRegistry {
    collations: BTreeMap<String, Arc<dyn Collation>>,
}

impl CollationRegistry {
    /// Empty registry
    pub fn empty() -> Self {
        CollationRegistry {
            collations: BTreeMap::new(),
        }
    }

    /// Registry with `default` and `ci` (alias `case-insensitive`)
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(DefaultCollation));
        let ci: Arc<dyn Collation> = Arc::new(CaseInsensitiveCollation);
        registry.register(Arc::clone(&ci));
        registry.register_alias("case-insensitive", ci);
        registry
    }

    /// Register a collation under its own name
    pub fn register(&mut self, collation: Arc<dyn Collation>) {
        self.collations
            .insert(collation.name().to_ascii_lowercase(), collation);
    }

    /// Register a collation under an additional name
    pub fn register_alias(&mut self, alias: &str, collation: Arc<dyn Collation>) {
        self.collations.insert(alias.to_ascii_lowercase(), collation);
    }

    /// Resolve a collation by name (case-insensitive lookup)
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Collation>> {
        self.collations
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::validation(format!("unknown collation '{}'", name)))
    }

    /// Whether a name resolves
    pub fn contains(&self, name: &str) -> bool {
        self.collations.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.collations.keys().cloned().collect()
    }
}

impl Default for CollationRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
