//! Index keys
//!
//! An [`IndexKey`] is an ordered tuple of [`KeyComponent`]s, one per indexed
//! field. Components of different kinds order by kind first:
//!
//! ```text
//! Null < Bool < Int < Float < String < Bytes < Link < (upper sentinel)
//! ```
//!
//! `Null` sorts first and is a regular component: with nulls indexed, an
//! `IS NULL` lookup is an ordinary point or prefix lookup, wherever in the
//! tuple the null occurs.
//!
//! # Partial keys
//!
//! A key shorter than the index's field list is a prefix. Because a prefix
//! orders before every key it starts, prefix range bounds are expressed with
//! an upper sentinel component that orders after every real component:
//!
//! | bound             | encoded as            |
//! |-------------------|-----------------------|
//! | `>= prefix`       | `prefix`              |
//! | `>  prefix`       | `prefix + sentinel`   |
//! | `<= prefix`       | `prefix + sentinel`   |
//! | `<  prefix`       | `prefix`              |
//!
//! See [`IndexKey::lower_bound`] and [`IndexKey::upper_bound`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Bound;

use crate::record_id::RecordId;

/// One component of an index key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyComponent {
    /// Null marker (sorts before everything)
    Null,
    /// Boolean value (false < true)
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Float value stored as order-preserving bits
    Float(u64),
    /// String value
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Link to another record
    Link(RecordId),
    /// Upper sentinel for partial-key bounds; never stored in an index
    #[doc(hidden)]
    Max,
}

impl KeyComponent {
    /// Create a float component with total ordering
    pub fn from_float(v: f64) -> Self {
        // -0.0 and 0.0 index as the same key
        let v = if v == 0.0 { 0.0 } else { v };
        let bits = v.to_bits();
        let ordered = if (bits >> 63) == 1 {
            !bits
        } else {
            bits ^ (1 << 63)
        };
        KeyComponent::Float(ordered)
    }

    /// Float value if this is a float component
    pub fn as_float(&self) -> Option<f64> {
        match self {
            KeyComponent::Float(ordered) => {
                let bits = if (ordered >> 63) == 1 {
                    ordered ^ (1 << 63)
                } else {
                    !ordered
                };
                Some(f64::from_bits(bits))
            }
            _ => None,
        }
    }

    /// Create a string component
    pub fn string(v: impl Into<String>) -> Self {
        KeyComponent::String(v.into())
    }

    /// Whether this is the null marker
    pub fn is_null(&self) -> bool {
        matches!(self, KeyComponent::Null)
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        matches!(self, KeyComponent::Max)
    }
}

impl From<i64> for KeyComponent {
    fn from(v: i64) -> Self {
        KeyComponent::Int(v)
    }
}

impl From<bool> for KeyComponent {
    fn from(v: bool) -> Self {
        KeyComponent::Bool(v)
    }
}

impl From<f64> for KeyComponent {
    fn from(v: f64) -> Self {
        KeyComponent::from_float(v)
    }
}

impl From<&str> for KeyComponent {
    fn from(v: &str) -> Self {
        KeyComponent::String(v.to_string())
    }
}

impl From<String> for KeyComponent {
    fn from(v: String) -> Self {
        KeyComponent::String(v)
    }
}

impl From<RecordId> for KeyComponent {
    fn from(v: RecordId) -> Self {
        KeyComponent::Link(v)
    }
}

impl fmt::Display for KeyComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyComponent::Null => write!(f, "null"),
            KeyComponent::Bool(b) => write!(f, "{}", b),
            KeyComponent::Int(i) => write!(f, "{}", i),
            KeyComponent::Float(_) => write!(f, "{}", self.as_float().unwrap_or(f64::NAN)),
            KeyComponent::String(s) => write!(f, "'{}'", s),
            KeyComponent::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            KeyComponent::Link(rid) => write!(f, "{}", rid),
            KeyComponent::Max => write!(f, "+inf"),
        }
    }
}

/// Ordered tuple of key components
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct IndexKey(Vec<KeyComponent>);

impl IndexKey {
    /// Create a key from components
    pub fn new(components: Vec<KeyComponent>) -> Self {
        IndexKey(components)
    }

    /// Single-component key
    pub fn single(component: impl Into<KeyComponent>) -> Self {
        IndexKey(vec![component.into()])
    }

    /// Components in field order
    pub fn components(&self) -> &[KeyComponent] {
        &self.0
    }

    /// Consume into components
    pub fn into_components(self) -> Vec<KeyComponent> {
        self.0
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no components
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any component is null
    pub fn has_null(&self) -> bool {
        self.0.iter().any(KeyComponent::is_null)
    }

    /// Whether `prefix` is a prefix of this key
    pub fn starts_with(&self, prefix: &IndexKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Append a component
    pub fn push(&mut self, component: KeyComponent) {
        self.0.push(component);
    }

    fn with_sentinel(&self) -> IndexKey {
        let mut components = self.0.clone();
        components.push(KeyComponent::Max);
        IndexKey(components)
    }

    /// Lower bound covering every key that starts with this (possibly partial) key
    pub fn lower_bound(&self, inclusive: bool) -> Bound<IndexKey> {
        if inclusive {
            Bound::Included(self.clone())
        } else {
            Bound::Excluded(self.with_sentinel())
        }
    }

    /// Upper bound covering every key that starts with this (possibly partial) key
    pub fn upper_bound(&self, inclusive: bool) -> Bound<IndexKey> {
        if inclusive {
            Bound::Included(self.with_sentinel())
        } else {
            Bound::Excluded(self.clone())
        }
    }

    /// Whether the key carries the internal upper sentinel
    pub fn is_bound_key(&self) -> bool {
        self.0.iter().any(KeyComponent::is_sentinel)
    }
}

impl From<Vec<KeyComponent>> for IndexKey {
    fn from(components: Vec<KeyComponent>) -> Self {
        IndexKey(components)
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, "]")
    }
}

/// Build an [`IndexKey`] from a list of values convertible into components
#[macro_export]
macro_rules! index_key {
    ($($c:expr),* $(,)?) => {
        $crate::key::IndexKey::new(vec![$($crate::key::KeyComponent::from($c)),*])
    };
}
