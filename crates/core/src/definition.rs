//! Index definitions
//!
//! An [`IndexDefinition`] is the immutable schema of one secondary index: the
//! ordered list of indexed fields with their types and collations, whether
//! the index is unique, and the null policy.
//!
//! Definitions are produced by [`IndexDefinitionBuilder::build`], which runs
//! every structural check before anything else sees the definition. Changing
//! a field's collation produces a new definition ([`IndexDefinition::with_collation`]);
//! the old one is never mutated.
//!
//! # Collection fields
//!
//! A field whose property holds a list, set, link bag or map is multi-valued:
//! each element contributes one key. At most one field of a definition may be
//! multi-valued, and a collection that does not imply its element type
//! (embedded lists, sets and maps) must declare one.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::collation::{Collation, CollationRegistry, DEFAULT_COLLATION};
use crate::error::{Error, Result};
use crate::key::IndexKey;

/// Declared type of a schema property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    /// true / false
    Boolean,
    /// 64-bit signed integer
    Integer,
    /// 64-bit float
    Float,
    /// UTF-8 string
    String,
    /// Raw bytes
    Binary,
    /// Single link to another record
    Link,
    /// Ordered list of embedded values
    EmbeddedList,
    /// Set of embedded values
    EmbeddedSet,
    /// Ordered list of links
    LinkList,
    /// Set of links
    LinkSet,
    /// Multiset of links with adaptive storage
    LinkBag,
    /// String-keyed map of embedded values
    EmbeddedMap,
    /// String-keyed map of links
    LinkMap,
}

impl PropertyType {
    /// Whether values of this type hold many elements
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            PropertyType::EmbeddedList
                | PropertyType::EmbeddedSet
                | PropertyType::LinkList
                | PropertyType::LinkSet
                | PropertyType::LinkBag
                | PropertyType::EmbeddedMap
                | PropertyType::LinkMap
        )
    }

    /// Whether values of this type are maps
    pub fn is_map(&self) -> bool {
        matches!(self, PropertyType::EmbeddedMap | PropertyType::LinkMap)
    }

    /// Element type implied by the collection type itself
    pub fn implied_element_type(&self) -> Option<PropertyType> {
        match self {
            PropertyType::LinkList
            | PropertyType::LinkSet
            | PropertyType::LinkBag
            | PropertyType::LinkMap => Some(PropertyType::Link),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::Boolean => "BOOLEAN",
            PropertyType::Integer => "INTEGER",
            PropertyType::Float => "FLOAT",
            PropertyType::String => "STRING",
            PropertyType::Binary => "BINARY",
            PropertyType::Link => "LINK",
            PropertyType::EmbeddedList => "EMBEDDEDLIST",
            PropertyType::EmbeddedSet => "EMBEDDEDSET",
            PropertyType::LinkList => "LINKLIST",
            PropertyType::LinkSet => "LINKSET",
            PropertyType::LinkBag => "LINKBAG",
            PropertyType::EmbeddedMap => "EMBEDDEDMAP",
            PropertyType::LinkMap => "LINKMAP",
        };
        f.write_str(name)
    }
}

/// Uniqueness of an index
///
/// Parsed from the textual kind names. Hash kinds are accepted and stored in
/// the same ordered structure as their plain counterparts, so only their
/// uniqueness carries over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexType {
    /// At most one record per key
    Unique,
    /// Any number of records per key
    NotUnique,
}

impl IndexType {
    /// Canonical kind name
    pub fn name(&self) -> &'static str {
        match self {
            IndexType::Unique => "UNIQUE",
            IndexType::NotUnique => "NOTUNIQUE",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for IndexType {
    type Err = Error;

    fn from_str(kind: &str) -> Result<Self> {
        match kind.trim().to_ascii_uppercase().as_str() {
            "UNIQUE" | "UNIQUE_HASH_INDEX" => Ok(IndexType::Unique),
            "NOTUNIQUE" | "NOTUNIQUE_HASH_INDEX" => Ok(IndexType::NotUnique),
            other => Err(Error::validation(format!("unknown index type '{}'", other))),
        }
    }
}

/// Which side of a map is indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MapIndexBy {
    /// Index map keys
    #[default]
    Key,
    /// Index map values
    Value,
}

/// One indexed field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedField {
    /// Property name
    pub name: String,
    /// Declared property type
    pub property_type: PropertyType,
    /// Element type for collection properties
    pub element_type: Option<PropertyType>,
    /// Collation name, `None` until inherited or defaulted
    pub collation: Option<String>,
    /// Map side for map properties
    pub map_by: MapIndexBy,
}

impl IndexedField {
    /// Field with no element type and no explicit collation
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        IndexedField {
            name: name.into(),
            property_type,
            element_type: property_type.implied_element_type(),
            collation: None,
            map_by: MapIndexBy::Key,
        }
    }

    /// Declare the element type of a collection field
    pub fn with_element_type(mut self, element_type: PropertyType) -> Self {
        self.element_type = Some(element_type);
        self
    }

    /// Declare the collation of this field
    pub fn with_collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    /// Index map values rather than map keys
    pub fn by_value(mut self) -> Self {
        self.map_by = MapIndexBy::Value;
        self
    }

    /// Whether the field expands into one key per element
    pub fn is_multi_value(&self) -> bool {
        self.property_type.is_collection()
    }

    /// Type of the key component this field contributes
    pub fn key_type(&self) -> PropertyType {
        if self.property_type.is_map() && self.map_by == MapIndexBy::Key {
            return PropertyType::String;
        }
        if self.property_type.is_collection() {
            return self.element_type.unwrap_or(self.property_type);
        }
        self.property_type
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("indexed field name must not be empty"));
        }
        if !self.property_type.is_collection() {
            return Ok(());
        }
        if self.property_type.is_map() && self.map_by == MapIndexBy::Key {
            return Ok(());
        }
        match self.element_type {
            None => Err(Error::validation(format!(
                "field '{}' of type {} needs a declared element type to be indexed",
                self.name, self.property_type
            ))),
            Some(t) if t.is_collection() => Err(Error::validation(format!(
                "field '{}' has nested collection element type {}",
                self.name, t
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// Immutable schema of one index
#[derive(Debug, Clone)]
pub struct IndexDefinition {
    name: String,
    class_name: String,
    fields: Vec<IndexedField>,
    index_type: IndexType,
    ignore_null_values: bool,
    collations: Vec<Arc<dyn Collation>>,
}

impl IndexDefinition {
    /// Start a builder
    pub fn builder(name: impl Into<String>, class_name: impl Into<String>) -> IndexDefinitionBuilder {
        IndexDefinitionBuilder::new(name, class_name)
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Indexed class
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Indexed fields in key order
    pub fn fields(&self) -> &[IndexedField] {
        &self.fields
    }

    /// Field names in key order
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Position of a field in the key
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Unique or not
    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Whether at most one record may own a key
    pub fn is_unique(&self) -> bool {
        self.index_type == IndexType::Unique
    }

    /// Null policy
    pub fn ignore_null_values(&self) -> bool {
        self.ignore_null_values
    }

    /// Number of key components
    pub fn key_size(&self) -> usize {
        self.fields.len()
    }

    /// Index of the multi-valued field, if any
    pub fn multi_value_field(&self) -> Option<usize> {
        self.fields.iter().position(IndexedField::is_multi_value)
    }

    /// Collation applied to the given key position
    pub fn collation_at(&self, position: usize) -> Option<&Arc<dyn Collation>> {
        self.collations.get(position)
    }

    /// Collation name of a field
    pub fn collation_name(&self, field: &str) -> Option<&str> {
        self.field_position(field)
            .and_then(|i| self.collations.get(i))
            .map(|c| c.name())
    }

    /// Whether the index covers the given field
    pub fn covers(&self, field: &str) -> bool {
        self.field_position(field).is_some()
    }

    /// Normalize a full or partial key under the field collations
    pub fn normalize_key(&self, key: IndexKey) -> IndexKey {
        let components = key
            .into_components()
            .into_iter()
            .enumerate()
            .map(|(i, c)| match self.collations.get(i) {
                Some(collation) => collation.transform(c),
                None => c,
            })
            .collect::<Vec<_>>();
        IndexKey::new(components)
    }

    /// New definition with one field's collation replaced
    ///
    /// Entries keyed under the old definition are stale under the new one;
    /// callers must rebuild the index before serving queries.
    pub fn with_collation(
        &self,
        field: &str,
        collation: &str,
        registry: &CollationRegistry,
    ) -> Result<IndexDefinition> {
        let position = self.field_position(field).ok_or_else(|| {
            Error::validation(format!("index '{}' does not cover field '{}'", self.name, field))
        })?;
        let resolved = registry.resolve(collation)?;
        let mut next = self.clone();
        next.fields[position].collation = Some(resolved.name().to_string());
        next.collations[position] = resolved;
        Ok(next)
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ON {}(", self.name, self.class_name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field.name)?;
        }
        write!(f, ") {}", self.index_type)
    }
}

/// Builder for [`IndexDefinition`]
#[derive(Debug, Clone)]
pub struct IndexDefinitionBuilder {
    name: String,
    class_name: String,
    fields: Vec<IndexedField>,
    index_type: IndexType,
    ignore_null_values: Option<bool>,
}

impl IndexDefinitionBuilder {
    /// New builder for a non-unique index
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        IndexDefinitionBuilder {
            name: name.into(),
            class_name: class_name.into(),
            fields: Vec::new(),
            index_type: IndexType::NotUnique,
            ignore_null_values: None,
        }
    }

    /// Append a field
    pub fn field(mut self, field: IndexedField) -> Self {
        self.fields.push(field);
        self
    }

    /// Append a scalar field by name and type
    pub fn property(self, name: impl Into<String>, property_type: PropertyType) -> Self {
        self.field(IndexedField::new(name, property_type))
    }

    /// Make the index unique
    pub fn unique(mut self) -> Self {
        self.index_type = IndexType::Unique;
        self
    }

    /// Set uniqueness
    pub fn index_type(mut self, index_type: IndexType) -> Self {
        self.index_type = index_type;
        self
    }

    /// Set the null policy explicitly
    pub fn ignore_null_values(mut self, ignore: bool) -> Self {
        self.ignore_null_values = Some(ignore);
        self
    }

    /// Index name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Indexed class
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Fields added so far
    pub fn fields(&self) -> &[IndexedField] {
        &self.fields
    }

    /// Fields added so far, for schema inheritance
    pub fn fields_mut(&mut self) -> &mut [IndexedField] {
        &mut self.fields
    }

    /// Null policy used when none was set explicitly
    pub fn default_ignore_null_values(mut self, ignore: bool) -> Self {
        if self.ignore_null_values.is_none() {
            self.ignore_null_values = Some(ignore);
        }
        self
    }

    /// Validate and produce the definition
    ///
    /// # Errors
    ///
    /// Returns `Validation` when the name is empty, there are no fields, a
    /// field repeats, a collection field has no element type, more than one
    /// field is multi-valued, or a collation name does not resolve.
    pub fn build(self, registry: &CollationRegistry) -> Result<IndexDefinition> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("index name must not be empty"));
        }
        if self.class_name.trim().is_empty() {
            return Err(Error::validation(format!("index '{}' has no class", self.name)));
        }
        if self.fields.is_empty() {
            return Err(Error::validation(format!(
                "index '{}' must cover at least one field",
                self.name
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            field.validate()?;
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::validation(format!(
                    "index '{}' lists field '{}' twice",
                    self.name, field.name
                )));
            }
        }
        let multi = self.fields.iter().filter(|f| f.is_multi_value()).count();
        if multi > 1 {
            return Err(Error::validation(format!(
                "index '{}' has {} collection fields; at most one is allowed",
                self.name, multi
            )));
        }

        let mut fields = self.fields;
        let mut collations = Vec::with_capacity(fields.len());
        for field in fields.iter_mut() {
            let name = field.collation.as_deref().unwrap_or(DEFAULT_COLLATION);
            let collation = registry.resolve(name)?;
            field.collation = Some(collation.name().to_string());
            collations.push(collation);
        }

        Ok(IndexDefinition {
            name: self.name,
            class_name: self.class_name,
            fields,
            index_type: self.index_type,
            ignore_null_values: self.ignore_null_values.unwrap_or(true),
            collations,
        })
    }
}
