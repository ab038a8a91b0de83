//! Classes and properties
//!
//! Each class owns one cluster of record positions. Properties are optional:
//! documents may carry undeclared fields, but a declared property fixes the
//! field's type, the element type of a collection and its collation, and
//! index fields over it inherit those.

use std::collections::BTreeMap;

use tracing::info;

use trellis_core::{Error, PropertyType, Result};
use trellis_storage::{Document, Value};

/// Declared property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDef {
    /// Property name
    pub name: String,
    /// Declared type
    pub property_type: PropertyType,
    /// Element type of a collection property
    pub element_type: Option<PropertyType>,
    /// Collation name, `None` for the configured default
    pub collation: Option<String>,
}

impl PropertyDef {
    /// Property with the type's implied element type and no collation
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        PropertyDef {
            name: name.into(),
            property_type,
            element_type: property_type.implied_element_type(),
            collation: None,
        }
    }

    /// Declare the element type
    pub fn with_element_type(mut self, element_type: PropertyType) -> Self {
        self.element_type = Some(element_type);
        self
    }

    /// Declare the collation
    pub fn with_collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }

    /// Whether `value` may be stored under this property
    pub fn accepts(&self, value: &Value) -> bool {
        use PropertyType::*;
        match (self.property_type, value) {
            (_, Value::Null) => true,
            (Boolean, Value::Bool(_)) => true,
            (Integer, Value::Int(_)) | (Float, Value::Float(_)) | (Float, Value::Int(_)) => true,
            (String, Value::String(_)) | (Binary, Value::Bytes(_)) | (Link, Value::Link(_)) => true,
            (EmbeddedList | EmbeddedSet | LinkList | LinkSet, Value::List(_)) => true,
            (LinkBag, Value::LinkBag(_)) => true,
            (EmbeddedMap | LinkMap, Value::Map(_)) => true,
            _ => false,
        }
    }
}

/// A class and its cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    name: String,
    cluster: i32,
    properties: BTreeMap<String, PropertyDef>,
}

impl ClassDef {
    /// Class name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster holding the class's records
    pub fn cluster(&self) -> i32 {
        self.cluster
    }

    /// Declared property
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.get(name)
    }

    /// All declared properties, by name
    pub fn properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.values()
    }

    /// Reject documents whose fields contradict declared properties
    pub fn check_document(&self, document: &Document) -> Result<()> {
        for (field, value) in document.fields() {
            if let Some(property) = self.properties.get(field) {
                if !property.accepts(value) {
                    return Err(Error::validation(format!(
                        "{}.{} is declared {} but holds a {}",
                        self.name,
                        field,
                        property.property_type,
                        value.kind()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Every class
#[derive(Debug, Clone)]
pub struct Schema {
    classes: BTreeMap<String, ClassDef>,
    next_cluster: i32,
    version: u64,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    /// Empty schema
    pub fn new() -> Self {
        Schema {
            classes: BTreeMap::new(),
            next_cluster: 1,
            version: 0,
        }
    }

    /// Bumped by every change that alters how records are indexed
    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Create a class, returning its cluster
    pub fn create_class(&mut self, name: &str) -> Result<i32> {
        if name.trim().is_empty() {
            return Err(Error::validation("class name must not be empty"));
        }
        if self.classes.contains_key(name) {
            return Err(Error::validation(format!("class '{}' already exists", name)));
        }
        let cluster = self.next_cluster;
        self.next_cluster += 1;
        self.classes.insert(
            name.to_string(),
            ClassDef {
                name: name.to_string(),
                cluster,
                properties: BTreeMap::new(),
            },
        );
        info!(class = name, cluster, "Class created");
        Ok(cluster)
    }

    /// Look up a class
    pub fn class(&self, name: &str) -> Result<&ClassDef> {
        self.classes
            .get(name)
            .ok_or_else(|| Error::ClassNotFound(name.to_string()))
    }

    /// Class owning a cluster
    pub fn class_by_cluster(&self, cluster: i32) -> Option<&ClassDef> {
        self.classes.values().find(|c| c.cluster == cluster)
    }

    /// All class names
    pub fn class_names(&self) -> Vec<String> {
        self.classes.keys().cloned().collect()
    }

    /// Declare a property
    pub fn create_property(&mut self, class: &str, property: PropertyDef) -> Result<()> {
        let def = self
            .classes
            .get_mut(class)
            .ok_or_else(|| Error::ClassNotFound(class.to_string()))?;
        if def.properties.contains_key(&property.name) {
            return Err(Error::validation(format!(
                "property '{}.{}' already exists",
                class, property.name
            )));
        }
        def.properties.insert(property.name.clone(), property);
        Ok(())
    }

    /// Change a declared property's collation, returning the previous one
    pub fn set_property_collation(
        &mut self,
        class: &str,
        property: &str,
        collation: &str,
    ) -> Result<Option<String>> {
        let def = self
            .classes
            .get_mut(class)
            .ok_or_else(|| Error::ClassNotFound(class.to_string()))?;
        let prop = def.properties.get_mut(property).ok_or_else(|| {
            Error::validation(format!("property '{}.{}' does not exist", class, property))
        })?;
        Ok(prop.collation.replace(collation.to_string()))
    }

    /// Restore a collation saved by [`Schema::set_property_collation`]
    pub(crate) fn restore_property_collation(
        &mut self,
        class: &str,
        property: &str,
        previous: Option<String>,
    ) {
        if let Some(prop) = self
            .classes
            .get_mut(class)
            .and_then(|c| c.properties.get_mut(property))
        {
            prop.collation = previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_get_distinct_clusters() {
        let mut schema = Schema::new();
        let a = schema.create_class("A").unwrap();
        let b = schema.create_class("B").unwrap();
        assert_ne!(a, b);
        assert_eq!(schema.class_by_cluster(b).unwrap().name(), "B");
        assert!(schema.create_class("A").is_err());
        assert!(matches!(schema.class("C"), Err(Error::ClassNotFound(_))));
    }

    #[test]
    fn test_property_collation_replace_and_restore() {
        let mut schema = Schema::new();
        schema.create_class("P").unwrap();
        schema
            .create_property("P", PropertyDef::new("name", PropertyType::String))
            .unwrap();
        let previous = schema.set_property_collation("P", "name", "ci").unwrap();
        assert_eq!(previous, None);
        assert_eq!(
            schema.class("P").unwrap().property("name").unwrap().collation.as_deref(),
            Some("ci")
        );
        schema.restore_property_collation("P", "name", previous);
        assert_eq!(schema.class("P").unwrap().property("name").unwrap().collation, None);
    }

    #[test]
    fn test_check_document_against_declared_types() {
        let mut schema = Schema::new();
        schema.create_class("P").unwrap();
        schema
            .create_property("P", PropertyDef::new("age", PropertyType::Integer))
            .unwrap();
        let class = schema.class("P").unwrap();
        class
            .check_document(&Document::new("P").with("age", 3i64).with("free", "x"))
            .unwrap();
        let err = class
            .check_document(&Document::new("P").with("age", "three"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
