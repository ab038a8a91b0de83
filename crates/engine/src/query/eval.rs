//! Predicate evaluation against documents
//!
//! Comparison coerces both sides to one key type and normalizes them under
//! the field's collation, so residual filtering agrees with what an index
//! over the same property returns. Collection fields match when any element
//! matches. A null side never compares.
//!
//! A field's collation comes from its schema property. When the property
//! declares none, a collation declared on an index field over it takes its
//! place, so a query answered by a full scan filters the same way as one
//! answered through that index.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use trellis_core::{
    Collation, CollationRegistry, IndexDefinition, KeyComponent, PageRead, PropertyType, Result,
};
use trellis_storage::{Document, Value};

use super::Predicate;
use crate::database::ClassDef;

/// Evaluates predicates for documents of one class
pub struct Evaluator<'a> {
    class: &'a ClassDef,
    registry: &'a CollationRegistry,
    default_collation: Arc<dyn Collation>,
    index_collations: BTreeMap<String, Arc<dyn Collation>>,
    pages: &'a dyn PageRead,
}

fn value_type(value: &Value) -> Option<PropertyType> {
    match value {
        Value::Bool(_) => Some(PropertyType::Boolean),
        Value::Int(_) => Some(PropertyType::Integer),
        Value::Float(_) => Some(PropertyType::Float),
        Value::String(_) => Some(PropertyType::String),
        Value::Bytes(_) => Some(PropertyType::Binary),
        Value::Link(_) => Some(PropertyType::Link),
        _ => None,
    }
}

impl<'a> Evaluator<'a> {
    /// Evaluator for `class`
    ///
    /// Fields whose property declares no collation use the first of
    /// `indexes` (in order) that collates the field differently from
    /// `default_collation`, and `default_collation` otherwise.
    pub fn new(
        class: &'a ClassDef,
        registry: &'a CollationRegistry,
        default_collation: &str,
        indexes: &[Arc<IndexDefinition>],
        pages: &'a dyn PageRead,
    ) -> Result<Self> {
        let default_collation = registry.resolve(default_collation)?;
        let mut index_collations: BTreeMap<String, Arc<dyn Collation>> = BTreeMap::new();
        for definition in indexes {
            for (position, field) in definition.fields().iter().enumerate() {
                let declared = class
                    .property(&field.name)
                    .is_some_and(|p| p.collation.is_some());
                if declared || index_collations.contains_key(&field.name) {
                    continue;
                }
                if let Some(collation) = definition.collation_at(position) {
                    if collation.name() != default_collation.name() {
                        index_collations.insert(field.name.clone(), Arc::clone(collation));
                    }
                }
            }
        }
        Ok(Evaluator {
            class,
            registry,
            default_collation,
            index_collations,
            pages,
        })
    }

    fn collation(&self, field: &str) -> Arc<dyn Collation> {
        self.class
            .property(field)
            .and_then(|p| p.collation.as_deref())
            .and_then(|name| self.registry.resolve(name).ok())
            .or_else(|| self.index_collations.get(field).cloned())
            .unwrap_or_else(|| Arc::clone(&self.default_collation))
    }

    fn declared_scalar_type(&self, field: &str) -> Option<PropertyType> {
        let property = self.class.property(field)?;
        if property.property_type.is_collection() {
            property.element_type
        } else {
            Some(property.property_type)
        }
    }

    fn elements(&self, value: &Value) -> Result<Vec<Value>> {
        Ok(match value {
            Value::List(items) => items.clone(),
            Value::LinkBag(bag) => bag.to_vec(self.pages)?.into_iter().map(Value::Link).collect(),
            Value::Map(map) => map
                .keys()
                .map(|k| Value::String(k.clone()))
                .chain(map.values().cloned())
                .collect(),
            scalar => vec![scalar.clone()],
        })
    }

    fn compare(&self, field: &str, actual: &Value, literal: &Value) -> Option<Ordering> {
        let ty = match (actual, literal) {
            (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => PropertyType::Float,
            _ => self
                .declared_scalar_type(field)
                .or_else(|| value_type(actual))?,
        };
        let collation = self.collation(field);
        let a = collation.transform(actual.to_key_component(ty).ok()?);
        let b = collation.transform(literal.to_key_component(ty).ok()?);
        if matches!(a, KeyComponent::Null) || matches!(b, KeyComponent::Null) {
            return None;
        }
        Some(a.cmp(&b))
    }

    fn any_element<F>(&self, document_value: &Value, mut test: F) -> Result<bool>
    where
        F: FnMut(&Value) -> bool,
    {
        for element in self.elements(document_value)? {
            if test(&element) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether `document` satisfies `predicate`
    pub fn matches(&self, predicate: &Predicate, document: &Document) -> Result<bool> {
        match predicate {
            Predicate::And(parts) => {
                for part in parts {
                    if !self.matches(part, document)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::IsNull(field) => Ok(document.get(field).is_null()),
            Predicate::In(field, literals) => {
                let value = document.get(field);
                self.any_element(value, |element| {
                    literals
                        .iter()
                        .any(|l| self.compare(field, element, l) == Some(Ordering::Equal))
                })
            }
            Predicate::Eq(field, literal)
            | Predicate::Gt(field, literal)
            | Predicate::Ge(field, literal)
            | Predicate::Lt(field, literal)
            | Predicate::Le(field, literal) => {
                let value = document.get(field);
                self.any_element(value, |element| {
                    let ordering = self.compare(field, element, literal);
                    match (predicate, ordering) {
                        (_, None) => false,
                        (Predicate::Eq(..), Some(o)) => o == Ordering::Equal,
                        (Predicate::Gt(..), Some(o)) => o == Ordering::Greater,
                        (Predicate::Ge(..), Some(o)) => o != Ordering::Less,
                        (Predicate::Lt(..), Some(o)) => o == Ordering::Less,
                        (Predicate::Le(..), Some(o)) => o != Ordering::Greater,
                        _ => false,
                    }
                })
            }
        }
    }
}
