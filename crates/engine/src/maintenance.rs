//! Index maintenance
//!
//! The only path by which index content changes. A record save or delete
//! hands the old and new document to [`compute_delta`], which extracts the
//! key set of each side and produces the keys to remove and to add for one
//! index. The delta is then folded into the transaction's overlay.
//!
//! # Key extraction
//!
//! Every indexed field contributes one or more key components:
//!
//! - a scalar field contributes its value, coerced to the declared type
//! - a collection field contributes one component per element; maps
//!   contribute their keys or their values
//! - an empty collection contributes a null placeholder
//!
//! The record's keys are the cartesian product of the per-field components.
//! At most one field is a collection, so the product is linear in the
//! collection size. Keys are normalized under the field collations and
//! deduplicated; keys holding a null are dropped when the index ignores
//! nulls.

use std::collections::BTreeSet;

use trellis_core::{
    IndexDefinition, IndexKey, IndexedField, KeyComponent, MapIndexBy, PageRead, RecordId, Result,
};
use trellis_concurrency::TransactionIndexChanges;
use trellis_storage::{Document, Value};

/// Keys to remove and add for one record in one index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexDelta {
    /// Keys the record no longer has
    pub removed: Vec<IndexKey>,
    /// Keys the record newly has
    pub added: Vec<IndexKey>,
}

impl IndexDelta {
    /// Whether the index is unaffected
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// Fold into an overlay on behalf of `id`
    pub fn apply_to(&self, overlay: &mut TransactionIndexChanges, id: RecordId) {
        for key in &self.removed {
            overlay.remove(key.clone(), id);
        }
        for key in &self.added {
            overlay.put(key.clone(), id);
        }
    }
}

fn field_components(
    field: &IndexedField,
    value: &Value,
    pages: &dyn PageRead,
) -> Result<Vec<KeyComponent>> {
    let key_type = field.key_type();
    if !field.is_multi_value() {
        return Ok(vec![value.to_key_component(key_type)?]);
    }
    let components = match value {
        Value::Null => vec![KeyComponent::Null],
        Value::List(items) => items
            .iter()
            .map(|item| item.to_key_component(key_type))
            .collect::<Result<Vec<_>>>()?,
        Value::LinkBag(bag) => bag.to_vec(pages)?.into_iter().map(KeyComponent::Link).collect(),
        Value::Map(map) => match field.map_by {
            MapIndexBy::Key => map.keys().map(|k| KeyComponent::String(k.clone())).collect(),
            MapIndexBy::Value => map
                .values()
                .map(|v| v.to_key_component(key_type))
                .collect::<Result<Vec<_>>>()?,
        },
        scalar => vec![scalar.to_key_component(key_type)?],
    };
    if components.is_empty() {
        return Ok(vec![KeyComponent::Null]);
    }
    Ok(components)
}

/// Every key `document` has in the index described by `definition`
///
/// # Errors
///
/// `Validation` when a field value cannot be coerced to its declared type.
pub fn extract_keys(
    definition: &IndexDefinition,
    document: &Document,
    pages: &dyn PageRead,
) -> Result<BTreeSet<IndexKey>> {
    let mut partial: Vec<Vec<KeyComponent>> = vec![Vec::with_capacity(definition.key_size())];
    for field in definition.fields() {
        let alternatives = field_components(field, document.get(&field.name), pages)?;
        partial = if alternatives.len() == 1 {
            for prefix in partial.iter_mut() {
                prefix.push(alternatives[0].clone());
            }
            partial
        } else {
            partial
                .iter()
                .flat_map(|prefix| {
                    alternatives.iter().map(move |c| {
                        let mut key = prefix.clone();
                        key.push(c.clone());
                        key
                    })
                })
                .collect()
        };
    }

    let ignore_nulls = definition.ignore_null_values();
    Ok(partial
        .into_iter()
        .map(|components| definition.normalize_key(IndexKey::new(components)))
        .filter(|key| !(ignore_nulls && key.has_null()))
        .collect())
}

/// Keys to remove and add when a record goes from `old` to `new`
///
/// `old` is `None` for an insert and `new` is `None` for a delete. Keys
/// present on both sides produce nothing, so reassigning a field several
/// times before saving only ever yields the net change.
pub fn compute_delta(
    definition: &IndexDefinition,
    old: Option<&Document>,
    new: Option<&Document>,
    pages: &dyn PageRead,
) -> Result<IndexDelta> {
    let before = match old {
        Some(doc) => extract_keys(definition, doc, pages)?,
        None => BTreeSet::new(),
    };
    let after = match new {
        Some(doc) => extract_keys(definition, doc, pages)?,
        None => BTreeSet::new(),
    };
    Ok(IndexDelta {
        removed: before.difference(&after).cloned().collect(),
        added: after.difference(&before).cloned().collect(),
    })
}
