//! Access path selection
//!
//! For each online index of the queried class the planner matches the
//! flattened conjuncts against the index fields in order:
//!
//! 1. the longest prefix of fields constrained by `=`, `IN` or `IS NULL`
//! 2. optionally a range on the next field, from `>`/`>=` and `<`/`<=`
//!
//! When a field carries several bounds on the same side, the tightest one
//! is scanned.
//!
//! A range with both a lower and an upper bound on the same field, and no
//! equality on that field, is served as one combined range scan and
//! reported as converted. A lone bound is still a range scan but is not
//! reported as converted; `field >= a AND field = b` uses the equality as a
//! point lookup and is not a range at all.
//!
//! An index that ignores nulls holds no entry for a record with a null in
//! any of its fields, so it is only usable when every field is constrained.
//! Every conjunct is re-checked against the loaded documents afterwards, so
//! the access path only has to return a superset.

use std::cmp::Ordering;
use std::sync::Arc;

use trellis_core::{IndexKey, KeyComponent};
use trellis_concurrency::KeyRange;
use trellis_storage::{IndexState, PersistedIndex, Value};

use super::Predicate;

/// How a query reaches its candidate records
#[derive(Clone)]
pub enum AccessPath {
    /// Scan every record of the class
    FullScan,
    /// Exact full keys
    Points {
        /// Index looked up
        index: Arc<PersistedIndex>,
        /// Keys looked up
        keys: Vec<IndexKey>,
    },
    /// Key ranges, possibly over a prefix
    Ranges {
        /// Index scanned
        index: Arc<PersistedIndex>,
        /// Ranges scanned, in order
        ranges: Vec<KeyRange>,
        /// Whether a closed range conjunction was combined into one scan
        converted: bool,
    },
}

impl AccessPath {
    /// Name of the index used, if any
    pub fn index_name(&self) -> Option<String> {
        match self {
            AccessPath::FullScan => None,
            AccessPath::Points { index, .. } | AccessPath::Ranges { index, .. } => Some(index.name()),
        }
    }

    /// Whether a range conjunction was converted
    pub fn is_converted(&self) -> bool {
        matches!(self, AccessPath::Ranges { converted: true, .. })
    }
}

impl std::fmt::Debug for AccessPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessPath::FullScan => write!(f, "FullScan"),
            AccessPath::Points { index, keys } => {
                write!(f, "Points({}, {} keys)", index.name(), keys.len())
            }
            AccessPath::Ranges { index, ranges, converted } => write!(
                f,
                "Ranges({}, {} ranges, converted={})",
                index.name(),
                ranges.len(),
                converted
            ),
        }
    }
}

struct Bound {
    component: KeyComponent,
    inclusive: bool,
}

impl Bound {
    /// Whether `self` cuts deeper than `other` in the `inward` direction
    ///
    /// Any one bound of a conjunction yields a superset, so picking by raw
    /// component order stays correct when a collation reorders keys.
    fn narrows(&self, other: &Bound, inward: Ordering) -> bool {
        match self.component.cmp(&other.component) {
            Ordering::Equal => !self.inclusive && other.inclusive,
            order => order == inward,
        }
    }
}

struct Candidate {
    path: AccessPath,
    covered: usize,
    unique: bool,
}

/// Leaf conjuncts of a predicate, with nested `AND`s flattened
pub fn conjuncts(predicate: &Predicate) -> Vec<&Predicate> {
    match predicate {
        Predicate::And(parts) => parts.iter().flat_map(conjuncts).collect(),
        leaf => vec![leaf],
    }
}

/// Choose the access path for `predicate` among `indexes`
///
/// Prefers the index covering the most fields, then unique indexes, then
/// the first by name.
pub fn plan(predicate: &Predicate, indexes: &[Arc<PersistedIndex>]) -> AccessPath {
    let leaves = conjuncts(predicate);
    let mut best: Option<Candidate> = None;
    for index in indexes {
        if let Some(candidate) = plan_index(index, &leaves) {
            let better = match &best {
                None => true,
                Some(b) => (candidate.covered, candidate.unique) > (b.covered, b.unique),
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best.map(|c| c.path).unwrap_or(AccessPath::FullScan)
}

fn coerce(value: &Value, ty: trellis_core::PropertyType) -> Option<KeyComponent> {
    value.to_key_component(ty).ok()
}

fn plan_index(index: &Arc<PersistedIndex>, leaves: &[&Predicate]) -> Option<Candidate> {
    if index.state() != IndexState::Online {
        return None;
    }
    let definition = index.definition();
    let ignore_nulls = definition.ignore_null_values();
    let fields = definition.fields();

    let mut prefixes: Vec<Vec<KeyComponent>> = vec![Vec::new()];
    let mut position = 0;
    for field in fields {
        let ty = field.key_type();
        let mut alternatives: Option<Vec<KeyComponent>> = None;
        for leaf in leaves.iter().filter(|l| l.field() == Some(field.name.as_str())) {
            alternatives = match leaf {
                Predicate::Eq(_, v) if !v.is_null() => Some(vec![coerce(v, ty)?]),
                Predicate::In(_, vs) => Some(
                    vs.iter()
                        .filter(|v| !v.is_null())
                        .map(|v| coerce(v, ty))
                        .collect::<Option<Vec<_>>>()?,
                ),
                Predicate::IsNull(_) if !ignore_nulls && !field.is_multi_value() => {
                    Some(vec![KeyComponent::Null])
                }
                _ => continue,
            };
            break;
        }
        let Some(alternatives) = alternatives else {
            break;
        };
        prefixes = prefixes
            .iter()
            .flat_map(|p| {
                alternatives.iter().map(move |c| {
                    let mut key = p.clone();
                    key.push(c.clone());
                    key
                })
            })
            .collect();
        position += 1;
    }

    let mut lower: Option<Bound> = None;
    let mut upper: Option<Bound> = None;
    if let Some(field) = fields.get(position) {
        let ty = field.key_type();
        for leaf in leaves.iter().filter(|l| l.field() == Some(field.name.as_str())) {
            match leaf {
                Predicate::Gt(_, v) | Predicate::Ge(_, v) if !v.is_null() => {
                    let bound = Bound {
                        component: coerce(v, ty)?,
                        inclusive: matches!(leaf, Predicate::Ge(..)),
                    };
                    if lower.as_ref().map_or(true, |b| bound.narrows(b, Ordering::Greater)) {
                        lower = Some(bound);
                    }
                }
                Predicate::Lt(_, v) | Predicate::Le(_, v) if !v.is_null() => {
                    let bound = Bound {
                        component: coerce(v, ty)?,
                        inclusive: matches!(leaf, Predicate::Le(..)),
                    };
                    if upper.as_ref().map_or(true, |b| bound.narrows(b, Ordering::Less)) {
                        upper = Some(bound);
                    }
                }
                _ => {}
            }
        }
    }

    let has_range = lower.is_some() || upper.is_some();
    let covered = position + usize::from(has_range);
    if covered == 0 || (ignore_nulls && covered < fields.len()) {
        return None;
    }

    let path = if has_range {
        let converted = lower.is_some() && upper.is_some();
        let ranges = prefixes
            .into_iter()
            .map(|prefix| range_over(prefix, lower.as_ref(), upper.as_ref()))
            .collect();
        AccessPath::Ranges {
            index: Arc::clone(index),
            ranges,
            converted,
        }
    } else if position == fields.len() {
        AccessPath::Points {
            index: Arc::clone(index),
            keys: prefixes.into_iter().map(IndexKey::new).collect(),
        }
    } else {
        AccessPath::Ranges {
            index: Arc::clone(index),
            ranges: prefixes
                .into_iter()
                .map(|p| KeyRange::prefix(IndexKey::new(p)))
                .collect(),
            converted: false,
        }
    };
    Some(Candidate {
        path,
        covered,
        unique: definition.is_unique(),
    })
}

fn range_over(prefix: Vec<KeyComponent>, lower: Option<&Bound>, upper: Option<&Bound>) -> KeyRange {
    let open_end = |prefix: &Vec<KeyComponent>| {
        if prefix.is_empty() {
            None
        } else {
            Some(IndexKey::new(prefix.clone()))
        }
    };
    let extend = |b: &Bound| {
        let mut key = prefix.clone();
        key.push(b.component.clone());
        IndexKey::new(key)
    };
    KeyRange {
        from: lower.map(extend).or_else(|| open_end(&prefix)),
        to: upper.map(extend).or_else(|| open_end(&prefix)),
        from_inclusive: lower.map_or(true, |b| b.inclusive),
        to_inclusive: upper.map_or(true, |b| b.inclusive),
    }
}
