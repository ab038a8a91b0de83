//! Documents and field values
//!
//! A [`Document`] is a class name, an optional identity and a map from field
//! name to a closed [`Value`] variant. Absent fields read as `Null`.
//!
//! Links between documents are plain [`RecordId`] handles resolved through
//! the record store, so self-references and cycles need no special care.

use std::collections::BTreeMap;
use std::fmt;

use trellis_core::{Error, KeyComponent, PropertyType, RecordId, Result};

use crate::link_bag::AdaptiveLinkCollection;

/// Field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent or explicit null
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Link to a record
    Link(RecordId),
    /// List or set of values (embedded or links)
    List(Vec<Value>),
    /// String-keyed map
    Map(BTreeMap<String, Value>),
    /// Multiset of links with adaptive storage
    LinkBag(AdaptiveLinkCollection),
}

impl Value {
    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, for messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Link(_) => "link",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::LinkBag(_) => "linkbag",
        }
    }

    /// List of links
    pub fn links(ids: impl IntoIterator<Item = RecordId>) -> Value {
        Value::List(ids.into_iter().map(Value::Link).collect())
    }

    /// Borrow the link bag, if this is one
    pub fn as_link_bag(&self) -> Option<&AdaptiveLinkCollection> {
        match self {
            Value::LinkBag(bag) => Some(bag),
            _ => None,
        }
    }

    /// Mutably borrow the link bag, if this is one
    pub fn as_link_bag_mut(&mut self) -> Option<&mut AdaptiveLinkCollection> {
        match self {
            Value::LinkBag(bag) => Some(bag),
            _ => None,
        }
    }

    /// Convert a scalar value into a key component of the declared type
    ///
    /// Integers and floats convert into each other when no precision is lost,
    /// strings parse into numbers and links, and any scalar renders into a
    /// string field. Anything else is a `Validation` error.
    pub fn to_key_component(&self, ty: PropertyType) -> Result<KeyComponent> {
        let mismatch = || {
            Error::validation(format!("cannot index {} value {} as {}", self.kind(), self, ty))
        };
        match (ty, self) {
            (_, Value::Null) => Ok(KeyComponent::Null),
            (PropertyType::Boolean, Value::Bool(b)) => Ok(KeyComponent::Bool(*b)),
            (PropertyType::Boolean, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(KeyComponent::Bool(true)),
                "false" => Ok(KeyComponent::Bool(false)),
                _ => Err(mismatch()),
            },
            (PropertyType::Integer, Value::Int(i)) => Ok(KeyComponent::Int(*i)),
            (PropertyType::Integer, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
                Ok(KeyComponent::Int(*f as i64))
            }
            (PropertyType::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(KeyComponent::Int).map_err(|_| mismatch())
            }
            (PropertyType::Float, Value::Float(f)) => Ok(KeyComponent::from_float(*f)),
            (PropertyType::Float, Value::Int(i)) => Ok(KeyComponent::from_float(*i as f64)),
            (PropertyType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .map(KeyComponent::from_float)
                .map_err(|_| mismatch()),
            (PropertyType::String, Value::String(s)) => Ok(KeyComponent::String(s.clone())),
            (PropertyType::String, Value::Int(_))
            | (PropertyType::String, Value::Float(_))
            | (PropertyType::String, Value::Bool(_))
            | (PropertyType::String, Value::Link(_)) => Ok(KeyComponent::String(self.to_string())),
            (PropertyType::Binary, Value::Bytes(b)) => Ok(KeyComponent::Bytes(b.clone())),
            (PropertyType::Binary, Value::String(s)) => Ok(KeyComponent::Bytes(s.as_bytes().to_vec())),
            (PropertyType::Link, Value::Link(rid)) => Ok(KeyComponent::Link(*rid)),
            (PropertyType::Link, Value::String(s)) => {
                s.parse::<RecordId>().map(KeyComponent::Link).map_err(|_| mismatch())
            }
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Link(rid) => write!(f, "{}", rid),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::LinkBag(bag) => write!(f, "<linkbag size={}>", bag.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<RecordId> for Value {
    fn from(v: RecordId) -> Self {
        Value::Link(v)
    }
}

impl From<AdaptiveLinkCollection> for Value {
    fn from(v: AdaptiveLinkCollection) -> Self {
        Value::LinkBag(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

static NULL: Value = Value::Null;

/// A record's content
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    class_name: String,
    identity: Option<RecordId>,
    version: u64,
    fields: BTreeMap<String, Value>,
}

impl Document {
    /// New unsaved document
    pub fn new(class_name: impl Into<String>) -> Self {
        Document {
            class_name: class_name.into(),
            identity: None,
            version: 0,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Class of the document
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Address, `None` before the first save
    pub fn identity(&self) -> Option<RecordId> {
        self.identity
    }

    /// Version observed when loaded (0 for new documents)
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Assign identity and version; used by the record layer on save and load
    pub fn assign(&mut self, identity: RecordId, version: u64) {
        self.identity = Some(identity);
        self.version = version;
    }

    /// Set a field
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Read a field, `Null` when absent
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }

    /// Mutably borrow a present field
    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.fields.get_mut(field)
    }

    /// Remove a field, returning its value
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Whether a field is present
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Mutably borrow a link bag field, creating it if absent
    pub fn link_bag_mut(&mut self, field: &str) -> Result<&mut AdaptiveLinkCollection> {
        let value = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| Value::LinkBag(AdaptiveLinkCollection::new()));
        let kind = value.kind();
        value.as_link_bag_mut().ok_or_else(|| {
            Error::validation(format!("field '{}' holds a {}, not a link bag", field, kind))
        })
    }

    /// All fields in name order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All fields, mutably
    pub fn fields_mut(&mut self) -> impl Iterator<Item = (&str, &mut Value)> {
        self.fields.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Link bag fields in name order
    pub fn link_bags(&self) -> impl Iterator<Item = (&str, &AdaptiveLinkCollection)> {
        self.fields
            .iter()
            .filter_map(|(k, v)| v.as_link_bag().map(|bag| (k.as_str(), bag)))
    }

    /// Link bag fields, mutably
    pub fn link_bags_mut(&mut self) -> impl Iterator<Item = (&str, &mut AdaptiveLinkCollection)> {
        self.fields
            .iter_mut()
            .filter_map(|(k, v)| v.as_link_bag_mut().map(|bag| (k.as_str(), bag)))
    }
}
