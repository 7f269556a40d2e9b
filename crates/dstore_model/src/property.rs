//! Property values and property maps.

use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Name of the pseudo-property holding an entity's key.
pub const KEY_PROPERTY: &str = "__key__";

/// A typed property value.
///
/// Values of different types order by type rank (null, int, bool, text,
/// bytes, float, key); values of the same type by their natural order.
/// Floats use the IEEE total order so the ordering is total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Null.
    Null,
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Floating point number.
    Float(f64),
    /// Reference to another entity.
    Key(Key),
}

impl PropertyValue {
    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Int(_) => 1,
            Self::Bool(_) => 2,
            Self::Text(_) => 3,
            Self::Bytes(_) => 4,
            Self::Float(_) => 5,
            Self::Key(_) => 6,
        }
    }

    /// Returns the type name of this value.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Float(_) => "float",
            Self::Key(_) => "key",
        }
    }

    /// Returns the key if this value is a key.
    #[must_use]
    pub fn as_key(&self) -> Option<&Key> {
        match self {
            Self::Key(key) => Some(key),
            _ => None,
        }
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Key(a), Self::Key(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropertyValue {}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => {
                write!(f, "BLOB(")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                write!(f, ")")
            }
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Key(k) => write!(f, "KEY({k})"),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Key> for PropertyValue {
    fn from(v: Key) -> Self {
        Self::Key(v)
    }
}

/// A single stored value and whether it participates in indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    /// The value.
    pub value: PropertyValue,
    /// Whether the value is written to index partitions.
    pub indexed: bool,
}

impl Property {
    /// Creates an indexed property.
    #[must_use]
    pub fn new(value: impl Into<PropertyValue>) -> Self {
        Self {
            value: value.into(),
            indexed: true,
        }
    }

    /// Creates a property that is stored but never indexed.
    #[must_use]
    pub fn unindexed(value: impl Into<PropertyValue>) -> Self {
        Self {
            value: value.into(),
            indexed: false,
        }
    }
}

/// Ordered mapping from property name to one or more values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyMap(BTreeMap<String, Vec<Property>>);

impl PropertyMap {
    /// Creates an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this map with `name` set to a single indexed value.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Returns this map with `name` set to several indexed values.
    #[must_use]
    pub fn with_values<V: Into<PropertyValue>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.0.insert(
            name.into(),
            values.into_iter().map(Property::new).collect(),
        );
        self
    }

    /// Sets `name` to a single indexed value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(name.into(), vec![Property::new(value)]);
    }

    /// Sets `name` to a single unindexed value.
    pub fn set_unindexed(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(name.into(), vec![Property::unindexed(value)]);
    }

    /// Appends a value to `name`, making it multi-valued.
    pub fn push(&mut self, name: impl Into<String>, property: Property) {
        self.0.entry(name.into()).or_default().push(property);
    }

    /// Replaces all values of `name`.
    pub fn insert(&mut self, name: impl Into<String>, properties: Vec<Property>) {
        self.0.insert(name.into(), properties);
    }

    /// Removes `name`, returning its values.
    pub fn remove(&mut self, name: &str) -> Option<Vec<Property>> {
        self.0.remove(name)
    }

    /// Returns all values of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[Property]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Returns the first value of `name`.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&PropertyValue> {
        self.0.get(name).and_then(|v| v.first()).map(|p| &p.value)
    }

    /// Iterates over the indexed values of `name`.
    pub fn indexed_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a PropertyValue> + 'a {
        self.0
            .get(name)
            .into_iter()
            .flatten()
            .filter(|p| p.indexed)
            .map(|p| &p.value)
    }

    /// Iterates over all properties in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Property])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Returns the number of named properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
