//! Index row encoding.
//!
//! A row is a sequence of [`IndexCell`]s whose derived ordering is the
//! index order: descending columns wrap their value in `Reverse`, and the
//! entity key is always the final ascending cell. Ancestor indexes prefix
//! every row with one ancestor key, producing one row per ancestor.

use dstore_model::{IndexDefinition, Key, PropertyMap, PropertyValue, KEY_PROPERTY};
use std::cmp::Reverse;
use std::collections::BTreeSet;

/// One cell of an index row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexCell {
    /// A value in an ascending column.
    Asc(PropertyValue),
    /// A value in a descending column.
    Desc(Reverse<PropertyValue>),
    /// Sorts after every other cell. Only used in scan bounds.
    Max,
}

impl IndexCell {
    /// Wraps `value` for a column with the given direction.
    #[must_use]
    pub fn new(value: PropertyValue, descending: bool) -> Self {
        if descending {
            Self::Desc(Reverse(value))
        } else {
            Self::Asc(value)
        }
    }

    /// Returns the wrapped value.
    #[must_use]
    pub fn value(&self) -> Option<&PropertyValue> {
        match self {
            Self::Asc(v) | Self::Desc(Reverse(v)) => Some(v),
            Self::Max => None,
        }
    }
}

/// An encoded index row.
pub type IndexRow = Vec<IndexCell>;

/// Returns the entity key stored in the last cell of `row`.
#[must_use]
pub fn row_key(row: &IndexRow) -> Option<&Key> {
    row.last().and_then(IndexCell::value).and_then(PropertyValue::as_key)
}

/// Encodes every row `def` holds for an entity.
///
/// An entity missing an indexed value for any column has no rows. Multiple
/// values of one property produce one row per value, and several
/// multi-valued columns produce their cross product.
#[must_use]
pub fn rows_for(def: &IndexDefinition, key: &Key, props: &PropertyMap) -> Vec<IndexRow> {
    if key.kind() != def.kind {
        return Vec::new();
    }

    let mut rows: Vec<IndexRow> = if def.ancestor {
        key.ancestors()
            .into_iter()
            .map(|anc| vec![IndexCell::Asc(PropertyValue::Key(anc))])
            .collect()
    } else {
        vec![Vec::new()]
    };

    for col in &def.columns {
        let values: BTreeSet<PropertyValue> = if col.property == KEY_PROPERTY {
            std::iter::once(PropertyValue::Key(key.clone())).collect()
        } else {
            props.indexed_values(&col.property).cloned().collect()
        };
        if values.is_empty() {
            return Vec::new();
        }
        rows = rows
            .iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut row = prefix.clone();
                    row.push(IndexCell::new(v.clone(), col.descending));
                    row
                })
            })
            .collect();
    }

    for row in &mut rows {
        row.push(IndexCell::Asc(PropertyValue::Key(key.clone())));
    }
    rows
}

/// Returns the built-in definitions an entity appears in: the kind index
/// and both directions of each property with an indexed value.
#[must_use]
pub fn builtin_definitions(key: &Key, props: &PropertyMap) -> Vec<IndexDefinition> {
    let mut defs = vec![IndexDefinition::kind_only(key.kind())];
    for (name, values) in props.iter() {
        if values.iter().any(|p| p.indexed) {
            defs.push(IndexDefinition::single(
                key.kind(),
                dstore_model::IndexColumn::asc(name),
            ));
            defs.push(IndexDefinition::single(
                key.kind(),
                dstore_model::IndexColumn::desc(name),
            ));
        }
    }
    defs
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstore_model::{IndexColumn, KeyContext, Property};

    fn key() -> Key {
        KeyContext::default().key("Parent", 1).child("Item", 2)
    }

    #[test]
    fn descending_cells_sort_backwards() {
        let a = IndexCell::new(PropertyValue::Int(1), true);
        let b = IndexCell::new(PropertyValue::Int(2), true);
        assert!(b < a);
        assert!(a < IndexCell::Max);
        assert!(IndexCell::Asc(PropertyValue::Int(9)) < IndexCell::Max);
    }

    #[test]
    fn cross_product_of_multi_values() {
        let def: IndexDefinition = "Item:a,-b".parse().unwrap();
        let props = PropertyMap::new()
            .with_values("a", [1, 2])
            .with_values("b", ["x", "y"]);
        let rows = rows_for(&def, &key(), &props);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| row_key(r) == Some(&key())));
    }

    #[test]
    fn ancestor_rows_per_ancestor() {
        let def = IndexDefinition::new("Item", true, vec![IndexColumn::asc("a")]);
        let props = PropertyMap::new().with("a", 1);
        let rows = rows_for(&def, &key(), &props);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0].value(), Some(&PropertyValue::Key(key().root())));
        assert_eq!(rows[1][0].value(), Some(&PropertyValue::Key(key())));
    }

    #[test]
    fn unindexed_and_missing_values_have_no_rows() {
        let def = IndexDefinition::single("Item", IndexColumn::asc("a"));
        let mut props = PropertyMap::new();
        props.push("a", Property::unindexed(1));
        assert!(rows_for(&def, &key(), &props).is_empty());
        assert!(rows_for(&def, &key(), &PropertyMap::new()).is_empty());
        assert_eq!(rows_for(&IndexDefinition::kind_only("Item"), &key(), &props).len(), 1);
    }

    #[test]
    fn builtins_skip_unindexed_properties() {
        let mut props = PropertyMap::new().with("a", 1);
        props.set_unindexed("b", 2);
        let defs = builtin_definitions(&key(), &props);
        assert_eq!(defs.len(), 3);
        assert!(defs.iter().all(IndexDefinition::is_builtin));
    }
}
