//! Immutable committed versions of the store.

use crate::pmap::PMap;
use crate::rows::{builtin_definitions, rows_for, IndexRow};
use dstore_model::{IndexDefinition, Key, PropertyMap};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Commit sequence number. Every commit produces the next one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Index partition: the set of rows of one definition.
pub type Partition = PMap<IndexRow, ()>;

/// A committed, immutable state of the whole store.
///
/// Cloning is cheap; mutation methods are only used while building the
/// next version.
#[derive(Debug, Clone, Default)]
pub struct Version {
    /// Sequence number of the commit that produced this version.
    pub seq: SequenceNumber,
    /// Entities by key.
    pub entities: PMap<Key, Arc<PropertyMap>>,
    /// Index partitions by definition, built-ins included.
    pub indexes: PMap<IndexDefinition, Partition>,
    /// Last commit sequence per entity group root.
    pub groups: PMap<Key, SequenceNumber>,
    /// Declared composite indexes.
    pub composites: Arc<BTreeSet<IndexDefinition>>,
}

impl Version {
    /// Returns the entity stored under `key`.
    #[must_use]
    pub fn entity(&self, key: &Key) -> Option<&Arc<PropertyMap>> {
        self.entities.get(key)
    }

    /// Returns the partition of `def`, if any row was ever written to it.
    #[must_use]
    pub fn partition(&self, def: &IndexDefinition) -> Option<&Partition> {
        self.indexes.get(def)
    }

    /// Returns the sequence of the last commit to `root`'s entity group.
    #[must_use]
    pub fn group_seq(&self, root: &Key) -> SequenceNumber {
        self.groups.get(root).copied().unwrap_or_default()
    }

    /// Returns true if `def` is declared or built in.
    #[must_use]
    pub fn has_index(&self, def: &IndexDefinition) -> bool {
        def.is_builtin() || self.composites.contains(def)
    }

    /// Applies a batch of writes as commit `seq`. `None` deletes.
    pub fn apply(&mut self, seq: SequenceNumber, writes: &[(Key, Option<Arc<PropertyMap>>)]) {
        for (key, value) in writes {
            self.write(key, value.clone());
            self.groups.insert(key.root(), seq);
        }
        self.seq = seq;
    }

    /// Declares a composite index and fills it from current entities.
    pub fn add_index(&mut self, def: &IndexDefinition) {
        if self.has_index(def) {
            return;
        }
        Arc::make_mut(&mut self.composites).insert(def.clone());
        let mut part = Partition::new();
        for (key, props) in self.entities.iter() {
            for row in rows_for(def, key, props) {
                part.insert(row, ());
            }
        }
        self.indexes.insert(def.clone(), part);
    }

    fn write(&mut self, key: &Key, value: Option<Arc<PropertyMap>>) {
        if let Some(old) = self.entities.get(key).cloned() {
            self.update_rows(key, &old, false);
        }
        match value {
            Some(props) => {
                self.update_rows(key, &props, true);
                self.entities.insert(key.clone(), props);
            }
            None => {
                self.entities.remove(key);
            }
        }
    }

    fn update_rows(&mut self, key: &Key, props: &PropertyMap, add: bool) {
        let composites: Vec<IndexDefinition> = self
            .composites
            .iter()
            .filter(|d| d.kind == key.kind())
            .cloned()
            .collect();
        for def in builtin_definitions(key, props).into_iter().chain(composites) {
            let rows = rows_for(&def, key, props);
            if rows.is_empty() {
                continue;
            }
            let mut part = self.indexes.get(&def).cloned().unwrap_or_default();
            for row in rows {
                if add {
                    part.insert(row, ());
                } else {
                    part.remove(&row);
                }
            }
            self.indexes.insert(def, part);
        }
    }
}
