//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up in-memory stores
//! and common test scenarios.

use dstore_memory::{MemStore, MemoryConfig};
use dstore_model::{IndexDefinition, Key, PropertyMap};
use dstore_raw::{datastore, Context};
use std::sync::Arc;

/// An in-memory store together with a context that resolves to it.
pub struct TestStore {
    /// The store instance.
    pub store: Arc<MemStore>,
    /// Root context with no filters installed.
    pub ctx: Context,
}

impl TestStore {
    /// Creates a store with the default configuration.
    pub fn memory() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    /// Creates a store with `config`.
    pub fn with_config(config: MemoryConfig) -> Self {
        let store = MemStore::new(config);
        let ctx = store.context();
        Self { store, ctx }
    }

    /// Creates a store that declares any missing index on first use.
    pub fn auto_indexed() -> Self {
        Self::with_config(MemoryConfig::new().auto_index(true))
    }

    /// Creates a store with indexes given in their text form, like
    /// `"Item:a,-b"`.
    pub fn with_indexes(defs: &[&str]) -> Self {
        let defs = defs.iter().map(|d| {
            d.parse::<IndexDefinition>()
                .expect("Failed to parse index definition")
        });
        Self::with_config(MemoryConfig::new().indexes(defs))
    }

    /// Returns a root key in the store's key context.
    pub fn key(&self, kind: &str, id: i64) -> Key {
        datastore::new_key(&self.ctx, kind, id)
    }

    /// Puts one entity.
    pub fn put(&self, key: &Key, value: PropertyMap) -> Key {
        datastore::put(&self.ctx, key, value).expect("Failed to put entity")
    }

    /// Puts entities in one batch.
    pub fn put_all(&self, keys: &[Key], values: &[PropertyMap]) -> Vec<Key> {
        datastore::put_multi(&self.ctx, keys, values)
            .into_iter()
            .map(|r| r.expect("Failed to put entity"))
            .collect()
    }
}

impl std::ops::Deref for TestStore {
    type Target = Context;

    fn deref(&self) -> &Self::Target {
        &self.ctx
    }
}

/// Runs a test with a fresh default store.
pub fn with_store<F, R>(f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let ts = TestStore::memory();
    f(&ts)
}

/// Common test scenarios.
pub mod scenarios {
    use super::*;

    /// Properties of the `i`-th item.
    ///
    /// `a` cycles through 0..3, `b` through 0..5, `c` is `i` itself.
    pub fn item(i: i64) -> PropertyMap {
        PropertyMap::new()
            .with("a", i % 3)
            .with("b", i % 5)
            .with("c", i)
            .with("name", format!("item-{i:04}"))
    }

    /// Creates an auto-indexed store holding `count` `Item` entities with
    /// ids `1..=count`.
    pub fn populated_store(count: usize) -> TestStore {
        let ts = TestStore::auto_indexed();
        populate(&ts, count);
        ts
    }

    /// Adds `count` `Item` entities with ids `1..=count` to `ts`.
    pub fn populate(ts: &TestStore, count: usize) -> Vec<Key> {
        let ids = 1..=count as i64;
        let keys: Vec<Key> = ids.clone().map(|i| ts.key("Item", i)).collect();
        let values: Vec<PropertyMap> = ids.map(item).collect();
        ts.put_all(&keys, &values)
    }

    /// Creates `groups` `Counter` roots with `n = 0`.
    pub fn counters(ts: &TestStore, groups: usize) -> Vec<Key> {
        (1..=groups as i64)
            .map(|i| ts.put(&ts.key("Counter", i), PropertyMap::new().with("n", 0)))
            .collect()
    }
}
