//! Benchmark utilities.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use dstore_memory::{MemStore, MemoryConfig};
use dstore_model::{Key, PropertyMap};
use dstore_raw::{datastore, Context};
use rand::Rng;
use std::sync::Arc;

/// Generate a random item with `payload` bytes of unindexed data.
pub fn random_item(payload: usize) -> PropertyMap {
    let mut rng = rand::thread_rng();
    let mut props = PropertyMap::new()
        .with("a", rng.gen_range(0i64..10))
        .with("b", rng.gen_range(0i64..100))
        .with("c", rng.gen::<i64>());
    props.set_unindexed("payload", (0..payload).map(|_| rng.gen::<u8>()).collect::<Vec<u8>>());
    props
}

/// Generate keys `Item/1..=count` in the context's key space.
pub fn item_keys(ctx: &Context, count: usize) -> Vec<Key> {
    (1..=count as i64)
        .map(|i| datastore::new_key(ctx, "Item", i))
        .collect()
}

/// Create a store with `count` random items and the given composite indexes.
pub fn populated_store(count: usize, indexes: &[&str]) -> (Arc<MemStore>, Context, Vec<Key>) {
    let defs = indexes.iter().filter_map(|d| d.parse().ok());
    let store = MemStore::new(MemoryConfig::new().indexes(defs));
    let ctx = store.context();
    let keys = item_keys(&ctx, count);
    let values: Vec<PropertyMap> = (0..count).map(|_| random_item(64)).collect();
    for r in datastore::put_multi(&ctx, &keys, &values) {
        if let Err(err) = r {
            panic!("failed to populate bench store: {err}");
        }
    }
    (store, ctx, keys)
}
