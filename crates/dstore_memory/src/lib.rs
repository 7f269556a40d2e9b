//! # dstore memory
//!
//! An in-memory reference backend. It keeps every committed state as an
//! immutable version built from persistent maps, maintains built-in and
//! declared composite indexes, plans each query onto a single index scan,
//! and runs optimistic snapshot transactions with per-entity-group
//! conflict detection.
//!
//! ## Example
//!
//! ```rust
//! use dstore_memory::{MemStore, MemoryConfig};
//! use dstore_model::{PropertyMap, Query};
//! use dstore_raw::datastore;
//!
//! let store = MemStore::new(MemoryConfig::new().auto_index(true));
//! let ctx = store.context();
//! let key = datastore::new_key(&ctx, "Item", 1);
//! datastore::put(&ctx, &key, PropertyMap::new().with("a", 1).with("b", 2)).unwrap();
//!
//! let q = Query::new("Item").eq("a", 1).order("-b").finalize().unwrap();
//! assert_eq!(datastore::count(&ctx, &q).unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod exec;
mod planner;
mod pmap;
mod rows;
mod store;
mod txn;
mod version;

pub use config::MemoryConfig;
pub use planner::{Plan, ScanSource};
pub use store::MemStore;
pub use txn::MAX_CROSS_GROUP_ENTITY_GROUPS;
pub use version::SequenceNumber;
