//! # dstore Testkit
//!
//! Test utilities for dstore.
//!
//! This crate provides:
//! - Fixtures wrapping an in-memory store and its context
//! - Property-based test generators using proptest
//! - Concurrent transaction stress helpers
//!
//! ## Usage
//!
//! ```rust
//! use dstore_testkit::prelude::*;
//! use dstore_raw::datastore;
//!
//! with_store(|ts| {
//!     let key = ts.key("Item", 1);
//!     ts.put(&key, scenarios::item(1));
//!     assert!(datastore::get(ts, &key).is_ok());
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
