//! # dstore model
//!
//! The data model shared by every dstore layer: entity keys, property
//! maps, index metadata, queries and cursors.
//!
//! Nothing in this crate touches storage. Queries are validated here, at
//! [`Query::finalize`], so malformed shapes are rejected before any backend
//! is involved.
//!
//! ## Example
//!
//! ```rust
//! use dstore_model::{KeyContext, Query};
//!
//! let ctx = KeyContext::new("app", "");
//! let parent = ctx.key("Author", 1);
//! let fq = Query::new("Book")
//!     .ancestor(parent)
//!     .eq("genre", "scifi")
//!     .gt("year", 1970)
//!     .order("-year")
//!     .finalize()
//!     .unwrap();
//! assert_eq!(fq.orders().len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod error;
mod index;
mod key;
mod property;
mod query;

pub use cursor::{compare_tuples, Cursor, Fingerprint};
pub use error::{ModelError, ModelResult};
pub use index::{IndexColumn, IndexDefinition};
pub use key::{Key, KeyContext, KeyId, KeyToken};
pub use property::{Property, PropertyMap, PropertyValue, KEY_PROPERTY};
pub use query::{Bound, FilterOp, FinalizedQuery, Query, Range};
