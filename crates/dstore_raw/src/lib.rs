//! # dstore raw
//!
//! The raw storage contract every dstore backend implements, the
//! immutable [`Context`] storage calls run in, and the layers that are
//! always installed around a backend.
//!
//! ## Layering
//!
//! [`Context::raw`] resolves a store by calling the installed factory and
//! wrapping the result, innermost first:
//!
//! 1. user filters, in the order they were added
//! 2. [`BatchFilter`], which splits queries and multi-key calls
//! 3. [`CheckFilter`], which validates arguments
//!
//! Each layer owns the next one and forwards every operation it does not
//! change. Filters are re-applied each time a context resolves its store,
//! including the transactional context handed to a transaction body.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod batcher;
mod checkfilter;
mod context;
pub mod datastore;
mod dropped_args;
mod error;
mod raw;

pub use batcher::{with_batching, with_query_batch_callback, with_query_batch_size, BatchFilter};
pub use checkfilter::CheckFilter;
pub use context::{Context, ContextBuilder, RawFactory, RawFilter};
pub use dropped_args::{DroppedArgLookup, DroppedArgTracker};
pub use error::{StoreError, StoreResult};
pub use raw::{
    Constraints, DeleteCb, GetCb, NewKeyCb, QueryItem, RawStore, RunCb, TransactionOptions, TxnBody,
};
