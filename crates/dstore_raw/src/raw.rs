//! The raw storage contract.
//!
//! Every backend and every filter implements [`RawStore`]. All batch
//! operations are positional: the callback is invoked once per input index
//! with that element's result, and the returned error is reserved for
//! failures of the request as a whole.

use crate::context::Context;
use crate::error::StoreResult;
use dstore_model::{Cursor, FinalizedQuery, Key, PropertyMap};
use std::ops::ControlFlow;

/// Per-element callback for `get_multi`.
pub type GetCb<'a> = dyn FnMut(usize, StoreResult<PropertyMap>) + Send + 'a;

/// Per-element callback for operations producing keys.
pub type NewKeyCb<'a> = dyn FnMut(usize, StoreResult<Key>) + Send + 'a;

/// Per-element callback for `delete_multi`.
pub type DeleteCb<'a> = dyn FnMut(usize, StoreResult<()>) + Send + 'a;

/// Per-record callback for `run`. Returning `Break` stops iteration
/// without error.
pub type RunCb<'a> = dyn FnMut(QueryItem) -> StoreResult<ControlFlow<()>> + 'a;

/// A transaction body. It receives the transactional context and may be
/// invoked more than once by retrying callers.
pub type TxnBody<'a> = dyn FnMut(&Context) -> StoreResult<()> + 'a;

/// One record delivered by `run`.
#[derive(Debug, Clone)]
pub struct QueryItem {
    /// The entity key.
    pub key: Key,
    /// The entity, the projected properties, or empty for keys-only queries.
    pub value: PropertyMap,
    cursor: Cursor,
}

impl QueryItem {
    /// Creates a query item positioned at `cursor`.
    #[must_use]
    pub fn new(key: Key, value: PropertyMap, cursor: Cursor) -> Self {
        Self { key, value, cursor }
    }

    /// Returns a cursor positioned just after this record.
    #[must_use]
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }
}

/// Static backend limits. Zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Maximum keys per `get_multi` call.
    pub max_get_size: usize,
    /// Maximum keys per `put_multi` or `allocate_ids` call.
    pub max_put_size: usize,
    /// Maximum keys per `delete_multi` call.
    pub max_delete_size: usize,
    /// Records fetched per underlying `run` call.
    pub query_batch_size: u32,
}

/// Options for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Attempts made by retrying callers. The raw contract never retries.
    pub attempts: u32,
    /// Reject writes inside the transaction.
    pub read_only: bool,
    /// Allow touching more than one entity group.
    pub cross_group: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            read_only: false,
            cross_group: false,
        }
    }
}

impl TransactionOptions {
    /// Sets the number of attempts.
    #[must_use]
    pub const fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Makes the transaction read-only.
    #[must_use]
    pub const fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Allows the transaction to span entity groups.
    #[must_use]
    pub const fn cross_group(mut self, cross_group: bool) -> Self {
        self.cross_group = cross_group;
        self
    }
}

/// The operation set every backend and filter implements.
///
/// Implementations are shared across threads. Batch callbacks may be
/// invoked from several threads, but never concurrently.
pub trait RawStore: Send + Sync {
    /// Completes incomplete template keys with backend-assigned ids.
    fn allocate_ids(&self, keys: &[Key], cb: &mut NewKeyCb<'_>) -> StoreResult<()>;

    /// Loads entities. Missing entities are reported per element as
    /// `NoSuchEntity`. `meta` is optional backend metadata parallel to `keys`.
    fn get_multi(
        &self,
        keys: &[Key],
        meta: Option<&[PropertyMap]>,
        cb: &mut GetCb<'_>,
    ) -> StoreResult<()>;

    /// Stores entities, reporting the (possibly newly assigned) key of each.
    fn put_multi(
        &self,
        keys: &[Key],
        values: &[PropertyMap],
        cb: &mut NewKeyCb<'_>,
    ) -> StoreResult<()>;

    /// Deletes entities. Deleting a missing entity succeeds.
    fn delete_multi(&self, keys: &[Key], cb: &mut DeleteCb<'_>) -> StoreResult<()>;

    /// Runs a query, delivering records in query order.
    fn run(&self, query: &FinalizedQuery, cb: &mut RunCb<'_>) -> StoreResult<()>;

    /// Counts the records a query would deliver.
    fn count(&self, query: &FinalizedQuery) -> StoreResult<u64>;

    /// Runs `body` in a transaction. Conflicts surface as
    /// `ConcurrentTransaction`; the body is not retried.
    fn run_in_transaction(&self, body: &mut TxnBody<'_>, opts: &TransactionOptions)
        -> StoreResult<()>;

    /// Returns the static backend limits.
    fn constraints(&self) -> Constraints;
}
