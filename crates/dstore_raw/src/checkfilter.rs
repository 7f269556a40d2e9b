//! Argument validation layer.
//!
//! Always the outermost layer of a resolved store. Rejects mismatched
//! parallel arguments outright, reports malformed keys per position and
//! forwards only the valid remainder.

use crate::dropped_args::DroppedArgTracker;
use crate::error::{StoreError, StoreResult};
use crate::raw::{Constraints, DeleteCb, GetCb, NewKeyCb, RawStore, RunCb, TransactionOptions, TxnBody};
use dstore_model::{FinalizedQuery, Key, PropertyMap};
use std::sync::Arc;

/// Validates arguments before they reach inner layers.
pub struct CheckFilter {
    inner: Arc<dyn RawStore>,
}

impl CheckFilter {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn RawStore>) -> Self {
        Self { inner }
    }

    fn check_ancestor(query: &FinalizedQuery) -> StoreResult<()> {
        match query.ancestor() {
            Some(anc) if !anc.is_valid(false) => Err(StoreError::InvalidKey(format!(
                "ancestor {anc} is incomplete or malformed"
            ))),
            _ => Ok(()),
        }
    }
}

fn mark_invalid<T>(
    keys: &[Key],
    allow_incomplete: bool,
    cb: &mut (dyn FnMut(usize, StoreResult<T>) + Send + '_),
) -> DroppedArgTracker {
    let mut tracker = DroppedArgTracker::new();
    for i in tracker.mark_invalid_keys(keys, allow_incomplete) {
        cb(i, Err(StoreError::InvalidKey(keys[i].to_string())));
    }
    tracker
}

impl RawStore for CheckFilter {
    fn allocate_ids(&self, keys: &[Key], cb: &mut NewKeyCb<'_>) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut tracker = mark_invalid(keys, true, cb);
        for (i, key) in keys.iter().enumerate() {
            if !key.is_incomplete() && !tracker.is_dropped(i) {
                tracker.mark_for_removal(i, keys.len());
                cb(i, Err(StoreError::InvalidKey(format!("{key} is already complete"))));
            }
        }
        if tracker.len() == keys.len() {
            return Ok(());
        }
        let (keys, lookup) = tracker.drop_keys(keys);
        self.inner
            .allocate_ids(&keys, &mut |i, r| cb(lookup.original_index(i), r))
    }

    fn get_multi(
        &self,
        keys: &[Key],
        meta: Option<&[PropertyMap]>,
        cb: &mut GetCb<'_>,
    ) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if let Some(meta) = meta {
            if meta.len() != keys.len() {
                return Err(StoreError::usage(format!(
                    "get_multi: {} keys but {} meta entries",
                    keys.len(),
                    meta.len()
                )));
            }
        }
        let tracker = mark_invalid(keys, false, cb);
        if tracker.len() == keys.len() {
            return Ok(());
        }
        match meta {
            None => {
                let (keys, lookup) = tracker.drop_keys(keys);
                self.inner
                    .get_multi(&keys, None, &mut |i, r| cb(lookup.original_index(i), r))
            }
            Some(meta) => {
                let (keys, meta, lookup) = tracker.drop_keys_and_meta(keys, meta);
                self.inner
                    .get_multi(&keys, Some(&*meta), &mut |i, r| cb(lookup.original_index(i), r))
            }
        }
    }

    fn put_multi(
        &self,
        keys: &[Key],
        values: &[PropertyMap],
        cb: &mut NewKeyCb<'_>,
    ) -> StoreResult<()> {
        if keys.len() != values.len() {
            return Err(StoreError::usage(format!(
                "put_multi: {} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        if keys.is_empty() {
            return Ok(());
        }
        let tracker = mark_invalid(keys, true, cb);
        if tracker.len() == keys.len() {
            return Ok(());
        }
        let (keys, values, lookup) = tracker.drop_keys_and_values(keys, values);
        self.inner
            .put_multi(&keys, &values, &mut |i, r| cb(lookup.original_index(i), r))
    }

    fn delete_multi(&self, keys: &[Key], cb: &mut DeleteCb<'_>) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let tracker = mark_invalid(keys, false, cb);
        if tracker.len() == keys.len() {
            return Ok(());
        }
        let (keys, lookup) = tracker.drop_keys(keys);
        self.inner
            .delete_multi(&keys, &mut |i, r| cb(lookup.original_index(i), r))
    }

    fn run(&self, query: &FinalizedQuery, cb: &mut RunCb<'_>) -> StoreResult<()> {
        Self::check_ancestor(query)?;
        self.inner.run(query, cb)
    }

    fn count(&self, query: &FinalizedQuery) -> StoreResult<u64> {
        Self::check_ancestor(query)?;
        self.inner.count(query)
    }

    fn run_in_transaction(
        &self,
        body: &mut TxnBody<'_>,
        opts: &TransactionOptions,
    ) -> StoreResult<()> {
        if opts.attempts == 0 {
            return Err(StoreError::usage("transaction attempts must be at least 1"));
        }
        self.inner.run_in_transaction(body, opts)
    }

    fn constraints(&self) -> Constraints {
        self.inner.constraints()
    }
}
