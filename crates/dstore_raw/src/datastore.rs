//! Application-facing calls over a [`Context`].
//!
//! These resolve the layered store from the context and turn the
//! callback-based raw contract into plain return values. Multi-key calls
//! always return one result per input; positions the store never reported
//! carry the error the call as a whole failed with.

use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::raw::{QueryItem, TransactionOptions};
use dstore_model::{FinalizedQuery, Key, KeyId, PropertyMap};
use std::ops::ControlFlow;
use tracing::{debug, warn};

fn fill<T>(n: usize, slots: Vec<Option<StoreResult<T>>>, outcome: StoreResult<()>) -> Vec<StoreResult<T>> {
    let missing = match outcome {
        Ok(()) => StoreError::other("backend did not report a result"),
        Err(err) => err,
    };
    debug_assert_eq!(slots.len(), n);
    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(missing.clone())))
        .collect()
}

fn empty_slots<T>(n: usize) -> Vec<Option<StoreResult<T>>> {
    std::iter::repeat_with(|| None).take(n).collect()
}

/// Creates a key in the context's key context.
#[must_use]
pub fn new_key(ctx: &Context, kind: &str, id: impl Into<KeyId>) -> Key {
    ctx.key_context().key(kind, id)
}

/// Completes incomplete keys with backend-assigned ids.
pub fn allocate_ids(ctx: &Context, keys: &[Key]) -> Vec<StoreResult<Key>> {
    let mut slots = empty_slots(keys.len());
    let outcome = ctx
        .raw()
        .and_then(|raw| raw.allocate_ids(keys, &mut |i, r| slots[i] = Some(r)));
    fill(keys.len(), slots, outcome)
}

/// Loads several entities.
pub fn get_multi(ctx: &Context, keys: &[Key]) -> Vec<StoreResult<PropertyMap>> {
    let mut slots = empty_slots(keys.len());
    let outcome = ctx
        .raw()
        .and_then(|raw| raw.get_multi(keys, None, &mut |i, r| slots[i] = Some(r)));
    fill(keys.len(), slots, outcome)
}

/// Stores several entities, returning their final keys.
pub fn put_multi(ctx: &Context, keys: &[Key], values: &[PropertyMap]) -> Vec<StoreResult<Key>> {
    let mut slots = empty_slots(keys.len());
    let outcome = ctx
        .raw()
        .and_then(|raw| raw.put_multi(keys, values, &mut |i, r| slots[i] = Some(r)));
    fill(keys.len(), slots, outcome)
}

/// Deletes several entities.
pub fn delete_multi(ctx: &Context, keys: &[Key]) -> Vec<StoreResult<()>> {
    let mut slots = empty_slots(keys.len());
    let outcome = ctx
        .raw()
        .and_then(|raw| raw.delete_multi(keys, &mut |i, r| slots[i] = Some(r)));
    fill(keys.len(), slots, outcome)
}

fn single<T>(mut results: Vec<StoreResult<T>>) -> StoreResult<T> {
    results
        .pop()
        .unwrap_or_else(|| Err(StoreError::other("backend did not report a result")))
}

/// Loads one entity.
///
/// # Errors
///
/// Returns [`StoreError::NoSuchEntity`] if it does not exist.
pub fn get(ctx: &Context, key: &Key) -> StoreResult<PropertyMap> {
    single(get_multi(ctx, std::slice::from_ref(key)))
}

/// Stores one entity, returning its final key.
///
/// # Errors
///
/// Returns the backend's error for this entity.
pub fn put(ctx: &Context, key: &Key, value: PropertyMap) -> StoreResult<Key> {
    single(put_multi(ctx, std::slice::from_ref(key), &[value]))
}

/// Deletes one entity.
///
/// # Errors
///
/// Returns the backend's error for this entity.
pub fn delete(ctx: &Context, key: &Key) -> StoreResult<()> {
    single(delete_multi(ctx, std::slice::from_ref(key)))
}

/// Runs a query, invoking `cb` for each record until it returns `Break`.
///
/// # Errors
///
/// Returns the first error from the store or from `cb`.
pub fn run<F>(ctx: &Context, query: &FinalizedQuery, mut cb: F) -> StoreResult<()>
where
    F: FnMut(QueryItem) -> StoreResult<ControlFlow<()>>,
{
    ctx.raw()?.run(query, &mut cb)
}

/// Runs a query and collects every record.
///
/// # Errors
///
/// Returns the first error from the store.
pub fn get_all(ctx: &Context, query: &FinalizedQuery) -> StoreResult<Vec<(Key, PropertyMap)>> {
    let mut out = Vec::new();
    run(ctx, query, |item| {
        out.push((item.key, item.value));
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(out)
}

/// Counts the records of a query.
///
/// # Errors
///
/// Returns the store's error.
pub fn count(ctx: &Context, query: &FinalizedQuery) -> StoreResult<u64> {
    ctx.raw()?.count(query)
}

/// Runs `body` in a transaction, retrying on conflicts.
///
/// Only [`StoreError::ConcurrentTransaction`] is retried, up to
/// `opts.attempts` attempts in total. Every other error is returned as is.
///
/// # Errors
///
/// Returns the body's error, or the last conflict once attempts run out.
pub fn run_in_transaction<F>(ctx: &Context, opts: &TransactionOptions, mut body: F) -> StoreResult<()>
where
    F: FnMut(&Context) -> StoreResult<()>,
{
    let raw = ctx.raw()?;
    let mut attempt = 1;
    loop {
        match raw.run_in_transaction(&mut body, opts) {
            Err(err) if err.is_concurrent_transaction() => {
                if attempt >= opts.attempts {
                    warn!("transaction conflicted on all {} attempts", opts.attempts);
                    return Err(err);
                }
                debug!("transaction attempt {} conflicted, retrying", attempt);
                attempt += 1;
            }
            other => return other,
        }
    }
}
