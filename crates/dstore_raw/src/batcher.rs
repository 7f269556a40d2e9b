//! Batching layer.
//!
//! Queries are re-issued in bounded sub-batches, each resuming from the
//! cursor of the last record of the previous one. Multi-key operations are
//! split into groups no larger than the backend allows and the groups run
//! concurrently on scoped worker threads.
//!
//! Batching is controlled per context with [`with_batching`],
//! [`with_query_batch_size`] and [`with_query_batch_callback`].

use crate::context::Context;
use crate::error::{StoreError, StoreResult};
use crate::raw::{Constraints, DeleteCb, GetCb, NewKeyCb, RawStore, RunCb, TransactionOptions, TxnBody};
use dstore_model::{Cursor, FinalizedQuery, Key, PropertyMap};
use parking_lot::Mutex;
use std::ops::{ControlFlow, Range};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Upper bound on concurrently running groups of one operation.
pub const MAX_BATCH_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Batching(bool);

#[derive(Debug, Clone, Copy)]
struct QueryBatchSize(u32);

/// Invoked between query sub-batches.
pub type QueryBatchCallback = Arc<dyn Fn(&Context) -> StoreResult<()> + Send + Sync>;

#[derive(Clone)]
struct BatchCallback(QueryBatchCallback);

/// Explicitly enables or disables batching.
///
/// Explicitly enabling batching also batches projection queries, which are
/// otherwise run in one piece. Disabling it makes oversized multi-key calls
/// fail with [`StoreError::BatchTooLarge`].
#[must_use]
pub fn with_batching(ctx: &Context, enabled: bool) -> Context {
    ctx.with_value(Batching(enabled))
}

/// Overrides the backend's query batch size. Zero disables query batching.
#[must_use]
pub fn with_query_batch_size(ctx: &Context, size: u32) -> Context {
    ctx.with_value(QueryBatchSize(size))
}

/// Installs a callback run between query sub-batches.
///
/// An error from the callback aborts the query and is returned from `run`.
#[must_use]
pub fn with_query_batch_callback<F>(ctx: &Context, cb: F) -> Context
where
    F: Fn(&Context) -> StoreResult<()> + Send + Sync + 'static,
{
    ctx.with_value(BatchCallback(Arc::new(cb)))
}

/// Splits queries and multi-key operations into bounded batches.
pub struct BatchFilter {
    ctx: Context,
    inner: Arc<dyn RawStore>,
}

impl BatchFilter {
    /// Wraps `inner` using the batching settings of `ctx`.
    #[must_use]
    pub fn new(ctx: Context, inner: Arc<dyn RawStore>) -> Self {
        Self { ctx, inner }
    }

    fn batching(&self) -> Option<bool> {
        self.ctx.value::<Batching>().map(|b| b.0)
    }

    fn query_batch_size(&self, query: &FinalizedQuery) -> u32 {
        if query.is_projection() && self.batching() != Some(true) {
            return 0;
        }
        if self.batching() == Some(false) {
            return 0;
        }
        self.ctx
            .value::<QueryBatchSize>()
            .map_or_else(|| self.inner.constraints().query_batch_size, |s| s.0)
    }

    /// Runs `op` over `n` elements in groups of at most `max`.
    ///
    /// Group results are reported through `cb` at their original indices.
    /// The first group error is returned; groups already running finish,
    /// but no new group starts after it.
    fn fan_out<T: Send>(
        &self,
        n: usize,
        max: usize,
        cb: &mut (dyn FnMut(usize, StoreResult<T>) + Send + '_),
        op: impl Fn(Range<usize>, &mut (dyn FnMut(usize, StoreResult<T>) + Send)) -> StoreResult<()>
            + Sync,
    ) -> StoreResult<()> {
        if n == 0 {
            return Ok(());
        }
        if max == 0 || n <= max {
            return op(0..n, cb);
        }
        if self.batching() == Some(false) {
            return Err(StoreError::BatchTooLarge { size: n, max });
        }

        let groups = n.div_ceil(max);
        let workers = groups.min(MAX_BATCH_WORKERS);
        debug!("splitting {} keys into {} groups of {}", n, groups, max);

        let shared = Mutex::new(cb);
        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let first_err: Mutex<Option<StoreError>> = Mutex::new(None);

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| loop {
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    let group = next.fetch_add(1, Ordering::AcqRel);
                    if group >= groups {
                        break;
                    }
                    let start = group * max;
                    let end = (start + max).min(n);
                    let res = op(start..end, &mut |i, r| {
                        let mut guard = shared.lock();
                        let cb = &mut **guard;
                        cb(start + i, r);
                    });
                    if let Err(err) = res {
                        first_err.lock().get_or_insert(err);
                        stop.store(true, Ordering::Release);
                    }
                });
            }
        });

        match first_err.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl RawStore for BatchFilter {
    fn allocate_ids(&self, keys: &[Key], cb: &mut NewKeyCb<'_>) -> StoreResult<()> {
        let max = self.inner.constraints().max_put_size;
        self.fan_out(keys.len(), max, cb, |r, cb| {
            self.inner.allocate_ids(&keys[r], cb)
        })
    }

    fn get_multi(
        &self,
        keys: &[Key],
        meta: Option<&[PropertyMap]>,
        cb: &mut GetCb<'_>,
    ) -> StoreResult<()> {
        let max = self.inner.constraints().max_get_size;
        self.fan_out(keys.len(), max, cb, |r, cb| {
            let meta = meta.map(|m| &m[r.clone()]);
            self.inner.get_multi(&keys[r], meta, cb)
        })
    }

    fn put_multi(
        &self,
        keys: &[Key],
        values: &[PropertyMap],
        cb: &mut NewKeyCb<'_>,
    ) -> StoreResult<()> {
        let max = self.inner.constraints().max_put_size;
        self.fan_out(keys.len(), max, cb, |r, cb| {
            self.inner.put_multi(&keys[r.clone()], &values[r], cb)
        })
    }

    fn delete_multi(&self, keys: &[Key], cb: &mut DeleteCb<'_>) -> StoreResult<()> {
        let max = self.inner.constraints().max_delete_size;
        self.fan_out(keys.len(), max, cb, |r, cb| {
            self.inner.delete_multi(&keys[r], cb)
        })
    }

    fn run(&self, query: &FinalizedQuery, cb: &mut RunCb<'_>) -> StoreResult<()> {
        let batch_size = self.query_batch_size(query);
        if batch_size == 0 {
            return self.inner.run(query, cb);
        }

        let mut remaining = query.limit();
        let mut next_start: Option<Cursor> = query.start().cloned();
        let mut first = true;
        loop {
            let size = match remaining {
                Some(0) => return Ok(()),
                Some(left) => left.min(batch_size),
                None => batch_size,
            };
            let mut sub = query.with_limit(Some(size)).with_start(next_start.take())?;
            if !first {
                sub = sub.with_offset(None);
            }
            first = false;

            let mut count = 0u32;
            let mut stopped = false;
            self.inner.run(&sub, &mut |item| {
                count += 1;
                if count == size {
                    next_start = Some(item.cursor().clone());
                }
                let flow = cb(item)?;
                if flow.is_break() {
                    stopped = true;
                }
                Ok(flow)
            })?;

            if stopped || count < size {
                return Ok(());
            }
            if let Some(left) = remaining.as_mut() {
                *left -= count;
                if *left == 0 {
                    return Ok(());
                }
            }
            debug!("query batch of {} done, resuming", count);
            if let Some(BatchCallback(batch_cb)) = self.ctx.value::<BatchCallback>() {
                batch_cb(&self.ctx)?;
            }
        }
    }

    fn count(&self, query: &FinalizedQuery) -> StoreResult<u64> {
        self.inner.count(query)
    }

    fn run_in_transaction(
        &self,
        body: &mut TxnBody<'_>,
        opts: &TransactionOptions,
    ) -> StoreResult<()> {
        self.inner.run_in_transaction(body, opts)
    }

    fn constraints(&self) -> Constraints {
        self.inner.constraints()
    }
}
