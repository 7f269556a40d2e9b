//! Callbacks that run once a transaction has committed.
//!
//! Install [`filter`] and call [`defer`] from inside a transaction body.
//! After a successful commit the callbacks run one after another, newest
//! first, with the non-transactional view of the transaction's context. A
//! failed transaction runs none of them, and when the body is re-run only
//! the callbacks registered by the final run survive.

use dstore_model::{FinalizedQuery, Key, PropertyMap};
use dstore_raw::{
    Constraints, Context, DeleteCb, GetCb, NewKeyCb, RawStore, RunCb, StoreError, StoreResult,
    TransactionOptions, TxnBody,
};
use parking_lot::Mutex;
use std::sync::Arc;

type DeferredCb = Box<dyn FnOnce(&Context) + Send>;

#[derive(Default)]
struct TxnState {
    cbs: Mutex<Vec<DeferredCb>>,
}

impl TxnState {
    fn reset(&self) {
        self.cbs.lock().clear();
    }

    fn push(&self, cb: DeferredCb) {
        self.cbs.lock().push(cb);
    }

    fn exec(&self, ctx: &Context) {
        let cbs = std::mem::take(&mut *self.cbs.lock());
        for cb in cbs.into_iter().rev() {
            cb(ctx);
        }
    }
}

#[derive(Clone)]
struct DeferHandle(Arc<TxnState>);

/// Returns the filter that enables [`defer`].
pub fn filter() -> impl Fn(&Context, Arc<dyn RawStore>) -> Arc<dyn RawStore> + Send + Sync + 'static
{
    |_: &Context, inner: Arc<dyn RawStore>| {
        let store: Arc<dyn RawStore> = Arc::new(DeferStore { inner });
        store
    }
}

/// Schedules `cb` to run after the current transaction commits.
///
/// # Errors
///
/// Returns a usage error outside a transaction or when [`filter`] is not
/// installed.
pub fn defer<F>(ctx: &Context, cb: F) -> StoreResult<()>
where
    F: FnOnce(&Context) + Send + 'static,
{
    if !ctx.in_transaction() {
        return Err(StoreError::usage("defer called outside of a transaction"));
    }
    let handle = ctx
        .value::<DeferHandle>()
        .ok_or_else(|| StoreError::usage("defer called without the txndefer filter installed"))?;
    handle.0.push(Box::new(cb));
    Ok(())
}

struct DeferStore {
    inner: Arc<dyn RawStore>,
}

impl RawStore for DeferStore {
    fn allocate_ids(&self, keys: &[Key], cb: &mut NewKeyCb<'_>) -> StoreResult<()> {
        self.inner.allocate_ids(keys, cb)
    }

    fn get_multi(
        &self,
        keys: &[Key],
        meta: Option<&[PropertyMap]>,
        cb: &mut GetCb<'_>,
    ) -> StoreResult<()> {
        self.inner.get_multi(keys, meta, cb)
    }

    fn put_multi(
        &self,
        keys: &[Key],
        values: &[PropertyMap],
        cb: &mut NewKeyCb<'_>,
    ) -> StoreResult<()> {
        self.inner.put_multi(keys, values, cb)
    }

    fn delete_multi(&self, keys: &[Key], cb: &mut DeleteCb<'_>) -> StoreResult<()> {
        self.inner.delete_multi(keys, cb)
    }

    fn run(&self, query: &FinalizedQuery, cb: &mut RunCb<'_>) -> StoreResult<()> {
        self.inner.run(query, cb)
    }

    fn count(&self, query: &FinalizedQuery) -> StoreResult<u64> {
        self.inner.count(query)
    }

    fn run_in_transaction(
        &self,
        body: &mut TxnBody<'_>,
        opts: &TransactionOptions,
    ) -> StoreResult<()> {
        let state = Arc::new(TxnState::default());
        let mut no_txn_ctx: Option<Context> = None;
        self.inner.run_in_transaction(
            &mut |txn_ctx| {
                no_txn_ctx = Some(txn_ctx.without_transaction());
                state.reset();
                body(&txn_ctx.with_value(DeferHandle(Arc::clone(&state))))
            },
            opts,
        )?;
        if let Some(ctx) = no_txn_ctx {
            state.exec(&ctx);
        }
        Ok(())
    }

    fn constraints(&self) -> Constraints {
        self.inner.constraints()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstore_memory::{MemStore, MemoryConfig};
    use dstore_raw::datastore;

    fn ctx() -> Context {
        MemStore::new(MemoryConfig::new()).context().with_filter(filter())
    }

    #[test]
    fn callbacks_run_in_reverse_after_commit() {
        let ctx = ctx();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tctx| {
            let (o1, o2) = (o1.clone(), o2.clone());
            defer(tctx, move |c| {
                assert!(!c.in_transaction());
                o1.lock().push(1);
            })?;
            defer(tctx, move |c| {
                assert!(!c.in_transaction());
                o2.lock().push(2);
            })
        })
        .unwrap();
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[test]
    fn failed_transaction_runs_nothing() {
        let ctx = ctx();
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();
        let err = datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tctx| {
            let flag = flag.clone();
            defer(tctx, move |_| *flag.lock() = true)?;
            Err(StoreError::other("boom"))
        })
        .unwrap_err();
        assert_eq!(err, StoreError::other("boom"));
        assert!(!*called.lock());
    }

    #[test]
    fn only_final_attempt_callbacks_run() {
        let ctx = ctx();
        let calls = Arc::new(Mutex::new(0));
        let mut attempt = 0;
        let counter = calls.clone();
        datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tctx| {
            attempt += 1;
            let counter = counter.clone();
            defer(tctx, move |_| *counter.lock() += 1)?;
            if attempt < 3 {
                return Err(StoreError::ConcurrentTransaction);
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(attempt, 3);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn defer_outside_transaction_is_usage_error() {
        let ctx = ctx();
        assert!(defer(&ctx, |_| {}).unwrap_err().is_usage());
    }

    #[test]
    fn defer_without_filter_is_usage_error() {
        let ctx = MemStore::new(MemoryConfig::new()).context();
        let err = datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tctx| {
            defer(tctx, |_| {})
        })
        .unwrap_err();
        assert!(err.is_usage());
    }
}
