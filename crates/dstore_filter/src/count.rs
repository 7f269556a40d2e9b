//! Per-operation call counters.

use crate::featurebreaker::Feature;
use dstore_model::{FinalizedQuery, Key, PropertyMap};
use dstore_raw::{
    Constraints, Context, DeleteCb, GetCb, NewKeyCb, RawStore, RunCb, StoreResult,
    TransactionOptions, TxnBody,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Success and error counts for one operation.
#[derive(Debug, Default)]
pub struct Entry {
    successes: AtomicU64,
    errors: AtomicU64,
}

impl Entry {
    /// Number of calls that returned `Ok`.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Number of calls that returned an error.
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Total number of calls.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.successes() + self.errors()
    }

    fn record<T>(&self, res: StoreResult<T>) -> StoreResult<T> {
        let counter = if res.is_ok() {
            &self.successes
        } else {
            &self.errors
        };
        counter.fetch_add(1, Ordering::Relaxed);
        res
    }
}

/// Counters for every raw operation.
#[derive(Debug, Default)]
pub struct DsCounter {
    /// `allocate_ids` calls.
    pub allocate_ids: Entry,
    /// `get_multi` calls.
    pub get_multi: Entry,
    /// `put_multi` calls.
    pub put_multi: Entry,
    /// `delete_multi` calls.
    pub delete_multi: Entry,
    /// `run` calls.
    pub run: Entry,
    /// `count` calls.
    pub count: Entry,
    /// `run_in_transaction` calls.
    pub run_in_transaction: Entry,
}

impl DsCounter {
    /// Returns the counter for `feature`. Commits are counted with
    /// transactions.
    #[must_use]
    pub fn entry(&self, feature: Feature) -> &Entry {
        match feature {
            Feature::AllocateIds => &self.allocate_ids,
            Feature::GetMulti => &self.get_multi,
            Feature::PutMulti => &self.put_multi,
            Feature::DeleteMulti => &self.delete_multi,
            Feature::Run => &self.run,
            Feature::Count => &self.count,
            Feature::BeginTransaction | Feature::CommitTransaction => &self.run_in_transaction,
        }
    }
}

impl fmt::Display for DsCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows = [
            ("AllocateIDs", &self.allocate_ids),
            ("GetMulti", &self.get_multi),
            ("PutMulti", &self.put_multi),
            ("DeleteMulti", &self.delete_multi),
            ("Run", &self.run),
            ("Count", &self.count),
            ("RunInTransaction", &self.run_in_transaction),
        ];
        for (name, entry) in rows {
            writeln!(f, "{name}: {} ok, {} err", entry.successes(), entry.errors())?;
        }
        Ok(())
    }
}

/// Installs a counting filter into `ctx`.
///
/// Counts are taken below batching, so one split call counts once per group.
#[must_use]
pub fn filter_rds(ctx: &Context) -> (Context, Arc<DsCounter>) {
    let counter = Arc::new(DsCounter::default());
    let shared = Arc::clone(&counter);
    let ctx = ctx.with_filter(move |_: &Context, inner: Arc<dyn RawStore>| {
        let store: Arc<dyn RawStore> = Arc::new(CountingStore {
            inner,
            counter: Arc::clone(&shared),
        });
        store
    });
    (ctx, counter)
}

struct CountingStore {
    inner: Arc<dyn RawStore>,
    counter: Arc<DsCounter>,
}

impl RawStore for CountingStore {
    fn allocate_ids(&self, keys: &[Key], cb: &mut NewKeyCb<'_>) -> StoreResult<()> {
        self.counter.allocate_ids.record(self.inner.allocate_ids(keys, cb))
    }

    fn get_multi(
        &self,
        keys: &[Key],
        meta: Option<&[PropertyMap]>,
        cb: &mut GetCb<'_>,
    ) -> StoreResult<()> {
        self.counter.get_multi.record(self.inner.get_multi(keys, meta, cb))
    }

    fn put_multi(
        &self,
        keys: &[Key],
        values: &[PropertyMap],
        cb: &mut NewKeyCb<'_>,
    ) -> StoreResult<()> {
        self.counter.put_multi.record(self.inner.put_multi(keys, values, cb))
    }

    fn delete_multi(&self, keys: &[Key], cb: &mut DeleteCb<'_>) -> StoreResult<()> {
        self.counter.delete_multi.record(self.inner.delete_multi(keys, cb))
    }

    fn run(&self, query: &FinalizedQuery, cb: &mut RunCb<'_>) -> StoreResult<()> {
        self.counter.run.record(self.inner.run(query, cb))
    }

    fn count(&self, query: &FinalizedQuery) -> StoreResult<u64> {
        self.counter.count.record(self.inner.count(query))
    }

    fn run_in_transaction(
        &self,
        body: &mut TxnBody<'_>,
        opts: &TransactionOptions,
    ) -> StoreResult<()> {
        self.counter
            .run_in_transaction
            .record(self.inner.run_in_transaction(body, opts))
    }

    fn constraints(&self) -> Constraints {
        self.inner.constraints()
    }
}
