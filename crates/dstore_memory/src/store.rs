//! The in-memory store and its raw view.

use crate::config::MemoryConfig;
use crate::exec;
use crate::planner::{self, Plan};
use crate::txn::{MemTxn, Write};
use crate::version::{SequenceNumber, Version};
use dstore_model::{FinalizedQuery, IndexDefinition, Key, PropertyMap};
use dstore_raw::{
    Constraints, Context, ContextBuilder, DeleteCb, GetCb, NewKeyCb, RawStore, RunCb, StoreError,
    StoreResult, TransactionOptions, TxnBody,
};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// An in-memory datastore.
///
/// State is a chain of immutable versions. Readers take the current
/// head and never block writers; commits are serialized by a single write
/// lock and publish a new head.
pub struct MemStore {
    /// Distinguishes transactions of different stores.
    id: u64,
    /// Settings fixed at creation.
    config: MemoryConfig,
    /// Latest committed version.
    head: RwLock<Arc<Version>>,
    /// Version global queries read when not consistent.
    index_view: RwLock<Arc<Version>>,
    /// Write lock - one commit at a time.
    write_lock: Mutex<()>,
    /// Next allocated entity id.
    next_id: AtomicI64,
    consistent: AtomicBool,
    auto_index: AtomicBool,
}

impl MemStore {
    /// Creates a store from `config`.
    ///
    /// Invalid composite definitions in the config are skipped with a
    /// warning.
    #[must_use]
    pub fn new(config: MemoryConfig) -> Arc<Self> {
        let mut version = Version::default();
        for def in &config.indexes {
            match def.validate() {
                Ok(()) => version.add_index(def),
                Err(err) => warn!("skipping index {}: {}", def, err),
            }
        }
        let version = Arc::new(version);
        Arc::new(Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            consistent: AtomicBool::new(config.consistent),
            auto_index: AtomicBool::new(config.auto_index),
            config,
            head: RwLock::new(Arc::clone(&version)),
            index_view: RwLock::new(version),
            write_lock: Mutex::new(()),
            next_id: AtomicI64::new(1),
        })
    }

    /// Returns a context bound to this store.
    #[must_use]
    pub fn context(self: &Arc<Self>) -> Context {
        self.context_builder().build()
    }

    /// Returns a context builder bound to this store, for adding filters.
    #[must_use]
    pub fn context_builder(self: &Arc<Self>) -> ContextBuilder {
        let store = Arc::clone(self);
        Context::builder(move |ctx: &Context| {
            let txn = ctx.transaction_as::<MemTxn>()?;
            if txn.as_ref().is_some_and(|t| t.store_id() != store.id) {
                return Err(StoreError::usage("transaction belongs to a different store"));
            }
            let view: Arc<dyn RawStore> = Arc::new(MemView {
                store: Arc::clone(&store),
                ctx: ctx.clone(),
                txn,
            });
            Ok(view)
        })
        .key_context(self.config.key_context.clone())
    }

    /// Returns the configuration the store was created with.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Declares composite indexes, filling them from existing entities.
    ///
    /// # Errors
    ///
    /// Returns an error if any definition is invalid; nothing is declared
    /// in that case.
    pub fn add_indexes(&self, defs: &[IndexDefinition]) -> StoreResult<()> {
        for def in defs {
            def.validate()?;
        }
        let _guard = self.write_lock.lock();
        for view in [&self.head, &self.index_view] {
            let mut version = (**view.read()).clone();
            for def in defs {
                version.add_index(def);
            }
            *view.write() = Arc::new(version);
        }
        debug!("declared {} indexes", defs.len());
        Ok(())
    }

    /// Returns the declared composite indexes.
    #[must_use]
    pub fn composite_indexes(&self) -> Vec<IndexDefinition> {
        self.head().composites.iter().cloned().collect()
    }

    /// Brings the index view global queries read up to the latest commit.
    pub fn catchup_indexes(&self) {
        let _guard = self.write_lock.lock();
        *self.index_view.write() = self.head();
    }

    /// Makes global queries strongly consistent or not.
    pub fn set_consistent(&self, consistent: bool) {
        self.consistent.store(consistent, Ordering::SeqCst);
        if consistent {
            self.catchup_indexes();
        }
    }

    /// Enables or disables declaring missing indexes on demand.
    pub fn set_auto_index(&self, auto_index: bool) {
        self.auto_index.store(auto_index, Ordering::SeqCst);
    }

    /// Returns the plan `fq` would use right now.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingIndex`] if no index fits.
    pub fn explain(&self, fq: &FinalizedQuery) -> StoreResult<Plan> {
        planner::plan(fq, &self.head())
    }

    /// Returns the sequence number of the latest commit.
    #[must_use]
    pub fn seq(&self) -> SequenceNumber {
        self.head().seq
    }

    /// Returns the number of stored entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.head().entities.len()
    }

    /// Returns true if no entity is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn head(&self) -> Arc<Version> {
        Arc::clone(&self.head.read())
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn complete(&self, key: &Key) -> Key {
        if key.is_incomplete() {
            key.with_id(self.allocate_id())
        } else {
            key.clone()
        }
    }

    /// The version a non-transactional query reads.
    fn read_version(&self, fq: &FinalizedQuery) -> Arc<Version> {
        let strong = (fq.ancestor().is_some() && !fq.eventual_consistency())
            || self.consistent.load(Ordering::SeqCst);
        if strong {
            self.head()
        } else {
            Arc::clone(&self.index_view.read())
        }
    }

    /// Plans `fq`, declaring a missing index first when auto-indexing.
    fn plan_for(&self, fq: &FinalizedQuery, version: &mut Arc<Version>) -> StoreResult<Plan> {
        match planner::plan(fq, version) {
            Err(StoreError::MissingIndex { suggested }) if self.auto_index.load(Ordering::SeqCst) => {
                debug!("auto-declaring index {}", suggested);
                self.add_indexes(std::slice::from_ref(&suggested))?;
                if !version.has_index(&suggested) {
                    Arc::make_mut(version).add_index(&suggested);
                }
                planner::plan(fq, version)
            }
            other => other,
        }
    }

    /// Publishes `writes` as a new version.
    ///
    /// With a `base`, fails if any of its entity groups was committed to
    /// after its snapshot.
    fn commit(
        &self,
        writes: &[Write],
        base: Option<(&Version, &BTreeSet<Key>)>,
    ) -> StoreResult<SequenceNumber> {
        let _guard = self.write_lock.lock();
        let head = self.head();
        if let Some((snapshot, groups)) = base {
            if let Some(root) = groups.iter().find(|g| head.group_seq(g) > snapshot.seq) {
                debug!("commit conflict on entity group {}", root);
                return Err(StoreError::ConcurrentTransaction);
            }
        }
        let seq = head.seq.next();
        let mut next = (*head).clone();
        next.apply(seq, writes);
        let next = Arc::new(next);
        *self.head.write() = Arc::clone(&next);
        if self.consistent.load(Ordering::SeqCst) {
            *self.index_view.write() = next;
        }
        debug!("committed {} with {} writes", seq, writes.len());
        Ok(seq)
    }

    fn commit_txn(&self, txn: &MemTxn) -> StoreResult<()> {
        let (groups, writes) = txn.finish()?;
        if writes.is_empty() {
            return Ok(());
        }
        self.commit(&writes, Some((txn.snapshot(), &groups)))
            .map(|_| ())
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("id", &self.id)
            .field("seq", &self.seq())
            .field("entities", &self.len())
            .finish()
    }
}

/// The raw store a context resolves to: the store, plus the open
/// transaction if the context carries one.
struct MemView {
    store: Arc<MemStore>,
    ctx: Context,
    txn: Option<Arc<MemTxn>>,
}

impl MemView {
    fn apply(&self, writes: Vec<Write>) -> StoreResult<()> {
        match &self.txn {
            Some(txn) => txn.buffer(writes),
            None => self.store.commit(&writes, None).map(|_| ()),
        }
    }

    fn query_version(&self, fq: &FinalizedQuery) -> StoreResult<Arc<Version>> {
        match &self.txn {
            Some(txn) => {
                let anc = fq.ancestor().ok_or_else(|| {
                    StoreError::invalid_transaction(
                        "only ancestor queries are allowed inside a transaction",
                    )
                })?;
                txn.touch([anc])?;
                Ok(Arc::clone(txn.snapshot()))
            }
            None => Ok(self.store.read_version(fq)),
        }
    }
}

impl RawStore for MemView {
    fn allocate_ids(&self, keys: &[Key], cb: &mut NewKeyCb<'_>) -> StoreResult<()> {
        for (i, key) in keys.iter().enumerate() {
            cb(i, Ok(key.with_id(self.store.allocate_id())));
        }
        Ok(())
    }

    fn get_multi(
        &self,
        keys: &[Key],
        _meta: Option<&[PropertyMap]>,
        cb: &mut GetCb<'_>,
    ) -> StoreResult<()> {
        let version = match &self.txn {
            Some(txn) => {
                txn.touch(keys)?;
                Arc::clone(txn.snapshot())
            }
            None => self.store.head(),
        };
        for (i, key) in keys.iter().enumerate() {
            let res = version
                .entity(key)
                .map(|props| (**props).clone())
                .ok_or(StoreError::NoSuchEntity);
            cb(i, res);
        }
        Ok(())
    }

    fn put_multi(
        &self,
        keys: &[Key],
        values: &[PropertyMap],
        cb: &mut NewKeyCb<'_>,
    ) -> StoreResult<()> {
        let keys: Vec<Key> = keys.iter().map(|k| self.store.complete(k)).collect();
        let writes = keys
            .iter()
            .cloned()
            .zip(values.iter().map(|v| Some(Arc::new(v.clone()))))
            .collect();
        self.apply(writes)?;
        for (i, key) in keys.into_iter().enumerate() {
            cb(i, Ok(key));
        }
        Ok(())
    }

    fn delete_multi(&self, keys: &[Key], cb: &mut DeleteCb<'_>) -> StoreResult<()> {
        self.apply(keys.iter().map(|k| (k.clone(), None)).collect())?;
        for i in 0..keys.len() {
            cb(i, Ok(()));
        }
        Ok(())
    }

    fn run(&self, query: &FinalizedQuery, cb: &mut RunCb<'_>) -> StoreResult<()> {
        let mut version = self.query_version(query)?;
        let plan = self.store.plan_for(query, &mut version)?;
        trace!("running {} via {}", query, plan);
        exec::execute(&version, query, &plan, cb)
    }

    fn count(&self, query: &FinalizedQuery) -> StoreResult<u64> {
        let mut version = self.query_version(query)?;
        let plan = self.store.plan_for(query, &mut version)?;
        exec::count(&version, query, &plan)
    }

    fn run_in_transaction(
        &self,
        body: &mut TxnBody<'_>,
        opts: &TransactionOptions,
    ) -> StoreResult<()> {
        if self.txn.is_some() {
            return Err(StoreError::NestedTransaction);
        }
        let txn = Arc::new(MemTxn::new(self.store.id, self.store.head(), *opts));
        let txn_ctx = self.ctx.with_transaction(Arc::clone(&txn) as Arc<dyn Any + Send + Sync>);
        match body(&txn_ctx) {
            Ok(()) => self.store.commit_txn(&txn),
            Err(err) => {
                debug!("transaction body failed: {}", err);
                txn.abandon();
                Err(err)
            }
        }
    }

    fn constraints(&self) -> Constraints {
        self.store.config.constraints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstore_model::Query;
    use dstore_raw::datastore;

    fn store() -> Arc<MemStore> {
        MemStore::new(MemoryConfig::new())
    }

    fn item(ctx: &Context, id: i64) -> Key {
        datastore::new_key(ctx, "Item", id)
    }

    #[test]
    fn put_get_delete() {
        let s = store();
        let ctx = s.context();
        let key = datastore::put(&ctx, &item(&ctx, 1), PropertyMap::new().with("a", 1)).unwrap();
        assert_eq!(datastore::get(&ctx, &key).unwrap().first("a"), Some(&1.into()));
        datastore::delete(&ctx, &key).unwrap();
        assert!(datastore::get(&ctx, &key).unwrap_err().is_not_found());
        assert_eq!(s.seq(), SequenceNumber(2));
    }

    #[test]
    fn incomplete_keys_get_ids() {
        let ctx = store().context();
        let template = Key::incomplete(ctx.key_context(), "Item");
        let a = datastore::put(&ctx, &template, PropertyMap::new()).unwrap();
        let b = datastore::put(&ctx, &template, PropertyMap::new()).unwrap();
        assert!(!a.is_incomplete());
        assert_ne!(a, b);
        let allocated = datastore::allocate_ids(&ctx, &[template]);
        assert!(allocated[0].as_ref().unwrap().id().is_complete());
    }

    #[test]
    fn transaction_reads_snapshot_and_commits() {
        let ctx = store().context();
        let key = item(&ctx, 1);
        datastore::put(&ctx, &key, PropertyMap::new().with("n", 1)).unwrap();
        datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tctx| {
            datastore::put(tctx, &key, PropertyMap::new().with("n", 2))?;
            let seen = datastore::get(tctx, &key)?;
            assert_eq!(seen.first("n"), Some(&1.into()));
            Ok(())
        })
        .unwrap();
        assert_eq!(datastore::get(&ctx, &key).unwrap().first("n"), Some(&2.into()));
    }

    #[test]
    fn conflicting_commit_fails() {
        let ctx = store().context();
        let key = item(&ctx, 1);
        let opts = TransactionOptions::default().attempts(1);
        let err = datastore::run_in_transaction(&ctx, &opts, |tctx| {
            datastore::get(tctx, &key).ok();
            datastore::put(&ctx, &key, PropertyMap::new().with("by", "other"))?;
            datastore::put(tctx, &key, PropertyMap::new().with("by", "txn")).map(|_| ())
        })
        .unwrap_err();
        assert!(err.is_concurrent_transaction());
        let stored = datastore::get(&ctx, &key).unwrap();
        assert_eq!(stored.first("by"), Some(&"other".into()));
    }

    #[test]
    fn nested_and_non_ancestor_queries_rejected() {
        let ctx = store().context();
        let opts = TransactionOptions::default().attempts(1);
        let err = datastore::run_in_transaction(&ctx, &opts, |tctx| {
            datastore::run_in_transaction(tctx, &opts, |_| Ok(()))
        })
        .unwrap_err();
        assert_eq!(err, StoreError::NestedTransaction);

        let err = datastore::run_in_transaction(&ctx, &opts, |tctx| {
            datastore::count(tctx, &Query::new("Item").finalize()?).map(|_| ())
        })
        .unwrap_err();
        assert!(matches!(err.root(), StoreError::InvalidTransaction(_)));
    }

    #[test]
    fn missing_index_and_auto_index() {
        let s = store();
        let ctx = s.context();
        let fq = Query::new("Item").eq("a", 1).order("b").finalize().unwrap();
        let err = datastore::count(&ctx, &fq).unwrap_err();
        assert!(matches!(err.root(), StoreError::MissingIndex { .. }));

        s.set_auto_index(true);
        assert_eq!(datastore::count(&ctx, &fq).unwrap(), 0);
        assert_eq!(s.composite_indexes().len(), 1);
    }

    #[test]
    fn inconsistent_global_queries_lag_until_catchup() {
        let s = MemStore::new(MemoryConfig::new().consistent(false));
        let ctx = s.context();
        datastore::put(&ctx, &item(&ctx, 1), PropertyMap::new()).unwrap();
        let global = Query::new("Item").finalize().unwrap();
        assert_eq!(datastore::count(&ctx, &global).unwrap(), 0);

        let anc = Query::new("Item").ancestor(item(&ctx, 1)).finalize().unwrap();
        assert_eq!(datastore::count(&ctx, &anc).unwrap(), 1);

        s.catchup_indexes();
        assert_eq!(datastore::count(&ctx, &global).unwrap(), 1);
    }

    #[test]
    fn catchup_racing_commits_never_rewinds_the_index_view() {
        let s = store();
        let ctx = s.context();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let ctx = &ctx;
                scope.spawn(move || {
                    for i in 0..50 {
                        let key = item(ctx, t * 100 + i + 1);
                        datastore::put(ctx, &key, PropertyMap::new()).unwrap();
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..200 {
                    s.catchup_indexes();
                }
            });
        });
        s.set_consistent(false);
        let global = Query::new("Item").finalize().unwrap();
        assert_eq!(datastore::count(&ctx, &global).unwrap(), 200);
        assert_eq!(s.index_view.read().seq, s.seq());
    }

    #[test]
    fn added_indexes_serve_queries() {
        let s = store();
        let ctx = s.context();
        for i in 1..=4 {
            let props = PropertyMap::new().with("a", i % 2).with("b", i);
            datastore::put(&ctx, &item(&ctx, i), props).unwrap();
        }
        s.add_indexes(&["Item:a,-b".parse().unwrap()]).unwrap();
        let fq = Query::new("Item").eq("a", 1).order("-b").finalize().unwrap();
        assert_eq!(s.explain(&fq).unwrap().to_string(), "scan Item:a,-b forward");
        let keys: Vec<Key> = datastore::get_all(&ctx, &fq)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![item(&ctx, 3), item(&ctx, 1)]);
    }

    #[test]
    fn foreign_transaction_is_rejected() {
        let a = store();
        let b = store();
        let bctx = b.context();
        let opts = TransactionOptions::default().attempts(1);
        let err = datastore::run_in_transaction(&a.context(), &opts, |tctx| {
            let foreign = bctx.with_transaction(Arc::clone(tctx.transaction().unwrap()));
            datastore::get(&foreign, &item(&bctx, 1)).map(|_| ())
        })
        .unwrap_err();
        assert!(err.is_usage());
    }
}
