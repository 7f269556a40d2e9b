//! Breaking individual store features on demand.
//!
//! A [`FeatureBreaker`] is installed as a filter and can make any
//! [`Feature`] fail with a fixed error or with the result of a callback.
//! [`crate::flaky_errors`] builds a callback that fails randomly.

use dstore_model::{FinalizedQuery, Key, PropertyMap};
use dstore_raw::{
    Constraints, Context, DeleteCb, GetCb, NewKeyCb, RawStore, RunCb, StoreError, StoreResult,
    TransactionOptions, TxnBody,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A breakable store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// `allocate_ids`
    AllocateIds,
    /// `get_multi`
    GetMulti,
    /// `put_multi`
    PutMulti,
    /// `delete_multi`
    DeleteMulti,
    /// `run`
    Run,
    /// `count`
    Count,
    /// Entering `run_in_transaction`.
    BeginTransaction,
    /// Committing after a successful transaction body.
    CommitTransaction,
}

/// Every datastore feature.
pub const DATASTORE_FEATURES: [Feature; 8] = [
    Feature::AllocateIds,
    Feature::GetMulti,
    Feature::PutMulti,
    Feature::DeleteMulti,
    Feature::Run,
    Feature::Count,
    Feature::BeginTransaction,
    Feature::CommitTransaction,
];

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AllocateIds => "AllocateIDs",
            Self::GetMulti => "GetMulti",
            Self::PutMulti => "PutMulti",
            Self::DeleteMulti => "DeleteMulti",
            Self::Run => "Run",
            Self::Count => "Count",
            Self::BeginTransaction => "BeginTransaction",
            Self::CommitTransaction => "CommitTransaction",
        };
        f.write_str(name)
    }
}

/// Decides whether a feature call fails.
pub type BreakFeatureCallback = Arc<dyn Fn(&Context, Feature) -> StoreResult<()> + Send + Sync>;

#[derive(Clone)]
enum Breaker {
    Error(StoreError),
    Callback(BreakFeatureCallback),
}

/// Shared switchboard of broken features.
#[derive(Clone)]
pub struct FeatureBreaker {
    default_error: Option<StoreError>,
    broken: Arc<RwLock<HashMap<Feature, Breaker>>>,
}

impl FeatureBreaker {
    /// Creates a breaker. Features broken without an explicit error fail
    /// with `default_error`, or a generic error naming the feature.
    #[must_use]
    pub fn new(default_error: Option<StoreError>) -> Self {
        Self {
            default_error,
            broken: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Makes `features` fail with `err`.
    pub fn break_features(&self, err: Option<StoreError>, features: &[Feature]) {
        let mut broken = self.broken.write();
        for &feature in features {
            let err = err
                .clone()
                .or_else(|| self.default_error.clone())
                .unwrap_or_else(|| StoreError::other(format!("feature {feature} is broken")));
            broken.insert(feature, Breaker::Error(err));
        }
    }

    /// Makes `features` consult `cb` on every call.
    pub fn break_features_with_callback(&self, cb: BreakFeatureCallback, features: &[Feature]) {
        let mut broken = self.broken.write();
        for &feature in features {
            broken.insert(feature, Breaker::Callback(Arc::clone(&cb)));
        }
    }

    /// Restores `features`.
    pub fn unbreak_features(&self, features: &[Feature]) {
        let mut broken = self.broken.write();
        for feature in features {
            broken.remove(feature);
        }
    }

    /// Returns a filter that wraps stores with this breaker.
    pub fn filter(&self) -> impl Fn(&Context, Arc<dyn RawStore>) -> Arc<dyn RawStore> + Send + Sync + 'static {
        let breaker = self.clone();
        move |ctx: &Context, inner: Arc<dyn RawStore>| {
            let store: Arc<dyn RawStore> = Arc::new(BrokenStore {
                ctx: ctx.clone(),
                inner,
                breaker: breaker.clone(),
            });
            store
        }
    }

    fn check(&self, ctx: &Context, feature: Feature) -> StoreResult<()> {
        let breaker = self.broken.read().get(&feature).cloned();
        match breaker {
            None => Ok(()),
            Some(Breaker::Error(err)) => Err(err),
            Some(Breaker::Callback(cb)) => cb(ctx, feature),
        }
    }
}

/// Installs a new [`FeatureBreaker`] into `ctx`.
#[must_use]
pub fn filter_rds(ctx: &Context, default_error: Option<StoreError>) -> (Context, FeatureBreaker) {
    let breaker = FeatureBreaker::new(default_error);
    (ctx.with_filter(breaker.filter()), breaker)
}

struct BrokenStore {
    ctx: Context,
    inner: Arc<dyn RawStore>,
    breaker: FeatureBreaker,
}

impl RawStore for BrokenStore {
    fn allocate_ids(&self, keys: &[Key], cb: &mut NewKeyCb<'_>) -> StoreResult<()> {
        self.breaker.check(&self.ctx, Feature::AllocateIds)?;
        self.inner.allocate_ids(keys, cb)
    }

    fn get_multi(
        &self,
        keys: &[Key],
        meta: Option<&[PropertyMap]>,
        cb: &mut GetCb<'_>,
    ) -> StoreResult<()> {
        self.breaker.check(&self.ctx, Feature::GetMulti)?;
        self.inner.get_multi(keys, meta, cb)
    }

    fn put_multi(
        &self,
        keys: &[Key],
        values: &[PropertyMap],
        cb: &mut NewKeyCb<'_>,
    ) -> StoreResult<()> {
        self.breaker.check(&self.ctx, Feature::PutMulti)?;
        self.inner.put_multi(keys, values, cb)
    }

    fn delete_multi(&self, keys: &[Key], cb: &mut DeleteCb<'_>) -> StoreResult<()> {
        self.breaker.check(&self.ctx, Feature::DeleteMulti)?;
        self.inner.delete_multi(keys, cb)
    }

    fn run(&self, query: &FinalizedQuery, cb: &mut RunCb<'_>) -> StoreResult<()> {
        self.breaker.check(&self.ctx, Feature::Run)?;
        self.inner.run(query, cb)
    }

    fn count(&self, query: &FinalizedQuery) -> StoreResult<u64> {
        self.breaker.check(&self.ctx, Feature::Count)?;
        self.inner.count(query)
    }

    fn run_in_transaction(
        &self,
        body: &mut TxnBody<'_>,
        opts: &TransactionOptions,
    ) -> StoreResult<()> {
        self.breaker.check(&self.ctx, Feature::BeginTransaction)?;
        // A failed commit is an error after the body succeeded.
        self.inner.run_in_transaction(
            &mut |txn_ctx| {
                body(txn_ctx)?;
                self.breaker.check(&self.ctx, Feature::CommitTransaction)
            },
            opts,
        )
    }

    fn constraints(&self) -> Constraints {
        self.inner.constraints()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstore_memory::{MemStore, MemoryConfig};
    use dstore_model::Query;
    use dstore_raw::datastore;

    fn setup() -> (Context, FeatureBreaker) {
        let store = MemStore::new(MemoryConfig::new());
        filter_rds(&store.context(), None)
    }

    #[test]
    fn broken_feature_fails_until_unbroken() {
        let (ctx, fb) = setup();
        let key = datastore::new_key(&ctx, "K", 1);
        datastore::put(&ctx, &key, PropertyMap::new().with("a", 1)).unwrap();

        fb.break_features(Some(StoreError::Deadline), &[Feature::GetMulti]);
        assert!(datastore::get(&ctx, &key).unwrap_err().is_deadline());
        assert!(datastore::count(&ctx, &Query::new("K").finalize().unwrap()).is_ok());

        fb.unbreak_features(&[Feature::GetMulti]);
        assert!(datastore::get(&ctx, &key).is_ok());
    }

    #[test]
    fn default_error_names_feature() {
        let (ctx, fb) = setup();
        fb.break_features(None, &[Feature::Run]);
        let err = datastore::get_all(&ctx, &Query::new("K").finalize().unwrap()).unwrap_err();
        assert_eq!(err.to_string(), "feature Run is broken");
    }

    #[test]
    fn broken_commit_discards_writes() {
        let (ctx, fb) = setup();
        fb.break_features(Some(StoreError::ConcurrentTransaction), &[Feature::CommitTransaction]);
        let key = datastore::new_key(&ctx, "K", 1);
        let opts = TransactionOptions::default().attempts(1);
        let err = datastore::run_in_transaction(&ctx, &opts, |tctx| {
            datastore::put(tctx, &key, PropertyMap::new()).map(|_| ())
        })
        .unwrap_err();
        assert!(err.is_concurrent_transaction());

        fb.unbreak_features(&DATASTORE_FEATURES);
        assert!(datastore::get(&ctx, &key).unwrap_err().is_not_found());
    }

    #[test]
    fn callback_sees_feature() {
        let (ctx, fb) = setup();
        fb.break_features_with_callback(
            Arc::new(|_: &Context, feature: Feature| {
                if feature == Feature::PutMulti {
                    Err(StoreError::other("no puts"))
                } else {
                    Ok(())
                }
            }),
            &DATASTORE_FEATURES,
        );
        let key = datastore::new_key(&ctx, "K", 1);
        assert!(datastore::put(&ctx, &key, PropertyMap::new()).is_err());
        assert!(datastore::get(&ctx, &key).unwrap_err().is_not_found());
    }
}
