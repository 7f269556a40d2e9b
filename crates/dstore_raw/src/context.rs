//! Immutable request context.
//!
//! A [`Context`] carries the installed backend factory, the user filter
//! chain, typed values and, inside a transaction, the backend's
//! transaction handle. Contexts are never mutated: every `with_*` method
//! returns a new context sharing the rest of its state.

use crate::batcher::BatchFilter;
use crate::checkfilter::CheckFilter;
use crate::error::{StoreError, StoreResult};
use crate::raw::RawStore;
use dstore_model::KeyContext;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Produces the backend store for a context.
pub type RawFactory = Arc<dyn Fn(&Context) -> StoreResult<Arc<dyn RawStore>> + Send + Sync>;

/// Wraps a store in another layer.
pub type RawFilter = Arc<dyn Fn(&Context, Arc<dyn RawStore>) -> Arc<dyn RawStore> + Send + Sync>;

type Value = Arc<dyn Any + Send + Sync>;

/// The explicit, immutable scope storage calls run in.
#[derive(Clone, Default)]
pub struct Context {
    factory: Option<RawFactory>,
    filters: Arc<Vec<RawFilter>>,
    values: Arc<HashMap<TypeId, Value>>,
    txn: Option<Value>,
}

impl Context {
    /// Starts building a context around a backend factory.
    pub fn builder<F>(factory: F) -> ContextBuilder
    where
        F: Fn(&Context) -> StoreResult<Arc<dyn RawStore>> + Send + Sync + 'static,
    {
        ContextBuilder {
            factory: Arc::new(factory),
            filters: Vec::new(),
            values: HashMap::new(),
        }
    }

    /// Resolves the layered store for this context.
    ///
    /// Layers from the inside out: the backend, user filters in the order
    /// they were added, batching, then argument checking.
    ///
    /// # Errors
    ///
    /// Returns a usage error if no backend is installed, or the factory's
    /// error.
    pub fn raw(&self) -> StoreResult<Arc<dyn RawStore>> {
        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| StoreError::usage("no datastore installed in context"))?;
        let mut store = factory(self)?;
        for filter in self.filters.iter() {
            store = filter(self, store);
        }
        let store: Arc<dyn RawStore> = Arc::new(BatchFilter::new(self.clone(), store));
        Ok(Arc::new(CheckFilter::new(store)))
    }

    /// Returns a context with one more user filter, outermost.
    #[must_use]
    pub fn with_filter<F>(&self, filter: F) -> Self
    where
        F: Fn(&Context, Arc<dyn RawStore>) -> Arc<dyn RawStore> + Send + Sync + 'static,
    {
        let mut filters = (*self.filters).clone();
        filters.push(Arc::new(filter));
        Self {
            filters: Arc::new(filters),
            ..self.clone()
        }
    }

    /// Returns a context carrying `value`, replacing any value of the same type.
    #[must_use]
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            values: Arc::new(values),
            ..self.clone()
        }
    }

    /// Returns the value of type `T`, if present.
    #[must_use]
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|v| (**v).downcast_ref::<T>())
    }

    /// Returns a context bound to a backend transaction handle.
    #[must_use]
    pub fn with_transaction(&self, txn: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            txn: Some(txn),
            ..self.clone()
        }
    }

    /// Returns a view of this context outside of any transaction.
    #[must_use]
    pub fn without_transaction(&self) -> Self {
        Self {
            txn: None,
            ..self.clone()
        }
    }

    /// Returns the backend transaction handle, if any.
    #[must_use]
    pub fn transaction(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.txn.as_ref()
    }

    /// Recovers the transaction handle as a concrete backend type.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the handle belongs to another backend.
    pub fn transaction_as<T: Any + Send + Sync>(&self) -> StoreResult<Option<Arc<T>>> {
        match &self.txn {
            None => Ok(None),
            Some(txn) => Arc::clone(txn)
                .downcast::<T>()
                .map(Some)
                .map_err(|_| StoreError::usage("transaction belongs to a different backend")),
        }
    }

    /// Returns true inside a transaction.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Returns a context whose new keys use `kc`.
    #[must_use]
    pub fn with_key_context(&self, kc: KeyContext) -> Self {
        self.with_value(kc)
    }

    /// Returns the key context new keys are created in.
    #[must_use]
    pub fn key_context(&self) -> KeyContext {
        self.value::<KeyContext>().cloned().unwrap_or_default()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("installed", &self.factory.is_some())
            .field("filters", &self.filters.len())
            .field("values", &self.values.len())
            .field("in_transaction", &self.txn.is_some())
            .finish()
    }
}

/// Builder for a [`Context`].
pub struct ContextBuilder {
    factory: RawFactory,
    filters: Vec<RawFilter>,
    values: HashMap<TypeId, Value>,
}

impl ContextBuilder {
    /// Adds a user filter. Later filters wrap earlier ones.
    #[must_use]
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Context, Arc<dyn RawStore>) -> Arc<dyn RawStore> + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Sets the key context new keys are created in.
    #[must_use]
    pub fn key_context(mut self, kc: KeyContext) -> Self {
        self.values.insert(TypeId::of::<KeyContext>(), Arc::new(kc));
        self
    }

    /// Builds the context.
    #[must_use]
    pub fn build(self) -> Context {
        Context {
            factory: Some(self.factory),
            filters: Arc::new(self.filters),
            values: Arc::new(self.values),
            txn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn values_are_scoped() {
        let base = Context::default();
        let derived = base.with_value(Marker(7));
        assert!(base.value::<Marker>().is_none());
        assert_eq!(derived.value::<Marker>(), Some(&Marker(7)));
        let replaced = derived.with_value(Marker(8));
        assert_eq!(replaced.value::<Marker>(), Some(&Marker(8)));
        assert_eq!(derived.value::<Marker>(), Some(&Marker(7)));
    }

    #[test]
    fn transaction_downcast_is_checked() {
        let ctx = Context::default().with_transaction(Arc::new(Marker(1)));
        assert!(ctx.in_transaction());
        assert_eq!(*ctx.transaction_as::<Marker>().unwrap().unwrap(), Marker(1));
        assert!(ctx.transaction_as::<String>().unwrap_err().is_usage());
        assert!(!ctx.without_transaction().in_transaction());
    }

    #[test]
    fn raw_without_backend_is_usage_error() {
        let err = Context::default().raw().err().unwrap();
        assert!(err.is_usage());
    }

    #[test]
    fn key_context_defaults() {
        let ctx = Context::default();
        assert_eq!(ctx.key_context(), KeyContext::default());
        let kc = KeyContext::new("app", "ns");
        assert_eq!(ctx.with_key_context(kc.clone()).key_context(), kc);
    }
}
