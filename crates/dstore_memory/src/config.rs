//! Memory store configuration.

use dstore_model::{IndexDefinition, KeyContext};
use dstore_raw::Constraints;

/// Configuration for a [`MemStore`](crate::MemStore).
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Application and namespace new keys are created in.
    pub key_context: KeyContext,

    /// Limits reported to the batching layer.
    pub constraints: Constraints,

    /// Whether global queries always see the latest commit. When false
    /// they read the index view, which only advances on
    /// [`MemStore::catchup_indexes`](crate::MemStore::catchup_indexes).
    pub consistent: bool,

    /// Whether a query needing a missing composite index declares it
    /// instead of failing.
    pub auto_index: bool,

    /// Composite indexes declared up front.
    pub indexes: Vec<IndexDefinition>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            key_context: KeyContext::new("dev~app", ""),
            constraints: Constraints {
                max_get_size: 1000,
                max_put_size: 500,
                max_delete_size: 500,
                query_batch_size: 0,
            },
            consistent: true,
            auto_index: false,
            indexes: Vec::new(),
        }
    }
}

impl MemoryConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key context.
    #[must_use]
    pub fn key_context(mut self, kc: KeyContext) -> Self {
        self.key_context = kc;
        self
    }

    /// Sets the reported constraints.
    #[must_use]
    pub const fn constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Sets whether global queries are strongly consistent.
    #[must_use]
    pub const fn consistent(mut self, value: bool) -> Self {
        self.consistent = value;
        self
    }

    /// Sets whether missing composite indexes are declared on demand.
    #[must_use]
    pub const fn auto_index(mut self, value: bool) -> Self {
        self.auto_index = value;
        self
    }

    /// Declares one composite index.
    #[must_use]
    pub fn index(mut self, def: IndexDefinition) -> Self {
        self.indexes.push(def);
        self
    }

    /// Declares several composite indexes.
    #[must_use]
    pub fn indexes(mut self, defs: impl IntoIterator<Item = IndexDefinition>) -> Self {
        self.indexes.extend(defs);
        self
    }
}
