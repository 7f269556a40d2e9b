//! Error types for storage operations.

use dstore_model::{IndexDefinition, ModelError};
use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by raw stores, filters and convenience calls.
///
/// `NoSuchEntity` and `ConcurrentTransaction` keep their identity through
/// any number of [`StoreError::Context`] layers; use [`StoreError::root`]
/// or the `is_*` predicates to check for them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The entity does not exist. Only reported per element.
    #[error("no such entity")]
    NoSuchEntity,

    /// A transaction conflicted with a concurrent commit.
    #[error("concurrent transaction")]
    ConcurrentTransaction,

    /// The operation ran out of time.
    #[error("deadline exceeded")]
    Deadline,

    /// A key in the request is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The API was misused. Not retryable.
    #[error("usage error: {0}")]
    Usage(String),

    /// The query could not be finalized.
    #[error("query error: {0}")]
    Query(#[from] ModelError),

    /// No index can serve the query.
    #[error("missing index {suggested}, declare:\n{}", .suggested.to_yaml())]
    MissingIndex {
        /// The index that would serve the query.
        suggested: IndexDefinition,
    },

    /// A batch exceeds a hard backend limit while batching is disabled.
    #[error("batch of {size} exceeds maximum of {max}")]
    BatchTooLarge {
        /// Requested batch size.
        size: usize,
        /// Backend maximum.
        max: usize,
    },

    /// The transaction has already committed or rolled back.
    #[error("transaction is already finished")]
    TransactionDone,

    /// A transaction was started inside another one.
    #[error("nested transactions are not supported")]
    NestedTransaction,

    /// An operation is not allowed inside this transaction.
    #[error("invalid transaction operation: {0}")]
    InvalidTransaction(String),

    /// An error with added context.
    #[error("{context}: {source}")]
    Context {
        /// What was being done.
        context: String,
        /// The underlying error.
        source: Box<StoreError>,
    },

    /// Any other backend error.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Creates a usage error.
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Creates an invalid transaction error.
    pub fn invalid_transaction(msg: impl Into<String>) -> Self {
        Self::InvalidTransaction(msg.into())
    }

    /// Creates a generic backend error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Wraps this error with context, preserving its identity.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error beneath any context layers.
    #[must_use]
    pub fn root(&self) -> &StoreError {
        let mut err = self;
        while let Self::Context { source, .. } = err {
            err = source;
        }
        err
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NoSuchEntity)
    }

    /// Returns true if this is a transaction conflict.
    #[must_use]
    pub fn is_concurrent_transaction(&self) -> bool {
        matches!(self.root(), Self::ConcurrentTransaction)
    }

    /// Returns true if this is a deadline error.
    #[must_use]
    pub fn is_deadline(&self) -> bool {
        matches!(self.root(), Self::Deadline)
    }

    /// Returns true if this is a usage error.
    #[must_use]
    pub fn is_usage(&self) -> bool {
        matches!(self.root(), Self::Usage(_))
    }
}
