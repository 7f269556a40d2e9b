//! Error types for model validation.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while validating keys, index definitions, queries and cursors.
///
/// All of these are detected before any backend is consulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// A key is malformed.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An index definition could not be parsed or is malformed.
    #[error("invalid index definition: {0}")]
    InvalidIndex(String),

    /// The query shape is not allowed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// More than one property carries an inequality filter.
    #[error("inequality filters on multiple properties: {first:?} and {second:?}")]
    MultipleInequality {
        /// The first inequality property.
        first: String,
        /// The conflicting inequality property.
        second: String,
    },

    /// The first sort order is not the inequality property.
    #[error("first sort order must match inequality filter on {property:?}, got {found:?}")]
    InequalityNotFirstOrder {
        /// The inequality property.
        property: String,
        /// The property of the first sort order.
        found: String,
    },

    /// A cursor could not be decoded.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    /// A cursor was taken from a query of a different shape.
    #[error("cursor does not belong to this query")]
    CursorMismatch,

    /// Encoding of a query shape or cursor failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl ModelError {
    /// Creates an invalid query error.
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    /// Creates an invalid key error.
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Creates an invalid index error.
    pub fn invalid_index(msg: impl Into<String>) -> Self {
        Self::InvalidIndex(msg.into())
    }
}
