//! # dstore filters
//!
//! Optional layers installed around a backend through
//! [`Context::with_filter`](dstore_raw::Context::with_filter) or
//! [`ContextBuilder::filter`](dstore_raw::ContextBuilder::filter):
//!
//! - [`featurebreaker`]: fail chosen operations on demand, or at random
//!   with [`flaky_errors`]
//! - [`txndefer`]: run callbacks after a transaction commits
//! - [`count`]: count calls per operation
//!
//! ## Example
//!
//! ```rust,ignore
//! let (ctx, breaker) = featurebreaker::filter_rds(&ctx, None);
//! breaker.break_features_with_callback(
//!     flaky_errors(FlakyParams::default()),
//!     &DATASTORE_FEATURES,
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod count;
pub mod featurebreaker;
mod flaky;
pub mod txndefer;

pub use featurebreaker::{BreakFeatureCallback, Feature, FeatureBreaker, DATASTORE_FEATURES};
pub use flaky::{
    flaky_errors, FlakyParams, DEFAULT_CONCURRENT_TRANSACTION_PROBABILITY,
    DEFAULT_DEADLINE_PROBABILITY,
};
