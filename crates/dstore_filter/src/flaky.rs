//! Random deadline and commit-conflict errors.

use crate::featurebreaker::{BreakFeatureCallback, Feature};
use dstore_raw::{Context, StoreError, StoreResult};
use parking_lot::Mutex;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::debug;

/// Default probability of a deadline error on an RPC-shaped call.
pub const DEFAULT_DEADLINE_PROBABILITY: f64 = 0.05;

/// Default probability of a conflict on commit.
pub const DEFAULT_CONCURRENT_TRANSACTION_PROBABILITY: f64 = 0.1;

/// Options for [`flaky_errors`].
#[derive(Default)]
pub struct FlakyParams {
    /// Source of randomness, used under a lock. Defaults to a ChaCha8
    /// generator seeded with 0.
    pub rng: Option<Box<dyn RngCore + Send>>,

    /// Probability of [`StoreError::Deadline`] on every datastore feature.
    ///
    /// Rolled independently of the conflict probability, so a commit can
    /// fail either way. Defaults to 0.05.
    pub deadline_probability: Option<f64>,

    /// Probability of [`StoreError::ConcurrentTransaction`] on commit.
    /// Defaults to 0.1.
    pub concurrent_transaction_probability: Option<f64>,
}

impl FlakyParams {
    /// Uses a ChaCha8 generator seeded with `seed`.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = Some(Box::new(ChaCha8Rng::seed_from_u64(seed)));
        self
    }

    /// Sets the deadline probability.
    #[must_use]
    pub fn deadline_probability(mut self, p: f64) -> Self {
        self.deadline_probability = Some(p);
        self
    }

    /// Sets the commit conflict probability.
    #[must_use]
    pub fn concurrent_transaction_probability(mut self, p: f64) -> Self {
        self.concurrent_transaction_probability = Some(p);
        self
    }
}

struct Dice {
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl Dice {
    fn roll(&self, probability: f64) -> bool {
        let sample: f64 = self.rng.lock().gen();
        sample < probability
    }
}

/// Builds a [`BreakFeatureCallback`] that fails calls at random.
///
/// Install it with
/// [`FeatureBreaker::break_features_with_callback`](crate::FeatureBreaker::break_features_with_callback)
/// over [`DATASTORE_FEATURES`](crate::DATASTORE_FEATURES).
#[must_use]
pub fn flaky_errors(params: FlakyParams) -> BreakFeatureCallback {
    let deadline = params
        .deadline_probability
        .unwrap_or(DEFAULT_DEADLINE_PROBABILITY);
    let conflict = params
        .concurrent_transaction_probability
        .unwrap_or(DEFAULT_CONCURRENT_TRANSACTION_PROBABILITY);
    let dice = Dice {
        rng: Mutex::new(
            params
                .rng
                .unwrap_or_else(|| Box::new(ChaCha8Rng::seed_from_u64(0))),
        ),
    };

    Arc::new(move |_: &Context, feature: Feature| -> StoreResult<()> {
        if dice.roll(deadline) {
            debug!("injecting deadline into {}", feature);
            return Err(StoreError::Deadline);
        }
        if feature == Feature::CommitTransaction && dice.roll(conflict) {
            debug!("injecting commit conflict");
            return Err(StoreError::ConcurrentTransaction);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(cb: &BreakFeatureCallback, feature: Feature, n: usize) -> (usize, usize) {
        let ctx = Context::default();
        let mut deadlines = 0;
        let mut conflicts = 0;
        for _ in 0..n {
            match cb(&ctx, feature) {
                Err(StoreError::Deadline) => deadlines += 1,
                Err(StoreError::ConcurrentTransaction) => conflicts += 1,
                _ => {}
            }
        }
        (deadlines, conflicts)
    }

    #[test]
    fn conflicts_only_on_commit() {
        let cb = flaky_errors(FlakyParams::default().concurrent_transaction_probability(1.0));
        let (_, conflicts) = outcomes(&cb, Feature::GetMulti, 200);
        assert_eq!(conflicts, 0);
        let (deadlines, conflicts) = outcomes(&cb, Feature::CommitTransaction, 200);
        assert_eq!(deadlines + conflicts, 200);
    }

    #[test]
    fn default_rates_are_roughly_honored() {
        let cb = flaky_errors(FlakyParams::default());
        let (deadlines, conflicts) = outcomes(&cb, Feature::CommitTransaction, 10_000);
        assert!((300..700).contains(&deadlines), "deadlines = {deadlines}");
        assert!((650..1250).contains(&conflicts), "conflicts = {conflicts}");
    }

    #[test]
    fn same_seed_same_stream() {
        let a = flaky_errors(FlakyParams::default().seed(42).deadline_probability(0.5));
        let b = flaky_errors(FlakyParams::default().seed(42).deadline_probability(0.5));
        let ctx = Context::default();
        for _ in 0..50 {
            assert_eq!(a(&ctx, Feature::Run).is_err(), b(&ctx, Feature::Run).is_err());
        }
    }

    #[test]
    fn zero_probability_never_fails() {
        let cb = flaky_errors(
            FlakyParams::default()
                .deadline_probability(0.0)
                .concurrent_transaction_probability(0.0),
        );
        assert_eq!(outcomes(&cb, Feature::CommitTransaction, 500), (0, 0));
    }
}
