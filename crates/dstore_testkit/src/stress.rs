//! Stress helpers for concurrent transactions.
//!
//! Threads increment shared counters inside transactions so that commits
//! conflict and get retried. The counters' final total must equal the
//! number of committed increments.

use crate::fixtures::{scenarios, TestStore};
use dstore_model::{Key, PropertyValue};
use dstore_raw::{datastore, StoreResult, TransactionOptions};
use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of [`concurrent_increments`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementReport {
    /// Increments whose transaction committed.
    pub committed: usize,
    /// Increments that ran out of attempts on conflicts.
    pub exhausted: usize,
    /// Increments that failed with any other error.
    pub failed: usize,
    /// Committed increments by the number of attempts they took.
    pub attempts: BTreeMap<u32, usize>,
    /// Transaction bodies run, retries included.
    pub bodies: usize,
    /// Wall time of the run.
    pub elapsed: Duration,
}

impl IncrementReport {
    fn record(&mut self, res: &StoreResult<()>, runs: u32) {
        self.bodies += runs as usize;
        match res {
            Ok(()) => {
                self.committed += 1;
                *self.attempts.entry(runs).or_default() += 1;
            }
            Err(err) if err.is_concurrent_transaction() => self.exhausted += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn merge(&mut self, other: Self) {
        self.committed += other.committed;
        self.exhausted += other.exhausted;
        self.failed += other.failed;
        self.bodies += other.bodies;
        for (runs, n) in other.attempts {
            *self.attempts.entry(runs).or_default() += n;
        }
    }

    /// Increments started.
    #[must_use]
    pub fn started(&self) -> usize {
        self.committed + self.exhausted + self.failed
    }

    /// Bodies run beyond each increment's first attempt.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.bodies.saturating_sub(self.started())
    }

    /// Most attempts any committed increment needed.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.attempts.keys().next_back().copied().unwrap_or(0)
    }
}

impl fmt::Display for IncrementReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} committed, {} exhausted, {} failed, {} retries (max {} attempts) in {:?}",
            self.committed,
            self.exhausted,
            self.failed,
            self.retries(),
            self.max_attempts(),
            self.elapsed
        )
    }
}

/// Configuration for stress runs.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent threads.
    pub threads: usize,
    /// Increments attempted by each thread.
    pub increments: usize,
    /// Number of counter entity groups shared by all threads.
    pub groups: usize,
    /// Transaction attempts per increment.
    pub attempts: u32,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            increments: 100,
            groups: 2,
            attempts: 64,
        }
    }
}

/// Increments counters from several threads at once.
///
/// Creates `config.groups` counters in `ts` and reports how the
/// transactions fared. Use [`counter_total`] to check the stored sum.
pub fn concurrent_increments(ts: &TestStore, config: &StressConfig) -> IncrementReport {
    let keys = scenarios::counters(ts, config.groups);
    let opts = TransactionOptions::default().attempts(config.attempts);

    let start = Instant::now();
    let mut report = thread::scope(|s| {
        let workers: Vec<_> = (0..config.threads)
            .map(|t| {
                let (keys, opts) = (&keys, &opts);
                let ctx = ts.ctx.clone();
                s.spawn(move || {
                    let mut report = IncrementReport::default();
                    for i in 0..config.increments {
                        let key = &keys[(t + i) % keys.len()];
                        let mut runs = 0;
                        let res = datastore::run_in_transaction(&ctx, opts, |tx| {
                            runs += 1;
                            let mut value = datastore::get(tx, key)?;
                            let n = read_count(value.first("n"));
                            value.set("n", n + 1);
                            datastore::put(tx, key, value).map(|_| ())
                        });
                        report.record(&res, runs);
                    }
                    report
                })
            })
            .collect();
        let mut total = IncrementReport::default();
        for worker in workers {
            total.merge(worker.join().expect("Stress worker panicked"));
        }
        total
    });
    report.elapsed = start.elapsed();
    report
}

/// Sums the `n` property over `Counter` roots `1..=groups`.
pub fn counter_total(ts: &TestStore, groups: usize) -> i64 {
    let keys: Vec<Key> = (1..=groups as i64).map(|i| ts.key("Counter", i)).collect();
    datastore::get_multi(ts, &keys)
        .into_iter()
        .map(|r| read_count(r.expect("Failed to read counter").first("n")))
        .sum()
}

fn read_count(value: Option<&PropertyValue>) -> i64 {
    match value {
        Some(PropertyValue::Int(n)) => *n,
        _ => 0,
    }
}
