//! Simulate command implementation.
//!
//! Threads increment shared counters in transactions while a flaky filter
//! injects deadlines and commit conflicts. Afterwards the stored counter
//! total must equal the number of committed transactions.

use dstore_filter::{count, featurebreaker, flaky_errors, FlakyParams, DATASTORE_FEATURES};
use dstore_memory::{MemStore, MemoryConfig};
use dstore_model::{Key, PropertyMap, PropertyValue};
use dstore_raw::{datastore, Context, TransactionOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Instant;
use tracing::info;

/// Workload parameters.
#[derive(Debug, Clone)]
pub struct SimulateArgs {
    /// Transactions per thread.
    pub transactions: usize,
    /// Worker threads.
    pub threads: usize,
    /// Counter entity groups.
    pub groups: usize,
    /// Attempts per transaction.
    pub attempts: u32,
    /// Injected deadline probability.
    pub deadline: f64,
    /// Injected commit conflict probability.
    pub conflict: f64,
    /// Fault generator seed.
    pub seed: u64,
}

/// Simulation outcome.
#[derive(Debug, Serialize)]
pub struct SimulateResult {
    /// Transactions started by callers.
    pub transactions: usize,
    /// Transactions that committed.
    pub committed: usize,
    /// Transactions that ran out of attempts on conflicts.
    pub exhausted: usize,
    /// Transactions that failed with a deadline.
    pub deadlines: usize,
    /// Transactions that failed otherwise.
    pub other_errors: usize,
    /// Raw transaction attempts, including retries.
    pub attempts: u64,
    /// Raw transaction attempts that failed.
    pub failed_attempts: u64,
    /// Sum of all counters after the run.
    pub counter_total: i64,
    /// Whether the counter total equals the committed count.
    pub consistent: bool,
    /// Wall time in milliseconds.
    pub duration_ms: u128,
}

/// Runs the simulate command.
pub fn run(args: &SimulateArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = simulate(args)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    if !result.consistent {
        return Err("counter total does not match committed transactions".into());
    }
    Ok(())
}

/// Runs the workload and collects its statistics.
pub fn simulate(args: &SimulateArgs) -> Result<SimulateResult, Box<dyn std::error::Error>> {
    if args.groups == 0 || args.threads == 0 {
        return Err("groups and threads must be positive".into());
    }
    for p in [args.deadline, args.conflict] {
        if !(0.0..=1.0).contains(&p) {
            return Err(format!("probability {p} is outside [0, 1]").into());
        }
    }
    info!(
        "simulating {} transactions on {} threads over {} groups",
        args.transactions * args.threads,
        args.threads,
        args.groups
    );

    let store = MemStore::new(MemoryConfig::new());
    let base = store.context();
    let keys: Vec<Key> = (1..=args.groups as i64)
        .map(|i| datastore::new_key(&base, "Counter", i))
        .collect();
    let zeros = vec![PropertyMap::new().with("n", 0); keys.len()];
    for r in datastore::put_multi(&base, &keys, &zeros) {
        r?;
    }

    let (ctx, breaker) = featurebreaker::filter_rds(&base, None);
    let (ctx, counter) = count::filter_rds(&ctx);
    let params = FlakyParams::default()
        .seed(args.seed)
        .deadline_probability(args.deadline)
        .concurrent_transaction_probability(args.conflict);
    breaker.break_features_with_callback(flaky_errors(params), &DATASTORE_FEATURES);

    let tally = Tally::default();
    let opts = TransactionOptions::default().attempts(args.attempts);
    let start = Instant::now();
    thread::scope(|s| {
        for t in 0..args.threads {
            let (ctx, keys, opts, tally) = (&ctx, &keys, &opts, &tally);
            s.spawn(move || {
                for i in 0..args.transactions {
                    let key = &keys[(t + i) % keys.len()];
                    tally.record(increment(ctx, key, opts));
                }
            });
        }
    });
    let duration = start.elapsed();

    let counter_total = datastore::get_multi(&base, &keys)
        .into_iter()
        .map(|r| r.map(|v| read_n(&v)))
        .sum::<Result<i64, _>>()?;
    let committed = tally.committed.load(Ordering::Relaxed);
    let txns = &counter.run_in_transaction;

    Ok(SimulateResult {
        transactions: args.transactions * args.threads,
        committed,
        exhausted: tally.exhausted.load(Ordering::Relaxed),
        deadlines: tally.deadlines.load(Ordering::Relaxed),
        other_errors: tally.other.load(Ordering::Relaxed),
        attempts: txns.total(),
        failed_attempts: txns.errors(),
        counter_total,
        consistent: counter_total == committed as i64,
        duration_ms: duration.as_millis(),
    })
}

#[derive(Default)]
struct Tally {
    committed: AtomicUsize,
    exhausted: AtomicUsize,
    deadlines: AtomicUsize,
    other: AtomicUsize,
}

impl Tally {
    fn record(&self, res: dstore_raw::StoreResult<()>) {
        let slot = match &res {
            Ok(()) => &self.committed,
            Err(err) if err.is_concurrent_transaction() => &self.exhausted,
            Err(err) if err.is_deadline() => &self.deadlines,
            Err(_) => &self.other,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }
}

fn increment(ctx: &Context, key: &Key, opts: &TransactionOptions) -> dstore_raw::StoreResult<()> {
    datastore::run_in_transaction(ctx, opts, |tx| {
        let mut value = datastore::get(tx, key)?;
        let n = read_n(&value);
        value.set("n", n + 1);
        datastore::put(tx, key, value).map(|_| ())
    })
}

fn read_n(value: &PropertyMap) -> i64 {
    match value.first("n") {
        Some(PropertyValue::Int(n)) => *n,
        _ => 0,
    }
}

fn print_text_output(result: &SimulateResult) {
    println!("Transactions:     {}", result.transactions);
    println!("  Committed:      {}", result.committed);
    println!("  Exhausted:      {}", result.exhausted);
    println!("  Deadlines:      {}", result.deadlines);
    println!("  Other errors:   {}", result.other_errors);
    println!("Attempts:         {}", result.attempts);
    println!("  Failed:         {}", result.failed_attempts);
    println!("Counter total:    {}", result.counter_total);
    println!(
        "Consistent:       {}",
        if result.consistent { "yes" } else { "NO" }
    );
    println!("Duration:         {} ms", result.duration_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            transactions: 20,
            threads: 2,
            groups: 2,
            attempts: 5,
            deadline: 0.05,
            conflict: 0.1,
            seed: 3,
        }
    }

    #[test]
    fn workload_stays_consistent() {
        let result = simulate(&args()).unwrap();
        assert_eq!(result.transactions, 40);
        assert_eq!(
            result.committed + result.exhausted + result.deadlines + result.other_errors,
            40
        );
        assert!(result.consistent);
    }

    #[test]
    fn no_faults_commit_everything() {
        let a = SimulateArgs {
            deadline: 0.0,
            conflict: 0.0,
            threads: 1,
            ..args()
        };
        let result = simulate(&a).unwrap();
        assert_eq!(result.committed, 20);
        assert_eq!(result.counter_total, 20);
    }

    #[test]
    fn bad_probability_is_rejected() {
        let a = SimulateArgs {
            deadline: 1.5,
            ..args()
        };
        assert!(simulate(&a).is_err());
    }
}
