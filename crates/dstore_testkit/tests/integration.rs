//! Integration tests for the dstore pipeline over the in-memory backend.

use dstore_filter::txndefer;
use dstore_filter::{count, featurebreaker, flaky_errors, Feature, FlakyParams, DATASTORE_FEATURES};
use dstore_memory::MemoryConfig;
use dstore_model::{Cursor, Key, PropertyMap, PropertyValue, Query};
use dstore_raw::{
    datastore, with_batching, with_query_batch_callback, with_query_batch_size, Constraints,
    Context, StoreError, TransactionOptions,
};
use dstore_testkit::prelude::*;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn small_batches() -> TestStore {
    TestStore::with_config(MemoryConfig::new().constraints(Constraints {
        max_get_size: 3,
        max_put_size: 4,
        max_delete_size: 5,
        query_batch_size: 0,
    }))
}

fn item_keys(ts: &TestStore, n: i64) -> Vec<Key> {
    (1..=n).map(|i| ts.key("Item", i)).collect()
}

fn c_values(records: &[(Key, PropertyMap)]) -> Vec<i64> {
    records
        .iter()
        .map(|(_, v)| match v.first("c") {
            Some(PropertyValue::Int(c)) => *c,
            other => panic!("unexpected c {other:?}"),
        })
        .collect()
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn multi_key_calls_split_into_ceil_groups() {
    let ts = small_batches();
    let (ctx, counter) = count::filter_rds(&ts.ctx);
    let keys = item_keys(&ts, 10);
    let values: Vec<PropertyMap> = (1..=10).map(scenarios::item).collect();

    let put = datastore::put_multi(&ctx, &keys, &values);
    assert!(put.iter().all(Result::is_ok));
    assert_eq!(counter.put_multi.total(), 3);

    let got = datastore::get_multi(&ctx, &keys);
    assert_eq!(counter.get_multi.total(), 4);
    for (i, r) in got.into_iter().enumerate() {
        assert_eq!(r.unwrap(), values[i], "position {i}");
    }

    let deleted = datastore::delete_multi(&ctx, &keys);
    assert!(deleted.iter().all(Result::is_ok));
    assert_eq!(counter.delete_multi.total(), 2);
    assert!(ts.store.is_empty());
}

#[test]
fn missing_entities_report_per_position() {
    let ts = small_batches();
    let keys = item_keys(&ts, 7);
    for i in [0, 3, 6] {
        ts.put(&keys[i], scenarios::item(i as i64 + 1));
    }
    let got = datastore::get_multi(&ts, &keys);
    for (i, r) in got.iter().enumerate() {
        if [0, 3, 6].contains(&i) {
            assert!(r.is_ok(), "position {i}");
        } else {
            assert!(r.as_ref().unwrap_err().is_not_found(), "position {i}");
        }
    }
}

#[test]
fn disabled_batching_rejects_oversized_calls() {
    let ts = small_batches();
    let ctx = with_batching(&ts.ctx, false);
    let got = datastore::get_multi(&ctx, &item_keys(&ts, 4));
    assert_eq!(got.len(), 4);
    for r in got {
        assert!(matches!(
            r.unwrap_err().root(),
            StoreError::BatchTooLarge { size: 4, max: 3 }
        ));
    }
}

#[test]
fn query_sub_batches_make_floor_plus_one_calls() {
    for (m, b, runs) in [(10, 3, 4), (9, 3, 4), (2, 5, 1)] {
        let ts = scenarios::populated_store(m);
        let q = Query::new("Item").finalize().unwrap();
        let unbatched = datastore::get_all(&ts, &q).unwrap();

        let (ctx, counter) = count::filter_rds(&ts.ctx);
        let ctx = with_query_batch_size(&ctx, b);
        let batched = datastore::get_all(&ctx, &q).unwrap();
        assert_eq!(counter.run.total(), runs, "M={m} B={b}");
        assert_eq!(batched, unbatched);
    }
}

#[test]
fn query_batches_respect_limit_and_offset() {
    let ts = scenarios::populated_store(20);
    let q = Query::new("Item").order("c").offset(2).limit(7).finalize().unwrap();
    let unbatched = datastore::get_all(&ts, &q).unwrap();
    assert_eq!(c_values(&unbatched), (3..=9).collect::<Vec<_>>());

    let (ctx, counter) = count::filter_rds(&ts.ctx);
    let batched = datastore::get_all(&with_query_batch_size(&ctx, 3), &q).unwrap();
    assert_eq!(batched, unbatched);
    assert_eq!(counter.run.total(), 3);
}

#[test]
fn batch_callback_runs_between_batches() {
    let ts = scenarios::populated_store(10);
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let ctx = with_query_batch_callback(&with_query_batch_size(&ts.ctx, 3), move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let q = Query::new("Item").finalize().unwrap();
    assert_eq!(datastore::get_all(&ctx, &q).unwrap().len(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn batch_callback_error_aborts_query() {
    let ts = scenarios::populated_store(10);
    let ctx = with_query_batch_callback(&with_query_batch_size(&ts.ctx, 4), |_| {
        Err(StoreError::other("stop"))
    });
    let q = Query::new("Item").finalize().unwrap();
    let mut delivered = 0;
    let res = datastore::run(&ctx, &q, |_| {
        delivered += 1;
        Ok(ControlFlow::Continue(()))
    });
    assert_eq!(res.unwrap_err(), StoreError::other("stop"));
    assert_eq!(delivered, 4);
}

#[test]
fn batched_multi_valued_sort_delivers_each_entity_once() {
    let ts = TestStore::memory();
    let k1 = ts.put(&ts.key("Item", 1), PropertyMap::new().with_values("tags", ["p", "q"]));
    let k2 = ts.put(&ts.key("Item", 2), PropertyMap::new().with("tags", "q"));
    let q = Query::new("Item").order("tags").finalize().unwrap();

    let keys = |records: Vec<(Key, PropertyMap)>| -> Vec<Key> {
        records.into_iter().map(|(k, _)| k).collect()
    };
    let unbatched = keys(datastore::get_all(&ts, &q).unwrap());
    assert_eq!(unbatched, vec![k1, k2]);
    let batched = keys(datastore::get_all(&with_query_batch_size(&ts, 1), &q).unwrap());
    assert_eq!(batched, unbatched);
}

#[test]
fn batched_distinct_projection_keeps_groups_distinct() {
    let ts = TestStore::memory();
    for (i, b) in ["x", "x", "y", "y"].into_iter().enumerate() {
        ts.put(&ts.key("Item", i as i64 + 1), PropertyMap::new().with("b", b));
    }
    let q = Query::new("Item")
        .project(["b"])
        .distinct(true)
        .finalize()
        .unwrap();
    let unbatched = datastore::get_all(&ts, &q).unwrap();
    assert_eq!(unbatched.len(), 2);

    let (ctx, counter) = count::filter_rds(&ts.ctx);
    let ctx = with_batching(&with_query_batch_size(&ctx, 1), true);
    let batched = datastore::get_all(&ctx, &q).unwrap();
    assert_eq!(batched, unbatched);
    assert_eq!(counter.run.total(), 3);
}

// ============================================================================
// Argument compaction
// ============================================================================

#[test]
fn invalid_keys_are_dropped_and_reported_in_place() {
    let ts = TestStore::memory();
    let mut keys = item_keys(&ts, 9);
    for k in &keys {
        ts.put(k, PropertyMap::new().with("id", k.to_string()));
    }
    for i in [0, 4, 7] {
        keys[i] = Key::incomplete(ts.key_context(), "Item");
    }

    let got = datastore::get_multi(&ts, &keys);
    assert_eq!(got.len(), 9);
    for (i, r) in got.into_iter().enumerate() {
        if [0, 4, 7].contains(&i) {
            assert!(matches!(r, Err(StoreError::InvalidKey(_))), "position {i}");
        } else {
            let value = r.unwrap();
            assert_eq!(value.first("id"), Some(&keys[i].to_string().into()));
        }
    }
}

// ============================================================================
// Cursors
// ============================================================================

#[test]
fn cursor_resumes_after_serialization() {
    let ts = scenarios::populated_store(15);
    let q = Query::new("Item").eq("a", 1).order("-c").finalize().unwrap();
    let all = datastore::get_all(&ts, &q).unwrap();
    assert_eq!(c_values(&all), vec![13, 10, 7, 4, 1]);

    let mut cursor = None;
    let first = q.with_limit(Some(2));
    datastore::run(&ts, &first, |item| {
        cursor = Some(item.cursor().to_bytes()?);
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();

    let restored = Cursor::from_bytes(&cursor.unwrap()).unwrap();
    let rest = datastore::get_all(&ts, &q.with_start(Some(restored)).unwrap()).unwrap();
    assert_eq!(c_values(&rest), vec![7, 4, 1]);
}

#[test]
fn cursor_from_another_query_is_rejected() {
    let ts = scenarios::populated_store(5);
    let q = Query::new("Item").order("c").finalize().unwrap();
    let other = Query::new("Item").order("-c").finalize().unwrap();
    let mut cursor = None;
    datastore::run(&ts, &q, |item| {
        cursor = Some(item.cursor().clone());
        Ok(ControlFlow::Break(()))
    })
    .unwrap();
    assert!(other.with_start(cursor).is_err());
}

// ============================================================================
// Index selection
// ============================================================================

#[test]
fn descending_composite_serves_equality_and_range() {
    let ts = TestStore::with_indexes(&["Item:a,b,-c"]);
    scenarios::populate(&ts, 30);
    let q = Query::new("Item")
        .eq("a", 0)
        .eq("b", 0)
        .lt("c", 20)
        .order("-c")
        .finalize()
        .unwrap();

    let plan = ts.store.explain(&q).unwrap();
    assert_eq!(plan.to_string(), "scan Item:a,b,-c forward");
    assert_eq!(plan.scans_descending("c"), Some(true));

    let got = datastore::get_all(&ts, &q).unwrap();
    assert_eq!(c_values(&got), vec![15]);
}

#[test]
fn missing_composite_is_reported_with_suggestion() {
    let ts = TestStore::memory();
    scenarios::populate(&ts, 5);
    let q = Query::new("Item")
        .eq("a", 0)
        .eq("b", 0)
        .lt("c", 20)
        .order("-c")
        .finalize()
        .unwrap();
    match datastore::get_all(&ts, &q).unwrap_err().root() {
        StoreError::MissingIndex { suggested } => {
            assert_eq!(suggested.to_string(), "Item:a,b,-c");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn equality_queries_merge_builtin_indexes() {
    let ts = TestStore::memory();
    let keys = scenarios::populate(&ts, 30);
    let q = Query::new("Item").eq("a", 1).eq("b", 2).finalize().unwrap();
    assert_eq!(ts.store.explain(&q).unwrap().to_string(), "merge Item:a & Item:b forward");
    let got: Vec<Key> = datastore::get_all(&ts, &q)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    // a = i % 3 and b = i % 5, so i = 7 and i = 22.
    assert_eq!(got, vec![keys[6].clone(), keys[21].clone()]);
    assert!(ts.store.composite_indexes().is_empty());

    let parent = keys[0].clone();
    let child = ts.put(&parent.child("Item", 1), scenarios::item(1));
    ts.put(&parent.child("Item", 2), scenarios::item(2));
    let q = Query::new("Item").ancestor(parent).eq("a", 1).finalize().unwrap();
    let got = datastore::get_all(&ts, &q).unwrap();
    assert_eq!(got.len(), 2);
    assert_eq!(got[1].0, child);
}

#[test]
fn multi_valued_properties_match_each_value() {
    let ts = TestStore::auto_indexed();
    let k1 = ts.put(
        &ts.key("Item", 1),
        PropertyMap::new().with_values("tags", ["x", "y"]),
    );
    ts.put(&ts.key("Item", 2), PropertyMap::new().with_values("tags", ["y"]));
    let q = Query::new("Item").eq("tags", "x").finalize().unwrap();
    let got = datastore::get_all(&ts, &q).unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, k1);
    let q = Query::new("Item").eq("tags", "y").finalize().unwrap();
    assert_eq!(datastore::count(&ts, &q).unwrap(), 2);
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn conflicting_transaction_leaves_no_writes() {
    let ts = TestStore::memory();
    let key = ts.put(&ts.key("Counter", 1), PropertyMap::new().with("n", 0));
    let child = key.child("Entry", 1);
    let outer = ts.ctx.clone();

    let opts = TransactionOptions::default().attempts(1);
    let err = datastore::run_in_transaction(&ts, &opts, |tx| {
        datastore::get(tx, &key)?;
        datastore::put(&outer, &key, PropertyMap::new().with("n", 10))?;
        datastore::put(tx, &child, PropertyMap::new().with("from", "loser"))?;
        Ok(())
    })
    .unwrap_err();

    assert!(err.is_concurrent_transaction());
    assert!(datastore::get(&ts, &child).unwrap_err().is_not_found());
    let value = datastore::get(&ts, &key).unwrap();
    assert_eq!(value.first("n"), Some(&10.into()));
}

#[test]
fn conflicts_are_retried() {
    let ts = TestStore::memory();
    let key = ts.put(&ts.key("Counter", 1), PropertyMap::new().with("n", 0));
    let outer = ts.ctx.clone();
    let mut attempts = 0;

    datastore::run_in_transaction(&ts, &TransactionOptions::default(), |tx| {
        attempts += 1;
        let mut value = datastore::get(tx, &key)?;
        if attempts == 1 {
            datastore::put(&outer, &key, PropertyMap::new().with("n", 5))?;
        }
        let n = match value.first("n") {
            Some(PropertyValue::Int(n)) => *n,
            _ => 0,
        };
        value.set("n", n + 1);
        datastore::put(tx, &key, value).map(|_| ())
    })
    .unwrap();

    assert_eq!(attempts, 2);
    assert_eq!(datastore::get(&ts, &key).unwrap().first("n"), Some(&6.into()));
}

#[test]
fn concurrent_increments_are_serializable() {
    let ts = TestStore::memory();
    let config = StressConfig {
        threads: 4,
        increments: 25,
        groups: 1,
        attempts: 1000,
    };
    let r = concurrent_increments(&ts, &config);
    assert_eq!((r.exhausted, r.failed), (0, 0));
    assert_eq!(counter_total(&ts, 1), 100);
}

// ============================================================================
// Deferred callbacks
// ============================================================================

fn defer_push(tx: &Context, log: &Arc<Mutex<Vec<String>>>, entry: &str) {
    let log = Arc::clone(log);
    let entry = entry.to_string();
    txndefer::defer(tx, move |ctx| {
        assert!(!ctx.in_transaction());
        log.lock().push(entry);
    })
    .unwrap();
}

#[test]
fn deferred_callbacks_run_newest_first_after_commit() {
    let ts = TestStore::memory();
    let ctx = ts.ctx.with_filter(txndefer::filter());
    let log = Arc::new(Mutex::new(Vec::new()));
    let key = ts.key("Item", 1);

    datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tx| {
        defer_push(tx, &log, "first");
        defer_push(tx, &log, "second");
        datastore::put(tx, &key, PropertyMap::new())?;
        defer_push(tx, &log, "third");
        assert!(log.lock().is_empty());
        Ok(())
    })
    .unwrap();

    assert_eq!(*log.lock(), vec!["third", "second", "first"]);
}

#[test]
fn failed_transaction_runs_no_callbacks() {
    let ts = TestStore::memory();
    let ctx = ts.ctx.with_filter(txndefer::filter());
    let log = Arc::new(Mutex::new(Vec::new()));

    let err = datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tx| {
        defer_push(tx, &log, "never");
        Err(StoreError::other("boom"))
    })
    .unwrap_err();

    assert_eq!(err, StoreError::other("boom"));
    assert!(log.lock().is_empty());
}

#[test]
fn only_last_attempt_callbacks_survive() {
    let ts = TestStore::memory();
    let ctx = ts.ctx.with_filter(txndefer::filter());
    let key = ts.put(&ts.key("Item", 1), PropertyMap::new());
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut attempt = 0;

    datastore::run_in_transaction(&ctx, &TransactionOptions::default(), |tx| {
        attempt += 1;
        defer_push(tx, &log, &format!("attempt {attempt}"));
        datastore::get(tx, &key)?;
        if attempt == 1 {
            datastore::put(&ts.ctx, &key, PropertyMap::new().with("x", 1))?;
        }
        datastore::put(tx, &key, PropertyMap::new().with("x", 2)).map(|_| ())
    })
    .unwrap();

    assert_eq!(*log.lock(), vec!["attempt 2"]);
}

#[test]
fn defer_outside_transaction_is_a_usage_error() {
    let ts = TestStore::memory();
    let ctx = ts.ctx.with_filter(txndefer::filter());
    assert!(txndefer::defer(&ctx, |_| {}).unwrap_err().is_usage());
}

// ============================================================================
// Fault injection
// ============================================================================

#[test]
fn broken_feature_fails_until_restored() {
    let ts = scenarios::populated_store(3);
    let (ctx, breaker) = featurebreaker::filter_rds(&ts.ctx, None);
    let key = ts.key("Item", 1);

    breaker.break_features(Some(StoreError::Deadline), &[Feature::GetMulti]);
    assert!(datastore::get(&ctx, &key).unwrap_err().is_deadline());
    let q = Query::new("Item").finalize().unwrap();
    assert_eq!(datastore::count(&ctx, &q).unwrap(), 3);

    breaker.unbreak_features(&[Feature::GetMulti]);
    assert!(datastore::get(&ctx, &key).is_ok());
}

#[test]
fn certain_deadlines_fail_every_call() {
    let ts = scenarios::populated_store(3);
    let (ctx, breaker) = featurebreaker::filter_rds(&ts.ctx, None);
    let params = FlakyParams::default()
        .seed(1)
        .deadline_probability(1.0)
        .concurrent_transaction_probability(0.0);
    breaker.break_features_with_callback(flaky_errors(params), &DATASTORE_FEATURES);
    assert!(datastore::get(&ctx, &ts.key("Item", 1)).unwrap_err().is_deadline());
}

#[test]
fn flaky_commits_are_retried_to_completion() {
    let ts = TestStore::memory();
    let key = ts.put(&ts.key("Counter", 1), PropertyMap::new().with("n", 0));
    let (ctx, breaker) = featurebreaker::filter_rds(&ts.ctx, None);
    let (ctx, counter) = count::filter_rds(&ctx);
    let params = FlakyParams::default()
        .seed(42)
        .deadline_probability(0.0)
        .concurrent_transaction_probability(0.3);
    breaker.break_features_with_callback(flaky_errors(params), &DATASTORE_FEATURES);

    let opts = TransactionOptions::default().attempts(50);
    for _ in 0..20 {
        datastore::run_in_transaction(&ctx, &opts, |tx| {
            let mut value = datastore::get(tx, &key)?;
            let n = match value.first("n") {
                Some(PropertyValue::Int(n)) => *n,
                _ => 0,
            };
            value.set("n", n + 1);
            datastore::put(tx, &key, value).map(|_| ())
        })
        .unwrap();
    }

    assert_eq!(counter_total(&ts, 1), 20);
    let txns = &counter.run_in_transaction;
    assert_eq!(txns.successes(), 20);
    assert_eq!(txns.total(), 20 + txns.errors());
}
