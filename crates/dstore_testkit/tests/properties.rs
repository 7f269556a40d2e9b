//! Property tests for batching, cursors and argument compaction.

use dstore_model::{Cursor, Key, PropertyMap, Query};
use dstore_raw::{datastore, with_batching, with_query_batch_size, StoreError};
use dstore_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

fn store_with(items: &[PropertyMap]) -> TestStore {
    let ts = TestStore::auto_indexed();
    let keys: Vec<Key> = (1..=items.len() as i64).map(|i| ts.key("Item", i)).collect();
    if !keys.is_empty() {
        ts.put_all(&keys, items);
    }
    ts
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn batched_queries_match_unbatched(
        items in items_strategy(40),
        q in query_strategy("Item"),
        batch in 1u32..7,
    ) {
        let ts = store_with(&items);
        let fq = q.finalize().unwrap();
        let unbatched = datastore::get_all(&with_batching(&ts, false), &fq).unwrap();
        // Explicit batching also splits projection and distinct queries.
        let ctx = with_batching(&with_query_batch_size(&ts, batch), true);
        let batched = datastore::get_all(&ctx, &fq).unwrap();
        prop_assert_eq!(batched, unbatched);
    }

    #[test]
    fn cursor_paging_matches_single_run(
        items in items_strategy(40),
        q in query_strategy("Item"),
        page in 1u32..6,
    ) {
        let ts = store_with(&items);
        let fq = q.finalize().unwrap().with_limit(None).with_offset(None);
        let all = datastore::get_all(&ts, &fq).unwrap();

        let mut paged = Vec::new();
        let mut start = None;
        loop {
            let page_q = fq.with_limit(Some(page)).with_start(start.take()).unwrap();
            let mut delivered = 0;
            let mut last = None;
            datastore::run(&ts, &page_q, |item| {
                delivered += 1;
                last = Some(item.cursor().to_bytes()?);
                paged.push((item.key, item.value));
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
            match last {
                Some(bytes) if delivered == page => {
                    start = Some(Cursor::from_bytes(&bytes).unwrap());
                }
                _ => break,
            }
        }
        prop_assert_eq!(paged, all);
    }

    #[test]
    fn counts_match_delivered_records(
        items in items_strategy(30),
        q in query_strategy("Item"),
    ) {
        let ts = store_with(&items);
        let fq = q.finalize().unwrap();
        let n = datastore::get_all(&ts, &fq).unwrap().len() as u64;
        prop_assert_eq!(datastore::count(&ts, &fq).unwrap(), n);
    }

    #[test]
    fn invalid_positions_fail_in_place(dropped in dropped_positions_strategy(9)) {
        let ts = TestStore::memory();
        let keys: Vec<Key> = (1..=9)
            .map(|i| {
                let key = ts.key("Item", i);
                ts.put(&key, PropertyMap::new().with("i", i));
                key
            })
            .collect();
        let args: Vec<Key> = keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                if dropped.contains(&i) {
                    Key::incomplete(ts.key_context(), "Item")
                } else {
                    k.clone()
                }
            })
            .collect();

        let got = datastore::get_multi(&ts, &args);
        prop_assert_eq!(got.len(), 9);
        let failed: BTreeSet<usize> = got
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r, Err(StoreError::InvalidKey(_))))
            .map(|(i, _)| i)
            .collect();
        prop_assert_eq!(&failed, &dropped);
        for (i, r) in got.into_iter().enumerate() {
            if let Ok(value) = r {
                prop_assert_eq!(value.first("i"), Some(&(i as i64 + 1).into()));
            }
        }
    }

    #[test]
    fn unknown_kinds_return_nothing(q in query_strategy("Missing")) {
        let ts = store_with(&[PropertyMap::new().with("a", 1).with("c", 1)]);
        let fq = q.finalize().unwrap();
        prop_assert!(datastore::get_all(&ts, &fq).unwrap().is_empty());
    }
}

#[test]
fn empty_query_over_empty_store() {
    let ts = TestStore::memory();
    let q = Query::new("Item").finalize().unwrap();
    assert_eq!(datastore::count(&ts, &q).unwrap(), 0);
}
