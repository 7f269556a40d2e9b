//! Property-based test generators using proptest.
//!
//! Provides strategies for generating keys, property values and queries
//! that the in-memory backend accepts.

use dstore_model::{Key, KeyContext, KeyId, PropertyMap, PropertyValue, Query};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Key context used by generated keys. Matches the default store config.
pub fn test_key_context() -> KeyContext {
    KeyContext::new("dev~app", "")
}

/// Strategy for root keys of `kind` with positive integer ids.
pub fn root_key_strategy(kind: &'static str) -> impl Strategy<Value = Key> {
    (1i64..10_000).prop_map(move |id| test_key_context().key(kind, id))
}

/// Strategy for complete keys one or two tokens long.
pub fn key_strategy() -> impl Strategy<Value = Key> {
    (
        root_key_strategy("Parent"),
        prop::option::of(prop_oneof![
            (1i64..1_000).prop_map(KeyId::Int),
            "[a-z]{1,8}".prop_map(KeyId::Name),
        ]),
    )
        .prop_map(|(root, child)| match child {
            Some(id) => root.child("Item", id),
            None => root,
        })
}

/// Strategy for indexable property values of every type.
pub fn property_value_strategy() -> impl Strategy<Value = PropertyValue> {
    prop_oneof![
        any::<i64>().prop_map(PropertyValue::Int),
        any::<bool>().prop_map(PropertyValue::Bool),
        "[a-z]{0,8}".prop_map(PropertyValue::Text),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(PropertyValue::Bytes),
        (-1.0e6f64..1.0e6).prop_map(PropertyValue::Float),
    ]
}

/// Strategy for items with a small value domain.
///
/// `a` and `b` take few distinct values so equality filters match several
/// entities; `c` spreads wider for ranges and sort orders; `tags` is
/// multi-valued.
pub fn item_strategy() -> impl Strategy<Value = PropertyMap> {
    (
        0i64..3,
        0i64..4,
        0i64..50,
        prop::collection::btree_set("[a-d]", 0..3),
    )
        .prop_map(|(a, b, c, tags)| {
            PropertyMap::new()
                .with("a", a)
                .with("b", b)
                .with("c", c)
                .with_values("tags", tags)
        })
}

/// Strategy for up to `max` items.
pub fn items_strategy(max: usize) -> impl Strategy<Value = Vec<PropertyMap>> {
    prop::collection::vec(item_strategy(), 0..max)
}

/// Sort orders [`query_strategy`] picks from. Empty means key order.
const ORDERS: [&str; 5] = ["", "c", "-c", "tags", "-tags"];

/// Strategy for queries over items of `kind`.
///
/// Queries combine an optional equality on `a`, an optional `IN` on `b`,
/// an optional bound on `c` and a sort on `c` or the multi-valued `tags`.
/// Results are whole entities, keys, a projection of `b` (optionally
/// distinct) or a projection of `tags`. Serving them may need a composite
/// index, so run them against an auto-indexed store.
pub fn query_strategy(kind: &'static str) -> impl Strategy<Value = Query> {
    (
        prop::option::of(0i64..3),
        prop::option::of(prop::collection::btree_set(0i64..4, 1..3)),
        prop::option::of((0i64..50, any::<bool>())),
        prop::sample::select(ORDERS.to_vec()),
        0usize..5,
        prop::option::of(1u32..20),
        prop::option::of(1u32..4),
    )
        .prop_map(move |(a, b_in, bound, order, shape, limit, offset)| {
            let mut q = Query::new(kind);
            if let Some(a) = a {
                q = q.eq("a", a);
            }
            if let Some(values) = b_in {
                q = q.eq_any("b", values);
            }
            // The inequality property has to lead the sort.
            if !order.contains("tags") {
                if let Some((c, lower)) = bound {
                    q = if lower { q.ge("c", c) } else { q.lt("c", c) };
                }
            }
            if !order.is_empty() {
                q = q.order(order);
            }
            q = match shape {
                1 => q.project(["b"]),
                2 => q.project(["b"]).distinct(true),
                3 => q.project(["tags"]),
                4 => q.keys_only(true),
                _ => q,
            };
            if let Some(limit) = limit {
                q = q.limit(limit);
            }
            if let Some(offset) = offset {
                q = q.offset(offset);
            }
            q
        })
}

/// Strategy for a set of positions below `n`.
pub fn dropped_positions_strategy(n: usize) -> impl Strategy<Value = BTreeSet<usize>> {
    prop::collection::vec(any::<bool>(), n).prop_map(|mask| {
        mask.into_iter()
            .enumerate()
            .filter_map(|(i, dropped)| dropped.then_some(i))
            .collect()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to a proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
