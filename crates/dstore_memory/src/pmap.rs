//! Persistent ordered map.
//!
//! An AVL tree whose nodes are shared through `Arc`. Cloning a map is
//! O(1), and every update copies only the path from the root to the
//! changed node, so older clones keep seeing their own contents. This is
//! what lets a committed version be read while the next one is built.

use std::cmp::Ordering;
use std::ops::Bound;
use std::sync::Arc;

type Link<K, V> = Option<Arc<Node<K, V>>>;

struct Node<K, V> {
    key: K,
    value: V,
    height: u32,
    left: Link<K, V>,
    right: Link<K, V>,
}

fn height<K, V>(link: &Link<K, V>) -> u32 {
    link.as_ref().map_or(0, |n| n.height)
}

fn make<K, V>(key: K, value: V, left: Link<K, V>, right: Link<K, V>) -> Arc<Node<K, V>> {
    let height = 1 + height(&left).max(height(&right));
    Arc::new(Node {
        key,
        value,
        height,
        left,
        right,
    })
}

impl<K: Ord + Clone, V: Clone> Node<K, V> {
    fn with_left(&self, left: Link<K, V>) -> Arc<Self> {
        balance(self.key.clone(), self.value.clone(), left, self.right.clone())
    }

    fn with_right(&self, right: Link<K, V>) -> Arc<Self> {
        balance(self.key.clone(), self.value.clone(), self.left.clone(), right)
    }
}

fn balance<K: Clone, V: Clone>(
    key: K,
    value: V,
    left: Link<K, V>,
    right: Link<K, V>,
) -> Arc<Node<K, V>> {
    let (hl, hr) = (height(&left), height(&right));
    if hl > hr + 1 {
        if let Some(l) = &left {
            if height(&l.left) >= height(&l.right) {
                return make(
                    l.key.clone(),
                    l.value.clone(),
                    l.left.clone(),
                    Some(make(key, value, l.right.clone(), right)),
                );
            }
            if let Some(lr) = &l.right {
                return make(
                    lr.key.clone(),
                    lr.value.clone(),
                    Some(make(l.key.clone(), l.value.clone(), l.left.clone(), lr.left.clone())),
                    Some(make(key, value, lr.right.clone(), right)),
                );
            }
        }
    } else if hr > hl + 1 {
        if let Some(r) = &right {
            if height(&r.right) >= height(&r.left) {
                return make(
                    r.key.clone(),
                    r.value.clone(),
                    Some(make(key, value, left, r.left.clone())),
                    r.right.clone(),
                );
            }
            if let Some(rl) = &r.left {
                return make(
                    rl.key.clone(),
                    rl.value.clone(),
                    Some(make(key, value, left, rl.left.clone())),
                    Some(make(r.key.clone(), r.value.clone(), rl.right.clone(), r.right.clone())),
                );
            }
        }
    }
    make(key, value, left, right)
}

fn insert<K: Ord + Clone, V: Clone>(
    link: &Link<K, V>,
    key: K,
    value: V,
) -> (Arc<Node<K, V>>, Option<V>) {
    let Some(node) = link else {
        return (make(key, value, None, None), None);
    };
    match key.cmp(&node.key) {
        Ordering::Less => {
            let (left, old) = insert(&node.left, key, value);
            (node.with_left(Some(left)), old)
        }
        Ordering::Greater => {
            let (right, old) = insert(&node.right, key, value);
            (node.with_right(Some(right)), old)
        }
        Ordering::Equal => {
            let old = node.value.clone();
            let replaced = Arc::new(Node {
                key,
                value,
                height: node.height,
                left: node.left.clone(),
                right: node.right.clone(),
            });
            (replaced, Some(old))
        }
    }
}

fn remove_min<K: Ord + Clone, V: Clone>(node: &Node<K, V>) -> (Link<K, V>, K, V) {
    match &node.left {
        None => (node.right.clone(), node.key.clone(), node.value.clone()),
        Some(left) => {
            let (left, k, v) = remove_min(left);
            (Some(node.with_left(left)), k, v)
        }
    }
}

fn remove<K: Ord + Clone, V: Clone>(link: &Link<K, V>, key: &K) -> Option<(Link<K, V>, V)> {
    let node = link.as_ref()?;
    match key.cmp(&node.key) {
        Ordering::Less => {
            let (left, old) = remove(&node.left, key)?;
            Some((Some(node.with_left(left)), old))
        }
        Ordering::Greater => {
            let (right, old) = remove(&node.right, key)?;
            Some((Some(node.with_right(right)), old))
        }
        Ordering::Equal => {
            let old = node.value.clone();
            let rest = match (&node.left, &node.right) {
                (None, right) => right.clone(),
                (left, None) => left.clone(),
                (left, Some(right)) => {
                    let (right, k, v) = remove_min(right);
                    Some(balance(k, v, left.clone(), right))
                }
            };
            Some((rest, old))
        }
    }
}

fn above<K: Ord>(key: &K, lower: &Bound<K>) -> bool {
    match lower {
        Bound::Included(b) => key >= b,
        Bound::Excluded(b) => key > b,
        Bound::Unbounded => true,
    }
}

fn below<K: Ord>(key: &K, upper: &Bound<K>) -> bool {
    match upper {
        Bound::Included(b) => key <= b,
        Bound::Excluded(b) => key < b,
        Bound::Unbounded => true,
    }
}

/// A persistent ordered map.
pub struct PMap<K, V> {
    root: Link<K, V>,
    len: usize,
}

impl<K, V> Clone for PMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for PMap<K, V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<K, V> std::fmt::Debug for PMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PMap").field("len", &self.len).finish()
    }
}

impl<K: Ord + Clone, V: Clone> PMap<K, V> {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Looks up `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut link = &self.root;
        while let Some(node) = link {
            link = match key.cmp(&node.key) {
                Ordering::Less => &node.left,
                Ordering::Greater => &node.right,
                Ordering::Equal => return Some(&node.value),
            };
        }
        None
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Inserts an entry, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let (root, old) = insert(&self.root, key, value);
        self.root = Some(root);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    /// Removes an entry, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (root, old) = remove(&self.root, key)?;
        self.root = root;
        self.len -= 1;
        Some(old)
    }

    /// Iterates over all entries in ascending order.
    #[must_use]
    pub fn iter(&self) -> Range<'_, K, V> {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    /// Iterates over the entries between `lower` and `upper`, ascending.
    #[must_use]
    pub fn range(&self, lower: Bound<K>, upper: Bound<K>) -> Range<'_, K, V> {
        let mut stack = Vec::new();
        let mut link = &self.root;
        while let Some(node) = link {
            if above(&node.key, &lower) {
                stack.push(&**node);
                link = &node.left;
            } else {
                link = &node.right;
            }
        }
        Range {
            stack,
            lower,
            upper,
            reverse: false,
        }
    }

    /// Iterates over the entries between `lower` and `upper`, descending.
    #[must_use]
    pub fn range_rev(&self, lower: Bound<K>, upper: Bound<K>) -> Range<'_, K, V> {
        let mut stack = Vec::new();
        let mut link = &self.root;
        while let Some(node) = link {
            if below(&node.key, &upper) {
                stack.push(&**node);
                link = &node.right;
            } else {
                link = &node.left;
            }
        }
        Range {
            stack,
            lower,
            upper,
            reverse: true,
        }
    }
}

/// Iterator over a key range of a [`PMap`].
pub struct Range<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    lower: Bound<K>,
    upper: Bound<K>,
    reverse: bool,
}

impl<'a, K: Ord, V> Iterator for Range<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let in_range = if self.reverse {
            above(&node.key, &self.lower)
        } else {
            below(&node.key, &self.upper)
        };
        if !in_range {
            self.stack.clear();
            return None;
        }
        let mut link = if self.reverse { &node.left } else { &node.right };
        while let Some(next) = link {
            self.stack.push(&**next);
            link = if self.reverse { &next.right } else { &next.left };
        }
        Some((&node.key, &node.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn check_balanced<K, V>(link: &Link<K, V>) -> u32 {
        match link {
            None => 0,
            Some(n) => {
                let (l, r) = (check_balanced(&n.left), check_balanced(&n.right));
                assert!(l.abs_diff(r) <= 1, "unbalanced node");
                assert_eq!(n.height, 1 + l.max(r));
                n.height
            }
        }
    }

    #[test]
    fn insert_get_remove() {
        let mut m = PMap::new();
        for i in 0..100 {
            assert_eq!(m.insert(i, i * 2), None);
        }
        assert_eq!(m.len(), 100);
        assert_eq!(m.get(&42), Some(&84));
        assert_eq!(m.insert(42, 0), Some(84));
        assert_eq!(m.remove(&42), Some(0));
        assert_eq!(m.remove(&42), None);
        assert_eq!(m.len(), 99);
        check_balanced(&m.root);
    }

    #[test]
    fn clones_are_snapshots() {
        let mut m = PMap::new();
        m.insert("a", 1);
        let snap = m.clone();
        m.insert("b", 2);
        m.remove(&"a");
        assert_eq!(snap.get(&"a"), Some(&1));
        assert!(!snap.contains_key(&"b"));
        assert_eq!(m.iter().map(|(k, _)| *k).collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn ranges_respect_bounds() {
        let mut m = PMap::new();
        for i in 0..10 {
            m.insert(i, ());
        }
        let fwd: Vec<_> = m
            .range(Bound::Excluded(2), Bound::Included(5))
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(fwd, vec![3, 4, 5]);
        let rev: Vec<_> = m
            .range_rev(Bound::Included(2), Bound::Excluded(5))
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(rev, vec![4, 3, 2]);
        assert_eq!(m.range(Bound::Excluded(9), Bound::Unbounded).count(), 0);
    }

    proptest! {
        #[test]
        fn behaves_like_btreemap(ops in prop::collection::vec((any::<bool>(), 0u8..64, any::<u16>()), 0..200)) {
            let mut ours = PMap::new();
            let mut reference = BTreeMap::new();
            for (is_insert, k, v) in ops {
                if is_insert {
                    prop_assert_eq!(ours.insert(k, v), reference.insert(k, v));
                } else {
                    prop_assert_eq!(ours.remove(&k), reference.remove(&k));
                }
            }
            check_balanced(&ours.root);
            prop_assert_eq!(ours.len(), reference.len());
            let a: Vec<_> = ours.iter().map(|(k, v)| (*k, *v)).collect();
            let b: Vec<_> = reference.iter().map(|(k, v)| (*k, *v)).collect();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn ranges_match_btreemap(keys in prop::collection::btree_set(0u8..100, 0..50), lo in 0u8..100, hi in 0u8..100) {
            let mut ours = PMap::new();
            for k in &keys {
                ours.insert(*k, ());
            }
            let expected: Vec<u8> = keys.iter().copied().filter(|k| *k >= lo && *k < hi).collect();
            let fwd: Vec<u8> = ours.range(Bound::Included(lo), Bound::Excluded(hi)).map(|(k, _)| *k).collect();
            let mut rev: Vec<u8> = ours.range_rev(Bound::Included(lo), Bound::Excluded(hi)).map(|(k, _)| *k).collect();
            rev.reverse();
            prop_assert_eq!(&fwd, &expected);
            prop_assert_eq!(&rev, &expected);
        }
    }
}
