//! Dropping invalid positions from batch arguments.
//!
//! A backend marks the positions it cannot forward, compacts the argument
//! slices, runs the smaller batch and maps each compacted result index back
//! to the caller's index with [`DroppedArgLookup::original_index`].

use dstore_model::{Key, PropertyMap};
use std::borrow::Cow;

/// Sorted set of dropped argument positions.
///
/// Marking nothing allocates nothing, and compacting then borrows the
/// input. A tracker is scoped to a single call and is not shared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DroppedArgTracker(Vec<usize>);

impl DroppedArgTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks position `index` of an `n`-element batch as dropped.
    ///
    /// # Panics
    ///
    /// Panics if `index >= n`; that is a caller bug.
    pub fn mark_for_removal(&mut self, index: usize, n: usize) {
        assert!(index < n, "dropped index {index} out of range for batch of {n}");
        if self.0.is_empty() {
            self.0.reserve_exact(n);
        }
        match self.0.last() {
            Some(&last) if last < index => self.0.push(index),
            None => self.0.push(index),
            Some(_) => {
                if let Err(pos) = self.0.binary_search(&index) {
                    self.0.insert(pos, index);
                }
            }
        }
    }

    /// Marks every key that is not valid.
    ///
    /// Returns the dropped positions that were newly marked.
    pub fn mark_invalid_keys(&mut self, keys: &[Key], allow_incomplete: bool) -> Vec<usize> {
        let mut marked = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            if !key.is_valid(allow_incomplete) {
                self.mark_for_removal(i, keys.len());
                marked.push(i);
            }
        }
        marked
    }

    /// Returns the number of dropped positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing was dropped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `index` was dropped.
    #[must_use]
    pub fn is_dropped(&self, index: usize) -> bool {
        self.0.binary_search(&index).is_ok()
    }

    /// Compacts `keys`.
    #[must_use]
    pub fn drop_keys<'a>(&self, keys: &'a [Key]) -> (Cow<'a, [Key]>, DroppedArgLookup) {
        (self.compact(keys), self.lookup(keys.len()))
    }

    /// Compacts `keys` and the parallel `meta` slice.
    ///
    /// # Panics
    ///
    /// Panics if the slices differ in length.
    #[must_use]
    pub fn drop_keys_and_meta<'a>(
        &self,
        keys: &'a [Key],
        meta: &'a [PropertyMap],
    ) -> (Cow<'a, [Key]>, Cow<'a, [PropertyMap]>, DroppedArgLookup) {
        assert_eq!(keys.len(), meta.len(), "mismatched keys and meta");
        (
            self.compact(keys),
            self.compact(meta),
            self.lookup(keys.len()),
        )
    }

    /// Compacts `keys` and the parallel `values` slice.
    ///
    /// # Panics
    ///
    /// Panics if the slices differ in length.
    #[must_use]
    pub fn drop_keys_and_values<'a>(
        &self,
        keys: &'a [Key],
        values: &'a [PropertyMap],
    ) -> (Cow<'a, [Key]>, Cow<'a, [PropertyMap]>, DroppedArgLookup) {
        assert_eq!(keys.len(), values.len(), "mismatched keys and values");
        (
            self.compact(keys),
            self.compact(values),
            self.lookup(keys.len()),
        )
    }

    fn compact<'a, T: Clone>(&self, items: &'a [T]) -> Cow<'a, [T]> {
        if self.0.is_empty() {
            return Cow::Borrowed(items);
        }
        let n = items.len();
        let mut out = Vec::with_capacity(n.saturating_sub(self.0.len()));
        let mut start = 0;
        for &dropped in &self.0 {
            assert!(dropped < n, "dropped index {dropped} out of range for batch of {n}");
            out.extend_from_slice(&items[start..dropped]);
            start = dropped + 1;
        }
        out.extend_from_slice(&items[start..]);
        Cow::Owned(out)
    }

    fn lookup(&self, n: usize) -> DroppedArgLookup {
        if self.0.is_empty() {
            return DroppedArgLookup(Vec::new());
        }
        let mut runs = Vec::new();
        let mut start = 0;
        let mut reduced = 0;
        for &dropped in self.0.iter().chain(std::iter::once(&n)) {
            if dropped > start {
                runs.push((reduced, start));
                reduced += dropped - start;
            }
            start = dropped + 1;
        }
        DroppedArgLookup(runs)
    }
}

/// Maps compacted indices back to original positions.
///
/// Stores one `(compacted, original)` start pair per run of kept positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DroppedArgLookup(Vec<(usize, usize)>);

impl DroppedArgLookup {
    /// Returns the original position of compacted index `reduced`.
    #[must_use]
    pub fn original_index(&self, reduced: usize) -> usize {
        let run = self.0.partition_point(|&(r, _)| r <= reduced);
        match run.checked_sub(1).map(|i| self.0[i]) {
            Some((r, o)) => o + (reduced - r),
            None => reduced,
        }
    }
}
