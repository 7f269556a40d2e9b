//! Index selection.
//!
//! A query is served by a single index scan. The chosen index starts with
//! the equality and `IN` properties in any order, followed by the sort
//! orders (the inequality property first), either exactly or exactly
//! reversed. Any remaining columns are extras: they are allowed but force
//! the executor to re-sort rows that tie on the sort orders.
//!
//! Among fitting indexes the one with the fewest extras wins, then
//! built-ins, then declaration order. Kindless queries and queries with no
//! property constraints scan the entity map or kind index directly.
//!
//! When nothing fits, an equality-only query (no sort beyond `__key__`, no
//! projection) is served by intersecting built-in scans in key order: one
//! per equality property, plus the kind index for the ancestor range.

use crate::version::Version;
use dstore_model::{FinalizedQuery, IndexColumn, IndexDefinition, KEY_PROPERTY};
use dstore_raw::{StoreError, StoreResult};
use std::collections::BTreeSet;
use std::fmt;

/// Where a plan reads rows from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSource {
    /// The entity map in key order. Used for kindless queries.
    Entities,
    /// An index partition.
    Index(IndexDefinition),
    /// Built-in partitions whose key streams are intersected.
    MergeJoin(Vec<IndexDefinition>),
}

/// The chosen access path for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    source: ScanSource,
    reverse: bool,
    eq_columns: usize,
    extras: usize,
}

impl Plan {
    /// Returns the scan source.
    #[must_use]
    pub fn source(&self) -> &ScanSource {
        &self.source
    }

    /// Returns the scanned index, if any.
    #[must_use]
    pub fn index(&self) -> Option<&IndexDefinition> {
        match &self.source {
            ScanSource::Index(def) => Some(def),
            ScanSource::Entities | ScanSource::MergeJoin(_) => None,
        }
    }

    /// Returns true if the index is scanned backwards.
    #[must_use]
    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Number of leading equality columns.
    #[must_use]
    pub fn eq_columns(&self) -> usize {
        self.eq_columns
    }

    /// Number of trailing columns beyond the query's needs.
    #[must_use]
    pub fn extras(&self) -> usize {
        self.extras
    }

    /// Returns whether `property` is read in descending value order, or
    /// `None` if the index has no such column.
    #[must_use]
    pub fn scans_descending(&self, property: &str) -> Option<bool> {
        let def = self.index()?;
        let col = def.columns.iter().find(|c| c.property == property)?;
        Some(col.descending != self.reverse)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.reverse { "reverse" } else { "forward" };
        match &self.source {
            ScanSource::Entities => write!(f, "scan entities {dir}"),
            ScanSource::Index(def) => {
                write!(f, "scan {def} {dir}")?;
                if self.extras > 0 {
                    write!(f, " ({} extra columns)", self.extras)?;
                }
                Ok(())
            }
            ScanSource::MergeJoin(defs) => {
                let names: Vec<String> = defs.iter().map(ToString::to_string).collect();
                write!(f, "merge {} {dir}", names.join(" & "))
            }
        }
    }
}

/// The parts of a query that decide which indexes fit.
struct Shape<'q> {
    kind: &'q str,
    ancestor: bool,
    eq: BTreeSet<&'q str>,
    suffix: Vec<IndexColumn>,
    key_desc: bool,
    projection: BTreeSet<&'q str>,
}

impl<'q> Shape<'q> {
    fn of(fq: &'q FinalizedQuery) -> Self {
        let eq: BTreeSet<&str> = fq
            .eq_filters()
            .keys()
            .chain(fq.in_filters().keys())
            .map(String::as_str)
            .collect();
        let suffix = fq
            .orders()
            .iter()
            .filter(|o| o.property != KEY_PROPERTY && !eq.contains(o.property.as_str()))
            .cloned()
            .collect();
        let key_desc = fq
            .orders()
            .first()
            .is_some_and(|o| o.property == KEY_PROPERTY && o.descending);
        Self {
            kind: fq.kind(),
            ancestor: fq.ancestor().is_some(),
            eq,
            suffix,
            key_desc,
            projection: fq.projection().iter().map(String::as_str).collect(),
        }
    }

    fn is_kind_scan(&self) -> bool {
        self.eq.is_empty() && self.suffix.is_empty() && self.projection.is_empty()
    }

    /// Returns `(reverse, extras)` if `def` can serve this shape.
    fn fit(&self, def: &IndexDefinition) -> Option<(bool, usize)> {
        let (n, s) = (self.eq.len(), self.suffix.len());
        if def.kind != self.kind || def.ancestor != self.ancestor || def.columns.len() < n + s {
            return None;
        }
        let head: BTreeSet<&str> = def.columns[..n].iter().map(|c| c.property.as_str()).collect();
        if head != self.eq {
            return None;
        }
        let mid = &def.columns[n..n + s];
        let reverse = if s == 0 {
            self.key_desc
        } else if mid == self.suffix.as_slice() {
            false
        } else if mid.iter().zip(&self.suffix).all(|(c, o)| *c == o.reversed()) {
            true
        } else {
            return None;
        };
        let covered = self
            .projection
            .iter()
            .all(|p| def.columns.iter().any(|c| c.property == *p));
        covered.then_some((reverse, def.columns.len() - n - s))
    }

    /// The smallest composite index that serves this shape.
    fn suggestion(&self) -> IndexDefinition {
        let mut columns: Vec<IndexColumn> = self.eq.iter().map(|p| IndexColumn::asc(*p)).collect();
        columns.extend(self.suffix.iter().cloned());
        for p in &self.projection {
            if !columns.iter().any(|c| c.property == *p) {
                columns.push(IndexColumn::asc(*p));
            }
        }
        IndexDefinition::new(self.kind, self.ancestor, columns)
    }

    /// Built-in scans to intersect for an equality-only shape.
    fn merge_join(&self) -> Option<Vec<IndexDefinition>> {
        if self.eq.is_empty() || !self.suffix.is_empty() || !self.projection.is_empty() {
            return None;
        }
        let mut defs = Vec::new();
        if self.ancestor {
            defs.push(IndexDefinition::kind_only(self.kind));
        }
        defs.extend(
            self.eq
                .iter()
                .map(|p| IndexDefinition::single(self.kind, IndexColumn::asc(*p))),
        );
        (defs.len() > 1).then_some(defs)
    }

    fn builtins(&self) -> Vec<IndexDefinition> {
        if self.ancestor {
            return Vec::new();
        }
        let needed: BTreeSet<&str> = self
            .eq
            .iter()
            .copied()
            .chain(self.suffix.iter().map(|c| c.property.as_str()))
            .chain(self.projection.iter().copied())
            .collect();
        match needed.into_iter().collect::<Vec<_>>().as_slice() {
            [p] => vec![
                IndexDefinition::single(self.kind, IndexColumn::asc(*p)),
                IndexDefinition::single(self.kind, IndexColumn::desc(*p)),
            ],
            _ => Vec::new(),
        }
    }
}

/// Chooses how `fq` is served from `version`.
///
/// # Errors
///
/// Returns [`StoreError::MissingIndex`] carrying the smallest suitable
/// definition when no declared or built-in index fits and the shape cannot
/// be merge-joined.
pub fn plan(fq: &FinalizedQuery, version: &Version) -> StoreResult<Plan> {
    let shape = Shape::of(fq);
    if shape.kind.is_empty() {
        return Ok(Plan {
            source: ScanSource::Entities,
            reverse: shape.key_desc,
            eq_columns: 0,
            extras: 0,
        });
    }
    if shape.is_kind_scan() {
        return Ok(Plan {
            source: ScanSource::Index(IndexDefinition::kind_only(shape.kind)),
            reverse: shape.key_desc,
            eq_columns: 0,
            extras: 0,
        });
    }

    let candidates: Vec<IndexDefinition> = shape
        .builtins()
        .into_iter()
        .chain(version.composites.iter().filter(|d| d.kind == shape.kind).cloned())
        .collect();
    let best = candidates
        .into_iter()
        .enumerate()
        .filter_map(|(pos, def)| {
            let (reverse, extras) = shape.fit(&def)?;
            Some(((extras, !def.is_builtin(), pos), def, reverse))
        })
        .min_by(|a, b| a.0.cmp(&b.0));

    match best {
        Some(((extras, _, _), def, reverse)) => Ok(Plan {
            source: ScanSource::Index(def),
            reverse,
            eq_columns: shape.eq.len(),
            extras,
        }),
        None => match shape.merge_join() {
            Some(defs) => Ok(Plan {
                source: ScanSource::MergeJoin(defs),
                reverse: shape.key_desc,
                eq_columns: shape.eq.len(),
                extras: 0,
            }),
            None => Err(StoreError::MissingIndex {
                suggested: shape.suggestion(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstore_model::{KeyContext, Query};

    fn with_indexes(defs: &[&str]) -> Version {
        let mut v = Version::default();
        for d in defs {
            v.add_index(&d.parse().unwrap());
        }
        v
    }

    fn plan_for(q: Query, v: &Version) -> StoreResult<Plan> {
        plan(&q.finalize().unwrap(), v)
    }

    #[test]
    fn kind_and_kindless_scans() {
        let v = Version::default();
        let p = plan_for(Query::new("Item"), &v).unwrap();
        assert_eq!(p.index(), Some(&IndexDefinition::kind_only("Item")));
        let p = plan_for(Query::new("Item").order("-__key__"), &v).unwrap();
        assert!(p.is_reverse());
        let p = plan_for(Query::new(""), &v).unwrap();
        assert_eq!(p.source(), &ScanSource::Entities);
    }

    #[test]
    fn single_property_uses_builtin() {
        let v = Version::default();
        let p = plan_for(Query::new("Item").eq("a", 1), &v).unwrap();
        assert_eq!(p.index().unwrap().to_string(), "Item:a");
        let p = plan_for(Query::new("Item").order("-a"), &v).unwrap();
        assert_eq!(p.scans_descending("a"), Some(true));
        assert_eq!(p.extras(), 0);
    }

    #[test]
    fn composite_with_descending_column() {
        let v = with_indexes(&["Item:a,b,-c"]);
        let q = Query::new("Item").eq("a", 1).eq("b", 2).lt("c", 5).order("-c");
        let p = plan_for(q, &v).unwrap();
        assert_eq!(p.index().unwrap().to_string(), "Item:a,b,-c");
        assert!(!p.is_reverse());
        assert_eq!(p.scans_descending("c"), Some(true));
    }

    #[test]
    fn ascending_composite_is_scanned_backwards() {
        let v = with_indexes(&["Item:b,a,c"]);
        let q = Query::new("Item").eq("a", 1).eq("b", 2).order("-c");
        let p = plan_for(q, &v).unwrap();
        assert!(p.is_reverse());
        assert_eq!(p.scans_descending("c"), Some(true));
    }

    #[test]
    fn fewest_extras_wins() {
        let v = with_indexes(&["Item:a,b,c,d", "Item:a,b,c"]);
        let q = Query::new("Item").eq("a", 1).order("b");
        let p = plan_for(q, &v).unwrap();
        assert_eq!(p.index().unwrap().to_string(), "Item:a,b,c");
        assert_eq!(p.extras(), 1);
    }

    #[test]
    fn missing_index_suggests_definition() {
        let v = Version::default();
        let q = Query::new("Item").eq("b", 1).eq("a", 2).order("-c");
        match plan_for(q, &v) {
            Err(StoreError::MissingIndex { suggested }) => {
                assert_eq!(suggested.to_string(), "Item:a,b,-c");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ancestor_queries_need_ancestor_indexes() {
        let anc = KeyContext::default().key("Parent", 1);
        let v = with_indexes(&["Item:a"]);
        let q = Query::new("Item").ancestor(anc.clone()).order("a");
        assert!(matches!(plan_for(q.clone(), &v), Err(StoreError::MissingIndex { .. })));

        let v = with_indexes(&["Item/ancestor:a"]);
        let p = plan_for(q, &v).unwrap();
        assert!(p.index().unwrap().ancestor);

        let p = plan_for(Query::new("Item").ancestor(anc), &Version::default()).unwrap();
        assert_eq!(p.index(), Some(&IndexDefinition::kind_only("Item")));
    }

    #[test]
    fn equalities_merge_join_builtins() {
        let q = Query::new("Item").eq("a", 1).eq("b", 2);
        let p = plan_for(q.clone(), &Version::default()).unwrap();
        assert_eq!(
            p.source(),
            &ScanSource::MergeJoin(vec![
                IndexDefinition::single("Item", IndexColumn::asc("a")),
                IndexDefinition::single("Item", IndexColumn::asc("b")),
            ])
        );
        assert_eq!(p.to_string(), "merge Item:a & Item:b forward");
        assert_eq!(p.index(), None);

        let p = plan_for(q.clone().order("-__key__"), &Version::default()).unwrap();
        assert!(p.is_reverse());

        // A declared composite is a single scan and wins.
        let p = plan_for(q, &with_indexes(&["Item:b,a"])).unwrap();
        assert_eq!(p.index().unwrap().to_string(), "Item:b,a");
    }

    #[test]
    fn ancestor_equality_merges_with_kind_index() {
        let anc = KeyContext::default().key("Parent", 1);
        let q = Query::new("Item").ancestor(anc).eq("a", 1);
        let p = plan_for(q, &Version::default()).unwrap();
        assert_eq!(
            p.source(),
            &ScanSource::MergeJoin(vec![
                IndexDefinition::kind_only("Item"),
                IndexDefinition::single("Item", IndexColumn::asc("a")),
            ])
        );
    }

    #[test]
    fn sorted_or_projected_equalities_still_need_composites() {
        let v = Version::default();
        let q = Query::new("Item").eq("a", 1).eq("b", 2).order("c");
        match plan_for(q, &v) {
            Err(StoreError::MissingIndex { suggested }) => {
                assert_eq!(suggested.to_string(), "Item:a,b,c");
            }
            other => panic!("unexpected {other:?}"),
        }
        let q = Query::new("Item").eq("a", 1).eq("b", 2).project(["c"]);
        assert!(matches!(plan_for(q, &v), Err(StoreError::MissingIndex { .. })));
    }

    #[test]
    fn projection_must_be_covered() {
        let v = with_indexes(&["Item:a,b"]);
        let q = Query::new("Item").eq("a", 1).project(["c"]);
        assert!(matches!(plan_for(q, &v), Err(StoreError::MissingIndex { .. })));
        let q = Query::new("Item").eq("a", 1).project(["b"]);
        assert_eq!(plan_for(q, &v).unwrap().extras(), 1);
    }
}
