//! Query execution over a planned index scan.
//!
//! Each combination of `IN` values becomes one branch scanning a
//! contiguous range of the chosen partition, or intersecting several
//! built-in partitions by key. Branches are merged by sort position,
//! duplicates removed, and cursors, offset and limit applied last.
//!
//! A resumed run delivers exactly what an uninterrupted run would have
//! delivered after the cursor: an entity whose first row sorts at or
//! before the cursor is not delivered again from a later row.

use crate::planner::{Plan, ScanSource};
use crate::rows::{row_key, IndexCell, IndexRow};
use crate::version::Version;
use dstore_model::{
    compare_tuples, FinalizedQuery, IndexColumn, IndexDefinition, Key, PropertyMap,
    PropertyValue, Range, KEY_PROPERTY,
};
use dstore_raw::{QueryItem, RunCb, StoreResult};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::iter::Peekable;
use std::ops::{Bound, ControlFlow};

/// One candidate result before cursors, offset and limit.
struct Record {
    key: Key,
    /// Values of the position columns.
    tuple: Vec<PropertyValue>,
    value: PropertyMap,
}

type Records<'a> = Box<dyn Iterator<Item = Record> + 'a>;
type KeyStream<'a> = Box<dyn Iterator<Item = &'a Key> + 'a>;

/// Runs `fq` against `version` along `plan`, feeding results to `cb`.
pub fn execute(
    version: &Version,
    fq: &FinalizedQuery,
    plan: &Plan,
    cb: &mut RunCb<'_>,
) -> StoreResult<()> {
    if fq.is_null() {
        return Ok(());
    }
    let columns = position_columns(fq);
    let mut seen = Seen::for_query(fq);
    let mut to_skip = fq.offset().unwrap_or(0);
    let mut remaining = fq.limit();
    // Distinct groups span entities: replay the rows before the cursor to
    // learn which groups were already delivered.
    let replay = fq.is_distinct() && fq.start().is_some();

    for rec in scan(version, fq, plan, &columns, !replay) {
        if let Some(start) = fq.start() {
            let cursor = start.position();
            if compare_tuples(&columns, &rec.tuple, cursor) != Ordering::Greater {
                if replay {
                    seen.insert(fq, &rec);
                }
                continue;
            }
            if !replay {
                let first = first_position(version, fq, &columns, &rec);
                if compare_tuples(&columns, &first, cursor) != Ordering::Greater {
                    continue;
                }
            }
        }
        if let Some(end) = fq.end() {
            if compare_tuples(&columns, &rec.tuple, end.position()) == Ordering::Greater {
                break;
            }
        }
        if !seen.insert(fq, &rec) {
            continue;
        }
        if to_skip > 0 {
            to_skip -= 1;
            continue;
        }
        match remaining.as_mut() {
            Some(0) => break,
            Some(n) => *n -= 1,
            None => {}
        }
        let cursor = fq.cursor_at(rec.tuple);
        if cb(QueryItem::new(rec.key, rec.value, cursor))?.is_break() {
            break;
        }
    }
    Ok(())
}

/// Counts the results `execute` would deliver.
pub fn count(version: &Version, fq: &FinalizedQuery, plan: &Plan) -> StoreResult<u64> {
    let mut n = 0;
    execute(version, fq, plan, &mut |_| {
        n += 1;
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(n)
}

/// The sort orders, then projected properties the orders leave out.
///
/// Rows of one entity that tie on every order differ in the trailing
/// projected columns, so cursors keep them apart.
fn position_columns(fq: &FinalizedQuery) -> Vec<IndexColumn> {
    let mut columns = fq.orders().to_vec();
    for p in fq.projection() {
        if !columns.iter().any(|c| &c.property == p) {
            columns.push(IndexColumn::asc(p.clone()));
        }
    }
    columns
}

/// Position of the earliest row an uninterrupted run delivers `rec`'s
/// entity (or projected row) from.
///
/// A multi-valued property yields one row per value, so the earliest row
/// takes the first matching value of each column in sort direction.
fn first_position(
    version: &Version,
    fq: &FinalizedQuery,
    columns: &[IndexColumn],
    rec: &Record,
) -> Vec<PropertyValue> {
    let Some(props) = version.entity(&rec.key) else {
        return rec.tuple.clone();
    };
    columns
        .iter()
        .zip(&rec.tuple)
        .map(|(col, own)| {
            let p = col.property.as_str();
            if p == KEY_PROPERTY || fq.projection().iter().any(|x| x == p) {
                return own.clone();
            }
            let in_set = fq.in_filters().get(p);
            let range = fq.inequality().filter(|(ip, _)| *ip == p).map(|(_, r)| r);
            let values = props.indexed_values(p).filter(|v| {
                in_set.map_or(true, |set| set.contains(*v)) && range.map_or(true, |r| r.contains(*v))
            });
            let first = if col.descending {
                values.max()
            } else {
                values.min()
            };
            first.cloned().unwrap_or_else(|| own.clone())
        })
        .collect()
}

enum Seen {
    Keys(HashSet<Key>),
    Projected(BTreeSet<(Key, Vec<PropertyValue>)>),
    Distinct(BTreeSet<Vec<PropertyValue>>),
}

impl Seen {
    fn for_query(fq: &FinalizedQuery) -> Self {
        if fq.is_distinct() {
            Self::Distinct(BTreeSet::new())
        } else if fq.is_projection() {
            Self::Projected(BTreeSet::new())
        } else {
            Self::Keys(HashSet::new())
        }
    }

    fn insert(&mut self, fq: &FinalizedQuery, rec: &Record) -> bool {
        let projected = || -> Vec<PropertyValue> {
            fq.projection()
                .iter()
                .map(|p| rec.value.first(p).cloned().unwrap_or(PropertyValue::Null))
                .collect()
        };
        match self {
            Self::Keys(seen) => seen.insert(rec.key.clone()),
            Self::Projected(seen) => seen.insert((rec.key.clone(), projected())),
            Self::Distinct(seen) => seen.insert(projected()),
        }
    }
}

fn scan<'a>(
    version: &'a Version,
    fq: &'a FinalizedQuery,
    plan: &'a Plan,
    columns: &'a [IndexColumn],
    seek: bool,
) -> Records<'a> {
    let mut streams: Vec<Records<'a>> = match plan.source() {
        ScanSource::Entities => return scan_entities(version, fq, plan.is_reverse()),
        ScanSource::MergeJoin(defs) => branches(fq)
            .into_iter()
            .map(|branch| scan_merge_join(version, fq, defs, plan.is_reverse(), columns, branch))
            .collect(),
        ScanSource::Index(def) => {
            let orders = fq.orders();
            let regroup = plan.extras() > 0 || (plan.is_reverse() && orders.len() > 1);
            let head = orders.len().saturating_sub(1);
            branches(fq)
                .into_iter()
                .map(|branch| {
                    let rows = scan_index(version, fq, plan, def, columns, &branch, seek);
                    if regroup {
                        Box::new(Regroup::new(rows, columns, head)) as Records<'a>
                    } else {
                        rows
                    }
                })
                .collect()
        }
    };
    if streams.len() == 1 {
        if let Some(only) = streams.pop() {
            return only;
        }
    }
    Box::new(Merge::new(streams, columns))
}

/// One value per equality column for every combination of `IN` values.
fn branches(fq: &FinalizedQuery) -> Vec<BTreeMap<String, PropertyValue>> {
    let mut base = BTreeMap::new();
    for (prop, values) in fq.eq_filters() {
        if let Some(v) = values.first() {
            base.insert(prop.clone(), v.clone());
        }
    }
    let mut out = vec![base];
    for (prop, values) in fq.in_filters() {
        out = out
            .iter()
            .flat_map(|branch| {
                values.iter().map(move |v| {
                    let mut b = branch.clone();
                    b.insert(prop.clone(), v.clone());
                    b
                })
            })
            .collect();
    }
    out
}

/// Row bounds for a range on the column right after `prefix`.
fn cell_bounds(prefix: &IndexRow, descending: bool, range: &Range) -> (Bound<IndexRow>, Bound<IndexRow>) {
    let with = |v: &PropertyValue, max: bool| {
        let mut row = prefix.clone();
        row.push(IndexCell::new(v.clone(), descending));
        if max {
            row.push(IndexCell::Max);
        }
        row
    };
    // A descending column stores values backwards, so the value bounds swap.
    let (low, high) = if descending {
        (&range.upper, &range.lower)
    } else {
        (&range.lower, &range.upper)
    };
    let lower = match low {
        None => Bound::Included(prefix.clone()),
        Some(b) if b.inclusive => Bound::Included(with(&b.value, false)),
        Some(b) => Bound::Excluded(with(&b.value, true)),
    };
    let upper = match high {
        None => {
            let mut row = prefix.clone();
            row.push(IndexCell::Max);
            Bound::Excluded(row)
        }
        Some(b) if b.inclusive => Bound::Excluded(with(&b.value, true)),
        Some(b) => Bound::Excluded(with(&b.value, false)),
    };
    (lower, upper)
}

/// Returns the tighter of two lower bounds.
fn max_lower<T: Ord>(a: Bound<T>, b: Bound<T>) -> Bound<T> {
    let take_b = match (&a, &b) {
        (Bound::Unbounded, _) => true,
        (_, Bound::Unbounded) => false,
        (Bound::Included(x) | Bound::Excluded(x), Bound::Included(y) | Bound::Excluded(y)) => {
            match x.cmp(y) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => matches!(b, Bound::Excluded(_)),
            }
        }
    };
    if take_b {
        b
    } else {
        a
    }
}

fn column_of(def: &IndexDefinition, property: &str) -> Option<usize> {
    def.columns.iter().position(|c| c.property == property)
}

fn scan_index<'a>(
    version: &'a Version,
    fq: &'a FinalizedQuery,
    plan: &'a Plan,
    def: &'a IndexDefinition,
    columns: &'a [IndexColumn],
    branch: &BTreeMap<String, PropertyValue>,
    seek: bool,
) -> Records<'a> {
    let Some(part) = version.partition(def) else {
        return Box::new(std::iter::empty());
    };
    let n_eq = plan.eq_columns();
    let offset = usize::from(def.ancestor);

    let mut prefix: IndexRow = Vec::new();
    if def.ancestor {
        if let Some(anc) = fq.ancestor() {
            prefix.push(IndexCell::Asc(PropertyValue::Key(anc.clone())));
        }
    }
    for col in &def.columns[..n_eq] {
        let Some(v) = branch.get(&col.property) else {
            return Box::new(std::iter::empty());
        };
        prefix.push(IndexCell::new(v.clone(), col.descending));
    }

    let mut row_check: Option<(usize, &'a Range)> = None;
    let (mut lower, upper) = match fq.inequality() {
        Some((prop, range)) if prop != KEY_PROPERTY => {
            let descending = def.columns.get(n_eq).is_some_and(|c| c.descending);
            row_check = Some((offset + n_eq, range));
            cell_bounds(&prefix, descending, range)
        }
        Some((_, range)) if def.columns.len() == n_eq => cell_bounds(&prefix, false, range),
        _ => cell_bounds(&prefix, false, &Range::default()),
    };

    let kind_ancestor = if def.is_kind_only() { fq.ancestor() } else { None };
    if let Some(anc) = kind_ancestor {
        lower = max_lower(
            lower,
            Bound::Included(vec![IndexCell::Asc(PropertyValue::Key(anc.clone()))]),
        );
    }

    // Resume from the start cursor with a seek when rows are already in
    // result order.
    let orders = fq.orders();
    if let Some(start) = fq.start().filter(|_| seek) {
        let position = start.position();
        let seekable = !plan.is_reverse()
            && plan.extras() == 0
            && fq.in_filters().is_empty()
            && position.len() == orders.len();
        if seekable {
            let mut seek = prefix.clone();
            let mut ok = true;
            for (order, value) in orders.iter().zip(position) {
                if order.property == KEY_PROPERTY {
                    seek.push(IndexCell::Asc(value.clone()));
                } else if let Some(i) = column_of(def, &order.property) {
                    seek.push(IndexCell::new(value.clone(), def.columns[i].descending));
                } else {
                    ok = false;
                }
            }
            if ok {
                lower = max_lower(lower, Bound::Excluded(seek));
            }
        }
    }

    let rows = if plan.is_reverse() {
        part.range_rev(lower, upper)
    } else {
        part.range(lower, upper)
    };
    let stop_outside = if plan.is_reverse() { None } else { kind_ancestor };
    Box::new(
        rows.map(|(row, _)| row)
            .take_while(move |row| match stop_outside {
                Some(anc) => row_key(row).is_some_and(|k| k.has_ancestor(anc)),
                None => true,
            })
            .filter_map(move |row| {
                record_from_row(version, fq, def, columns, offset, row, row_check)
            }),
    )
}

fn record_from_row(
    version: &Version,
    fq: &FinalizedQuery,
    def: &IndexDefinition,
    columns: &[IndexColumn],
    offset: usize,
    row: &IndexRow,
    row_check: Option<(usize, &Range)>,
) -> Option<Record> {
    let key = row_key(row)?;
    if let Some((cell, range)) = row_check {
        if !row.get(cell).and_then(IndexCell::value).is_some_and(|v| range.contains(v)) {
            return None;
        }
    }
    let props = version.entity(key)?;
    if !fq.matches(key, props) {
        return None;
    }
    let cell = |property: &str| -> Option<PropertyValue> {
        let i = column_of(def, property)?;
        row.get(offset + i).and_then(IndexCell::value).cloned()
    };
    let tuple = columns
        .iter()
        .map(|o| {
            if o.property == KEY_PROPERTY {
                Some(PropertyValue::Key(key.clone()))
            } else {
                cell(&o.property)
            }
        })
        .collect::<Option<Vec<_>>>()?;
    let value = if fq.is_keys_only() {
        PropertyMap::new()
    } else if fq.is_projection() {
        let mut projected = PropertyMap::new();
        for p in fq.projection() {
            projected.set(p.clone(), cell(p)?);
        }
        projected
    } else {
        (**props).clone()
    };
    Some(Record {
        key: key.clone(),
        tuple,
        value,
    })
}

fn scan_entities<'a>(version: &'a Version, fq: &'a FinalizedQuery, reverse: bool) -> Records<'a> {
    let to_bound = |b: &Option<dstore_model::Bound>| match b {
        Some(b) => match b.value.as_key() {
            Some(k) if b.inclusive => Bound::Included(k.clone()),
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        },
        None => Bound::Unbounded,
    };
    let (mut lower, upper) = match fq.inequality() {
        Some((_, range)) => (to_bound(&range.lower), to_bound(&range.upper)),
        None => (Bound::Unbounded, Bound::Unbounded),
    };
    if let Some(anc) = fq.ancestor() {
        lower = max_lower(lower, Bound::Included(anc.clone()));
    }
    let entries = if reverse {
        version.entities.range_rev(lower, upper)
    } else {
        version.entities.range(lower, upper)
    };
    let stop_outside = if reverse { None } else { fq.ancestor() };
    Box::new(
        entries
            .take_while(move |(key, _)| stop_outside.map_or(true, |anc| key.has_ancestor(anc)))
            .filter(move |(key, props)| fq.matches(key, props))
            .map(move |(key, props)| Record {
                key: key.clone(),
                tuple: vec![PropertyValue::Key(key.clone())],
                value: if fq.is_keys_only() {
                    PropertyMap::new()
                } else {
                    (**props).clone()
                },
            }),
    )
}

/// Intersects built-in scans for one branch.
///
/// Every stream yields keys in key order: single-property partitions hold
/// one row per value and key, and the kind index covers the ancestor range.
fn scan_merge_join<'a>(
    version: &'a Version,
    fq: &'a FinalizedQuery,
    defs: &'a [IndexDefinition],
    reverse: bool,
    columns: &'a [IndexColumn],
    branch: BTreeMap<String, PropertyValue>,
) -> Records<'a> {
    let mut streams = Vec::with_capacity(defs.len());
    for def in defs {
        let Some(part) = version.partition(def) else {
            return Box::new(std::iter::empty());
        };
        let stream: KeyStream<'a> = if def.is_kind_only() {
            let Some(anc) = fq.ancestor() else {
                return Box::new(std::iter::empty());
            };
            let from = Bound::Included(vec![IndexCell::Asc(PropertyValue::Key(anc.clone()))]);
            if reverse {
                Box::new(
                    part.range_rev(from, Bound::Unbounded)
                        .filter_map(|(row, _)| row_key(row))
                        .skip_while(move |k| !k.has_ancestor(anc))
                        .take_while(move |k| k.has_ancestor(anc)),
                )
            } else {
                Box::new(
                    part.range(from, Bound::Unbounded)
                        .filter_map(|(row, _)| row_key(row))
                        .take_while(move |k| k.has_ancestor(anc)),
                )
            }
        } else {
            let Some(value) = def.columns.first().and_then(|c| branch.get(&c.property)) else {
                return Box::new(std::iter::empty());
            };
            let prefix = vec![IndexCell::Asc(value.clone())];
            let (lower, upper) = cell_bounds(&prefix, false, &Range::default());
            let rows = if reverse {
                part.range_rev(lower, upper)
            } else {
                part.range(lower, upper)
            };
            Box::new(rows.filter_map(|(row, _)| row_key(row)))
        };
        streams.push(stream.peekable());
    }

    let keys = Intersect { streams, reverse };
    Box::new(keys.filter_map(move |key| {
        let props = version.entity(key)?;
        if !fq.matches(key, props) {
            return None;
        }
        let tuple = columns
            .iter()
            .map(|c| {
                if c.property == KEY_PROPERTY {
                    Some(PropertyValue::Key(key.clone()))
                } else {
                    branch.get(&c.property).cloned()
                }
            })
            .collect::<Option<Vec<_>>>()?;
        let value = if fq.is_keys_only() {
            PropertyMap::new()
        } else {
            (**props).clone()
        };
        Some(Record {
            key: key.clone(),
            tuple,
            value,
        })
    }))
}

/// Keys present in every stream. Streams ascend, or descend when
/// `reverse` is set.
struct Intersect<'a> {
    streams: Vec<Peekable<KeyStream<'a>>>,
    reverse: bool,
}

impl<'a> Iterator for Intersect<'a> {
    type Item = &'a Key;

    fn next(&mut self) -> Option<&'a Key> {
        let reverse = self.reverse;
        let behind = |k: &Key, target: &Key| if reverse { k > target } else { k < target };
        let mut target: &'a Key = *self.streams.first_mut()?.peek()?;
        loop {
            let mut agreed = true;
            for stream in &mut self.streams {
                while stream.next_if(|k| behind(*k, target)).is_some() {}
                let head: &'a Key = *stream.peek()?;
                if head != target {
                    target = head;
                    agreed = false;
                }
            }
            if agreed {
                for stream in &mut self.streams {
                    stream.next();
                }
                return Some(target);
            }
        }
    }
}

/// Re-sorts runs of rows that tie on the first `head` columns, every order
/// but `__key__`.
struct Regroup<'a> {
    inner: Peekable<Records<'a>>,
    buf: VecDeque<Record>,
    columns: &'a [IndexColumn],
    head: usize,
}

impl<'a> Regroup<'a> {
    fn new(inner: Records<'a>, columns: &'a [IndexColumn], head: usize) -> Self {
        Self {
            inner: inner.peekable(),
            buf: VecDeque::new(),
            columns,
            head,
        }
    }
}

impl Iterator for Regroup<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        if let Some(rec) = self.buf.pop_front() {
            return Some(rec);
        }
        let columns = self.columns;
        let head = &columns[..self.head];
        let mut group = vec![self.inner.next()?];
        while let Some(rec) = self
            .inner
            .next_if(|r| compare_tuples(head, &r.tuple, &group[0].tuple) == Ordering::Equal)
        {
            group.push(rec);
        }
        group.sort_by(|a, b| compare_tuples(columns, &a.tuple, &b.tuple));
        self.buf = group.into();
        self.buf.pop_front()
    }
}

/// Merges branches that are each in result order.
struct Merge<'a> {
    streams: Vec<Records<'a>>,
    heads: Vec<Option<Record>>,
    columns: &'a [IndexColumn],
}

impl<'a> Merge<'a> {
    fn new(mut streams: Vec<Records<'a>>, columns: &'a [IndexColumn]) -> Self {
        let heads = streams.iter_mut().map(Iterator::next).collect();
        Self {
            streams,
            heads,
            columns,
        }
    }
}

impl Iterator for Merge<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(rec) = head else { continue };
            let better = match best.and_then(|b| self.heads[b].as_ref()) {
                None => true,
                Some(cur) => compare_tuples(self.columns, &rec.tuple, &cur.tuple) == Ordering::Less,
            };
            if better {
                best = Some(i);
            }
        }
        let i = best?;
        let next = self.streams[i].next();
        std::mem::replace(&mut self.heads[i], next)
    }
}
