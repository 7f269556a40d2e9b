//! Query builder and finalized queries.
//!
//! A [`Query`] is a cheap, clonable builder. Calling [`Query::finalize`]
//! validates the filter and order combination and produces an immutable
//! [`FinalizedQuery`], which is what backends execute.
//!
//! # Finalization rules
//!
//! - At most one property may carry inequality filters, and it must be
//!   the first sort order (it is added implicitly when no order is given).
//! - Sort orders on equality-filtered properties are dropped, and
//!   `__key__` ascending is appended as the final order. `-__key__` is only
//!   allowed as the sole order.
//! - Projections may not include equality-filtered properties or
//!   `__key__`, cannot be combined with keys-only, and `distinct` requires
//!   a projection.
//! - Contradictory bounds or an empty `IN` set produce a null query, which
//!   runs successfully with no results.

use crate::cursor::{Cursor, Fingerprint};
use crate::error::{ModelError, ModelResult};
use crate::index::IndexColumn;
use crate::key::Key;
use crate::property::{PropertyMap, PropertyValue, KEY_PROPERTY};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Inequality operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// One side of an inequality range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bound {
    /// The bounding value.
    pub value: PropertyValue,
    /// Whether the value itself is inside the range.
    pub inclusive: bool,
}

/// The inequality range on a single property.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Range {
    /// Lower bound, if any.
    pub lower: Option<Bound>,
    /// Upper bound, if any.
    pub upper: Option<Bound>,
}

impl Range {
    /// Narrows the range by one more condition, keeping the tighter bound.
    pub fn tighten(&mut self, op: FilterOp, value: PropertyValue) {
        let inclusive = matches!(op, FilterOp::Le | FilterOp::Ge);
        let bound = Bound { value, inclusive };
        match op {
            FilterOp::Gt | FilterOp::Ge => {
                let replace = match &self.lower {
                    None => true,
                    Some(cur) => {
                        bound.value > cur.value || (bound.value == cur.value && !bound.inclusive)
                    }
                };
                if replace {
                    self.lower = Some(bound);
                }
            }
            FilterOp::Lt | FilterOp::Le => {
                let replace = match &self.upper {
                    None => true,
                    Some(cur) => {
                        bound.value < cur.value || (bound.value == cur.value && !bound.inclusive)
                    }
                };
                if replace {
                    self.upper = Some(bound);
                }
            }
        }
    }

    /// Returns true if `value` is inside the range.
    #[must_use]
    pub fn contains(&self, value: &PropertyValue) -> bool {
        let above = match &self.lower {
            None => true,
            Some(b) => value > &b.value || (b.inclusive && value == &b.value),
        };
        let below = match &self.upper {
            None => true,
            Some(b) => value < &b.value || (b.inclusive && value == &b.value),
        };
        above && below
    }

    /// Returns true if no value can satisfy the range.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lo), Some(hi)) => {
                lo.value > hi.value || (lo.value == hi.value && !(lo.inclusive && hi.inclusive))
            }
            _ => false,
        }
    }

    fn values(&self) -> impl Iterator<Item = &PropertyValue> {
        self.lower.iter().chain(self.upper.iter()).map(|b| &b.value)
    }
}

/// A query under construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    kind: String,
    ancestor: Option<Key>,
    eq: BTreeMap<String, BTreeSet<PropertyValue>>,
    in_filters: BTreeMap<String, BTreeSet<PropertyValue>>,
    ineq: BTreeMap<String, Range>,
    orders: Vec<IndexColumn>,
    project: Vec<String>,
    distinct: bool,
    keys_only: bool,
    start: Option<Cursor>,
    end: Option<Cursor>,
    limit: Option<u32>,
    offset: Option<u32>,
    eventual: bool,
    err: Option<ModelError>,
}

impl Query {
    /// Creates a query over `kind`. An empty kind makes a kindless query.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    /// Returns the kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Restricts results to descendants of `ancestor` (itself included).
    #[must_use]
    pub fn ancestor(mut self, ancestor: Key) -> Self {
        self.ancestor = Some(ancestor);
        self
    }

    /// Requires `property` to have `value`. Repeated calls on the same
    /// property require all of the values.
    #[must_use]
    pub fn eq(mut self, property: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.eq
            .entry(property.into())
            .or_default()
            .insert(value.into());
        self
    }

    /// Requires `property` to have any one of `values`.
    #[must_use]
    pub fn eq_any<V: Into<PropertyValue>>(
        mut self,
        property: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values: BTreeSet<PropertyValue> = values.into_iter().map(Into::into).collect();
        match self.in_filters.entry(property.into()) {
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(values);
            }
            std::collections::btree_map::Entry::Occupied(mut e) => {
                let both = e.get().intersection(&values).cloned().collect();
                e.insert(both);
            }
        }
        self
    }

    /// Adds an inequality condition on `property`.
    #[must_use]
    pub fn filter(
        mut self,
        property: impl Into<String>,
        op: FilterOp,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.ineq
            .entry(property.into())
            .or_default()
            .tighten(op, value.into());
        self
    }

    /// Requires `property < value`.
    #[must_use]
    pub fn lt(self, property: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.filter(property, FilterOp::Lt, value)
    }

    /// Requires `property <= value`.
    #[must_use]
    pub fn le(self, property: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.filter(property, FilterOp::Le, value)
    }

    /// Requires `property > value`.
    #[must_use]
    pub fn gt(self, property: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.filter(property, FilterOp::Gt, value)
    }

    /// Requires `property >= value`.
    #[must_use]
    pub fn ge(self, property: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.filter(property, FilterOp::Ge, value)
    }

    /// Appends a sort order written as `prop` or `-prop`.
    #[must_use]
    pub fn order(mut self, order: &str) -> Self {
        match order.parse::<IndexColumn>() {
            Ok(col) => self.orders.push(col),
            Err(_) => {
                self.err
                    .get_or_insert_with(|| ModelError::invalid_query(format!("bad order {order:?}")));
            }
        }
        self
    }

    /// Appends a sort order.
    #[must_use]
    pub fn order_by(mut self, order: IndexColumn) -> Self {
        self.orders.push(order);
        self
    }

    /// Projects the given properties instead of returning whole entities.
    #[must_use]
    pub fn project<S: Into<String>>(mut self, properties: impl IntoIterator<Item = S>) -> Self {
        self.project.extend(properties.into_iter().map(Into::into));
        self
    }

    /// Removes duplicate projected rows.
    #[must_use]
    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    /// Returns keys without entity values.
    #[must_use]
    pub fn keys_only(mut self, keys_only: bool) -> Self {
        self.keys_only = keys_only;
        self
    }

    /// Starts after the position of `cursor`.
    #[must_use]
    pub fn start(mut self, cursor: Cursor) -> Self {
        self.start = Some(cursor);
        self
    }

    /// Stops after the position of `cursor`.
    #[must_use]
    pub fn end(mut self, cursor: Cursor) -> Self {
        self.end = Some(cursor);
        self
    }

    /// Returns at most `limit` results.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips the first `offset` results.
    #[must_use]
    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Allows reading a slightly stale version.
    #[must_use]
    pub fn eventual_consistency(mut self, eventual: bool) -> Self {
        self.eventual = eventual;
        self
    }

    /// Validates this query and produces its finalized form.
    ///
    /// # Errors
    ///
    /// Returns an error if the combination of filters, orders, projection
    /// and cursors is not allowed.
    pub fn finalize(&self) -> ModelResult<FinalizedQuery> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }

        let mut eq = self.eq.clone();
        let mut ineq = self.ineq.clone();
        let in_filters = self.in_filters.clone();

        if let Some(keys) = eq.remove(KEY_PROPERTY) {
            let range = ineq.entry(KEY_PROPERTY.to_string()).or_default();
            for key in keys {
                range.tighten(FilterOp::Ge, key.clone());
                range.tighten(FilterOp::Le, key);
            }
        }

        let mut ineq_iter = ineq.into_iter();
        let inequality = ineq_iter.next();
        if let (Some((first, _)), Some((second, _))) = (&inequality, ineq_iter.next()) {
            return Err(ModelError::MultipleInequality {
                first: first.clone(),
                second: second.clone(),
            });
        }

        if in_filters.contains_key(KEY_PROPERTY) {
            return Err(ModelError::invalid_query("IN filter on __key__ is not supported"));
        }
        if let Some((prop, range)) = &inequality {
            if prop == KEY_PROPERTY && range.values().any(|v| v.as_key().is_none()) {
                return Err(ModelError::invalid_query("__key__ filter value must be a key"));
            }
            if eq.contains_key(prop) || in_filters.contains_key(prop) {
                return Err(ModelError::invalid_query(format!(
                    "equality and inequality filters on {prop:?}"
                )));
            }
        }

        if self.kind.is_empty() {
            if !eq.is_empty()
                || !in_filters.is_empty()
                || inequality.as_ref().is_some_and(|(p, _)| p != KEY_PROPERTY)
            {
                return Err(ModelError::invalid_query(
                    "kindless queries may only filter on __key__",
                ));
            }
            if self
                .orders
                .iter()
                .any(|o| o.property != KEY_PROPERTY || o.descending)
            {
                return Err(ModelError::invalid_query(
                    "kindless queries may only order by __key__ ascending",
                ));
            }
            if !self.project.is_empty() {
                return Err(ModelError::invalid_query("kindless queries cannot project"));
            }
        }

        let mut orders: Vec<IndexColumn> = Vec::new();
        for order in &self.orders {
            if eq.contains_key(&order.property)
                || orders.iter().any(|o| o.property == order.property)
            {
                continue;
            }
            orders.push(order.clone());
            if order.property == KEY_PROPERTY {
                break;
            }
        }
        if let Some((prop, _)) = &inequality {
            match orders.first() {
                None => orders.push(IndexColumn::asc(prop.clone())),
                Some(first) if &first.property != prop => {
                    return Err(ModelError::InequalityNotFirstOrder {
                        property: prop.clone(),
                        found: first.property.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        match orders.last() {
            Some(last) if last.property == KEY_PROPERTY => {
                if last.descending && orders.len() != 1 {
                    return Err(ModelError::invalid_query(
                        "-__key__ is only allowed as the sole sort order",
                    ));
                }
            }
            _ => orders.push(IndexColumn::asc(KEY_PROPERTY)),
        }

        let mut project: Vec<String> = Vec::new();
        for prop in &self.project {
            if prop == KEY_PROPERTY {
                return Err(ModelError::invalid_query("cannot project __key__"));
            }
            if eq.contains_key(prop) {
                return Err(ModelError::invalid_query(format!(
                    "cannot project equality-filtered property {prop:?}"
                )));
            }
            if !project.contains(prop) {
                project.push(prop.clone());
            }
        }
        if self.keys_only && !project.is_empty() {
            return Err(ModelError::invalid_query(
                "keys-only queries cannot project properties",
            ));
        }
        if self.distinct && project.is_empty() {
            return Err(ModelError::invalid_query("distinct requires a projection"));
        }

        let null = inequality.as_ref().is_some_and(|(_, r)| r.is_empty())
            || in_filters.values().any(BTreeSet::is_empty);

        let fingerprint = Shape {
            kind: &self.kind,
            ancestor: self.ancestor.as_ref(),
            eq: &eq,
            in_filters: &in_filters,
            inequality: inequality.as_ref(),
            orders: &orders,
            project: &project,
            distinct: self.distinct,
            keys_only: self.keys_only,
        }
        .fingerprint()?;

        for cursor in self.start.iter().chain(self.end.iter()) {
            if cursor.fingerprint() != &fingerprint {
                return Err(ModelError::CursorMismatch);
            }
        }

        Ok(FinalizedQuery {
            original: self.clone(),
            kind: self.kind.clone(),
            ancestor: self.ancestor.clone(),
            eq,
            in_filters,
            inequality,
            orders,
            project,
            distinct: self.distinct,
            keys_only: self.keys_only,
            start: self.start.clone(),
            end: self.end.clone(),
            limit: self.limit,
            offset: self.offset,
            eventual: self.eventual,
            null,
            fingerprint,
        })
    }
}

#[derive(Serialize)]
struct Shape<'a> {
    kind: &'a str,
    ancestor: Option<&'a Key>,
    eq: &'a BTreeMap<String, BTreeSet<PropertyValue>>,
    in_filters: &'a BTreeMap<String, BTreeSet<PropertyValue>>,
    inequality: Option<&'a (String, Range)>,
    orders: &'a [IndexColumn],
    project: &'a [String],
    distinct: bool,
    keys_only: bool,
}

impl Shape<'_> {
    fn fingerprint(&self) -> ModelResult<Fingerprint> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ModelError::Encoding(e.to_string()))?;
        Ok(Sha256::digest(&buf).into())
    }
}

/// An immutable, validated query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedQuery {
    original: Query,
    kind: String,
    ancestor: Option<Key>,
    eq: BTreeMap<String, BTreeSet<PropertyValue>>,
    in_filters: BTreeMap<String, BTreeSet<PropertyValue>>,
    inequality: Option<(String, Range)>,
    orders: Vec<IndexColumn>,
    project: Vec<String>,
    distinct: bool,
    keys_only: bool,
    start: Option<Cursor>,
    end: Option<Cursor>,
    limit: Option<u32>,
    offset: Option<u32>,
    eventual: bool,
    null: bool,
    fingerprint: Fingerprint,
}

impl FinalizedQuery {
    /// Returns the builder this query was finalized from.
    #[must_use]
    pub fn original(&self) -> &Query {
        &self.original
    }

    /// Returns the kind, empty for kindless queries.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the ancestor restriction.
    #[must_use]
    pub fn ancestor(&self) -> Option<&Key> {
        self.ancestor.as_ref()
    }

    /// Returns the equality filters (all values required).
    #[must_use]
    pub fn eq_filters(&self) -> &BTreeMap<String, BTreeSet<PropertyValue>> {
        &self.eq
    }

    /// Returns the `IN` filters (any value accepted).
    #[must_use]
    pub fn in_filters(&self) -> &BTreeMap<String, BTreeSet<PropertyValue>> {
        &self.in_filters
    }

    /// Returns the inequality property and its range.
    #[must_use]
    pub fn inequality(&self) -> Option<(&str, &Range)> {
        self.inequality.as_ref().map(|(p, r)| (p.as_str(), r))
    }

    /// Returns the final sort orders, always ending with `__key__`.
    #[must_use]
    pub fn orders(&self) -> &[IndexColumn] {
        &self.orders
    }

    /// Returns the projected properties.
    #[must_use]
    pub fn projection(&self) -> &[String] {
        &self.project
    }

    /// Returns true if this is a projection query.
    #[must_use]
    pub fn is_projection(&self) -> bool {
        !self.project.is_empty()
    }

    /// Returns true if projected rows are deduplicated.
    #[must_use]
    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// Returns true if only keys are returned.
    #[must_use]
    pub fn is_keys_only(&self) -> bool {
        self.keys_only
    }

    /// Returns the start cursor.
    #[must_use]
    pub fn start(&self) -> Option<&Cursor> {
        self.start.as_ref()
    }

    /// Returns the end cursor.
    #[must_use]
    pub fn end(&self) -> Option<&Cursor> {
        self.end.as_ref()
    }

    /// Returns the limit.
    #[must_use]
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Returns the offset.
    #[must_use]
    pub fn offset(&self) -> Option<u32> {
        self.offset
    }

    /// Returns true if a stale read is acceptable.
    #[must_use]
    pub fn eventual_consistency(&self) -> bool {
        self.eventual
    }

    /// Returns true if the query can never match anything.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.null
    }

    /// Returns the shape fingerprint cursors are bound to.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Returns a copy with a different limit.
    #[must_use]
    pub fn with_limit(&self, limit: Option<u32>) -> Self {
        let mut q = self.clone();
        q.limit = limit;
        q
    }

    /// Returns a copy with a different offset.
    #[must_use]
    pub fn with_offset(&self, offset: Option<u32>) -> Self {
        let mut q = self.clone();
        q.offset = offset;
        q
    }

    /// Returns a copy starting after `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::CursorMismatch`] if the cursor was taken from a
    /// query of another shape.
    pub fn with_start(&self, cursor: Option<Cursor>) -> ModelResult<Self> {
        if cursor.as_ref().is_some_and(|c| c.fingerprint() != &self.fingerprint) {
            return Err(ModelError::CursorMismatch);
        }
        let mut q = self.clone();
        q.start = cursor;
        Ok(q)
    }

    /// Creates a cursor at the given sort tuple.
    #[must_use]
    pub fn cursor_at(&self, position: Vec<PropertyValue>) -> Cursor {
        Cursor::new(self.fingerprint, position)
    }

    /// Returns true if an entity satisfies every filter of this query.
    ///
    /// Only indexed values take part, as they would in an index scan.
    #[must_use]
    pub fn matches(&self, key: &Key, props: &PropertyMap) -> bool {
        if self.null {
            return false;
        }
        if !self.kind.is_empty() && key.kind() != self.kind {
            return false;
        }
        if let Some(anc) = &self.ancestor {
            if !key.has_ancestor(anc) {
                return false;
            }
        }
        let all_eq = self.eq.iter().all(|(prop, wanted)| {
            wanted
                .iter()
                .all(|w| props.indexed_values(prop).any(|v| v == w))
        });
        let any_in = self.in_filters.iter().all(|(prop, wanted)| {
            props.indexed_values(prop).any(|v| wanted.contains(v))
        });
        let in_range = match &self.inequality {
            None => true,
            Some((prop, range)) if prop == KEY_PROPERTY => {
                range.contains(&PropertyValue::Key(key.clone()))
            }
            Some((prop, range)) => props.indexed_values(prop).any(|v| range.contains(v)),
        };
        all_eq && any_in && in_range
    }
}

/// Renders a GQL-like form for logging.
impl fmt::Display for FinalizedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        if self.keys_only {
            write!(f, "__key__")?;
        } else if self.project.is_empty() {
            write!(f, "*")?;
        } else {
            if self.distinct {
                write!(f, "DISTINCT ")?;
            }
            write!(f, "{}", self.project.join(", "))?;
        }
        if !self.kind.is_empty() {
            write!(f, " FROM {}", self.kind)?;
        }

        let mut clauses = Vec::new();
        if let Some(anc) = &self.ancestor {
            clauses.push(format!("__key__ HAS ANCESTOR KEY({anc})"));
        }
        for (prop, values) in &self.eq {
            for v in values {
                clauses.push(format!("{prop} = {v}"));
            }
        }
        for (prop, values) in &self.in_filters {
            let vals: Vec<String> = values.iter().map(ToString::to_string).collect();
            clauses.push(format!("{prop} IN ARRAY({})", vals.join(", ")));
        }
        if let Some((prop, range)) = &self.inequality {
            if let Some(b) = &range.lower {
                let op = if b.inclusive { ">=" } else { ">" };
                clauses.push(format!("{prop} {op} {}", b.value));
            }
            if let Some(b) = &range.upper {
                let op = if b.inclusive { "<=" } else { "<" };
                clauses.push(format!("{prop} {op} {}", b.value));
            }
        }
        if !clauses.is_empty() {
            write!(f, " WHERE {}", clauses.join(" AND "))?;
        }

        let orders: Vec<String> = self
            .orders
            .iter()
            .map(|o| format!("{} {}", o.property, if o.descending { "DESC" } else { "ASC" }))
            .collect();
        write!(f, " ORDER BY {}", orders.join(", "))?;
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        Ok(())
    }
}
