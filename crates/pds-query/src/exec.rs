//! Statement execution against the document store.
//!
//! Reads scan snapshots; mutations decompose into per-field deltas and go
//! through [`DocumentStore::apply`] like every other merge: the executor
//! is the only component that writes field values, and even a
//! full-document replace becomes per-field register updates here.

use crate::ast::*;
use crate::error::QueryError;
use crate::eval::{self, Tri};
use crate::params::Params;
use pds_core::counter::PnCounter;
use pds_core::map::CrdtMap;
use pds_core::path::FieldPath;
use pds_core::scalar::Scalar;
use pds_core::value::{CrdtValue, ValueView};
use pds_store::{Document, DocumentDelta, DocumentId, DocumentStore, KeyScalar, TOMBSTONE_FIELD};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a statement produced.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryOutcome {
    /// Result rows (SELECT).
    Rows(Vec<serde_json::Value>),
    /// Number of documents mutated or evicted.
    Count(usize),
}

/// Per-call evaluation counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryStats {
    pub scanned: usize,
    pub matched: usize,
    /// Documents skipped because a comparison was undefined for their type.
    pub skipped_type_mismatch: usize,
    /// True when DISTINCT was recognized as a no-op on an already-unique key.
    pub distinct_noop: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub outcome: QueryOutcome,
    pub stats: QueryStats,
}

/// Executes parsed statements against a store.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<DocumentStore>,
}

impl QueryExecutor {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Parse and execute one statement.
    pub fn execute(&self, src: &str, params: &Params) -> Result<QueryResult, QueryError> {
        let statement = crate::parser::parse_statement(src)?;
        self.execute_statement(&statement, params)
    }

    pub fn execute_statement(
        &self,
        statement: &Statement,
        params: &Params,
    ) -> Result<QueryResult, QueryError> {
        match statement {
            Statement::Select(select) => self.select(select, params),
            Statement::Insert(insert) => self.insert(insert, params),
            Statement::Update(update) => self.update(update, params),
            Statement::Evict(evict) => self.evict(evict, params),
        }
    }

    /// `LIMIT 1` existence scan: stops at the first match instead of
    /// counting everything.
    pub fn exists(
        &self,
        collection: &str,
        predicate: Option<&Expr>,
        params: &Params,
    ) -> Result<bool, QueryError> {
        let include_deleted = predicate
            .map(|p| p.references_field(TOMBSTONE_FIELD))
            .unwrap_or(false);
        for doc in self.store.scan(collection) {
            if !include_deleted && doc.is_deleted() {
                continue;
            }
            if eval::evaluate(predicate, &doc, params)? == Tri::Match {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // === SELECT ===

    /// Scan and filter the documents a SELECT would consider, before any
    /// ordering or pagination. This is where per-document type-mismatch
    /// skips happen.
    fn filter_documents(
        &self,
        select: &SelectStatement,
        params: &Params,
    ) -> Result<(Vec<Document>, QueryStats), QueryError> {
        let mut stats = QueryStats::default();

        // Ad-hoc reads hide tombstoned documents unless the predicate
        // names the tombstone field itself. (Subscriptions never filter
        // them; that rule lives in the replication layer.)
        let include_deleted = select
            .predicate
            .as_ref()
            .map(|p| p.references_field(TOMBSTONE_FIELD))
            .unwrap_or(false);

        // Early-exit scans only when ordering/grouping cannot reorder rows.
        let plain_scan = select.order_by.is_none()
            && select.group_by.is_none()
            && !matches!(select.projection, Projection::Aggregates(_));
        let scan_cap = if plain_scan {
            select.limit.map(|l| l + select.offset.unwrap_or(0))
        } else {
            None
        };

        let mut matched: Vec<Document> = Vec::new();
        for doc in self.store.scan(&select.collection) {
            stats.scanned += 1;
            if !include_deleted && doc.is_deleted() {
                continue;
            }
            match eval::evaluate(select.predicate.as_ref(), &doc, params)? {
                Tri::Match => matched.push(doc),
                Tri::NoMatch => {}
                Tri::TypeMismatch => {
                    stats.skipped_type_mismatch += 1;
                    tracing::debug!(
                        collection = %select.collection,
                        id = %doc.id,
                        "skipping document: predicate type mismatch"
                    );
                }
            }
            if let Some(cap) = scan_cap {
                if matched.len() >= cap {
                    break;
                }
            }
        }
        stats.matched = matched.len();
        Ok((matched, stats))
    }

    /// The documents a row-returning SELECT resolves to, ordered and
    /// paginated but not projected. The observer pipeline builds its lazy
    /// cursors from this.
    pub fn select_documents(
        &self,
        select: &SelectStatement,
        params: &Params,
    ) -> Result<(Vec<Document>, QueryStats), QueryError> {
        let (mut matched, stats) = self.filter_documents(select, params)?;

        if let Some((path, order)) = &select.order_by {
            matched.sort_by(|a, b| {
                let cmp = compare_for_sort(a.read_scalar(path), b.read_scalar(path));
                match order {
                    SortOrder::Asc => cmp,
                    SortOrder::Desc => cmp.reverse(),
                }
            });
        }

        if let Some(offset) = select.offset {
            matched = matched.into_iter().skip(offset).collect();
        }
        if let Some(limit) = select.limit {
            matched.truncate(limit);
        }
        Ok((matched, stats))
    }

    fn select(
        &self,
        select: &SelectStatement,
        params: &Params,
    ) -> Result<QueryResult, QueryError> {
        if let Projection::Aggregates(aggs) = &select.projection {
            // Predicates are applied before any row is buffered for
            // aggregation; ordering and pagination do not apply.
            let (matched, stats) = self.filter_documents(select, params)?;
            let rows = aggregate_rows(&matched, aggs, select.group_by.as_ref());
            return Ok(QueryResult {
                outcome: QueryOutcome::Rows(rows),
                stats,
            });
        }

        let (matched, mut stats) = self.select_documents(select, params)?;

        let mut rows: Vec<serde_json::Value> = matched
            .iter()
            .map(|doc| project(doc, &select.projection))
            .collect();

        if select.distinct {
            // DISTINCT on the primary id (or a component of it) is a no-op
            // the executor recognizes instead of materializing a dedup set.
            let unique_already = match &select.projection {
                Projection::Fields(fields) if fields.len() == 1 && fields[0].len() == 1 => {
                    matched.iter().all(|d| d.id.covers_field(&fields[0].0[0]))
                        && !matched.is_empty()
                }
                _ => false,
            };
            if unique_already {
                stats.distinct_noop = true;
            } else {
                let mut seen = std::collections::HashSet::new();
                rows.retain(|row| seen.insert(row.to_string()));
            }
        }

        Ok(QueryResult {
            outcome: QueryOutcome::Rows(rows),
            stats,
        })
    }

    // === INSERT ===

    fn insert(
        &self,
        insert: &InsertStatement,
        params: &Params,
    ) -> Result<QueryResult, QueryError> {
        let mut stats = QueryStats::default();
        let mut mutated = 0usize;

        for literal in &insert.documents {
            let id = document_id_from_literal(literal, params)?;
            let exists = self.store.contains(&insert.collection, &id);

            if exists {
                match insert.on_conflict {
                    ConflictPolicy::Fail => return Err(QueryError::ConflictPolicy(id)),
                    ConflictPolicy::DoNothing => continue,
                    ConflictPolicy::DoUpdate => {
                        // Merge every field, changed or not: always a delta.
                        let delta = self.full_delta(&insert.collection, &id, literal, params)?;
                        self.store.apply(&delta)?;
                        mutated += 1;
                    }
                    ConflictPolicy::DoUpdateLocalDiff => {
                        // Read current state once, diff field by field, and
                        // merge only what changed. The snapshot is the
                        // comparison buffer; it is dropped before applying.
                        let current = self
                            .store
                            .snapshot(&insert.collection, &id)
                            .ok_or_else(|| pds_store::StoreError::DocumentNotFound(id.clone()))?;
                        let mut delta = DocumentDelta::new(insert.collection.clone(), id.clone());
                        for (key, value) in literal {
                            if key == "_id" {
                                continue;
                            }
                            self.diff_field(
                                &current,
                                FieldPath::field(key.clone()),
                                value,
                                params,
                                &mut delta,
                            )?;
                        }
                        drop(current);
                        if !delta.is_empty() {
                            self.store.apply(&delta)?;
                            mutated += 1;
                        }
                    }
                }
            } else {
                let delta = self.full_delta(&insert.collection, &id, literal, params)?;
                self.store.apply(&delta)?;
                mutated += 1;
            }
        }

        stats.matched = mutated;
        Ok(QueryResult {
            outcome: QueryOutcome::Count(mutated),
            stats,
        })
    }

    /// Delta carrying every field of a document literal.
    fn full_delta(
        &self,
        collection: &str,
        id: &DocumentId,
        literal: &[(String, ValueLiteral)],
        params: &Params,
    ) -> Result<DocumentDelta, QueryError> {
        let mut delta = DocumentDelta::new(collection.to_string(), id.clone());
        for (key, value) in literal {
            if key == "_id" {
                continue;
            }
            let value = self.literal_to_value(value, params)?;
            delta.push(FieldPath::field(key.clone()), value);
        }
        Ok(delta)
    }

    /// Emit deltas only for fields whose value differs from `current`.
    fn diff_field(
        &self,
        current: &Document,
        path: FieldPath,
        literal: &ValueLiteral,
        params: &Params,
        delta: &mut DocumentDelta,
    ) -> Result<(), QueryError> {
        match literal {
            ValueLiteral::Scalar(lit) => {
                let target = params.resolve(lit)?;
                let unchanged = current
                    .read_scalar(&path)
                    .map(|actual| actual.total_cmp(&target) == Ordering::Equal)
                    .unwrap_or(false);
                if !unchanged {
                    delta.push(path, CrdtValue::register(target, self.store.next_clock()));
                }
            }
            ValueLiteral::Counter(lit) => {
                let target = resolve_int(lit, params)?;
                let unchanged = current
                    .get(&path)
                    .and_then(|v| v.as_counter().map(|c| c.value()))
                    .map(|v| v == target)
                    .unwrap_or(false);
                if !unchanged {
                    // Restart the existing counter rather than opening a
                    // fresh one, so the delta wins over the current epoch
                    let value = self.counter_value(target, current, Some(&path))?;
                    delta.push(path, value);
                }
            }
            ValueLiteral::Map(pairs) => {
                // Recurse so an unchanged sibling leaf produces no delta
                for (key, value) in pairs {
                    let mut child = path.clone();
                    child.0.push(key.clone());
                    self.diff_field(current, child, value, params, delta)?;
                }
            }
        }
        Ok(())
    }

    // === UPDATE ===

    fn update(
        &self,
        update: &UpdateStatement,
        params: &Params,
    ) -> Result<QueryResult, QueryError> {
        let mut stats = QueryStats::default();
        let include_deleted = update
            .predicate
            .as_ref()
            .map(|p| p.references_field(TOMBSTONE_FIELD))
            .unwrap_or(false);

        let mut mutated = 0usize;
        for doc in self.store.scan(&update.collection) {
            stats.scanned += 1;
            if !include_deleted && doc.is_deleted() {
                continue;
            }
            match eval::evaluate(update.predicate.as_ref(), &doc, params)? {
                Tri::NoMatch => continue,
                Tri::TypeMismatch => {
                    stats.skipped_type_mismatch += 1;
                    continue;
                }
                Tri::Match => {}
            }

            let mut delta = DocumentDelta::new(update.collection.clone(), doc.id.clone());
            for clause in &update.sets {
                match clause {
                    SetClause::Assign { path, value } => {
                        let value = self.literal_to_value(value, params)?;
                        delta.push(path.clone(), value);
                    }
                    SetClause::Adjust {
                        path,
                        amount,
                        negated,
                    } => {
                        let mut amount = resolve_int(amount, params)?;
                        if *negated {
                            amount = -amount;
                        }
                        delta.push(path.clone(), self.adjusted_counter(&doc, path, amount)?);
                    }
                    SetClause::Restart { path, value } => {
                        let target = resolve_int(value, params)?;
                        delta.push(path.clone(), self.counter_value(target, &doc, Some(path))?);
                    }
                    SetClause::Remove { path } => {
                        delta.push(path.clone(), CrdtValue::tombstone(self.store.next_clock()));
                    }
                }
            }
            if !delta.is_empty() {
                self.store.apply(&delta)?;
                mutated += 1;
            }
        }

        stats.matched = mutated;
        Ok(QueryResult {
            outcome: QueryOutcome::Count(mutated),
            stats,
        })
    }

    /// Counter state with one more adjustment from this writer.
    ///
    /// Counter deltas are state deltas: the merged per-writer totals, not
    /// the raw step, so replaying the delta cannot double-count.
    fn adjusted_counter(
        &self,
        doc: &Document,
        path: &FieldPath,
        amount: i64,
    ) -> Result<CrdtValue, QueryError> {
        let clock = self.store.next_clock();
        let mut counter = doc
            .get(path)
            .and_then(|v| v.as_counter().cloned())
            .unwrap_or_else(|| PnCounter::new(clock.clone()));
        let writer = self.store.writer().clone();
        if amount >= 0 {
            counter.increment(writer, amount as u64, clock);
        } else {
            counter.decrement(writer, amount.unsigned_abs(), clock);
        }
        Ok(CrdtValue::counter(counter))
    }

    /// Counter restarted (or created) at a target value.
    fn counter_value(
        &self,
        target: i64,
        doc: &Document,
        existing_at: Option<&FieldPath>,
    ) -> Result<CrdtValue, QueryError> {
        let clock = self.store.next_clock();
        let mut counter = existing_at
            .and_then(|path| doc.get(path))
            .and_then(|v| v.as_counter().cloned())
            .unwrap_or_else(|| PnCounter::new(clock.clone()));
        counter.restart(target, clock);
        Ok(CrdtValue::counter(counter))
    }

    // === EVICT ===

    /// Local-only removal: matching documents (tombstoned ones included)
    /// leave this store without producing any delta or tombstone merge.
    fn evict(&self, evict: &EvictStatement, params: &Params) -> Result<QueryResult, QueryError> {
        let mut stats = QueryStats::default();
        let mut evicted = 0usize;

        for doc in self.store.scan(&evict.collection) {
            stats.scanned += 1;
            if let Some(limit) = evict.limit {
                if evicted >= limit {
                    break;
                }
            }
            match eval::evaluate(evict.predicate.as_ref(), &doc, params)? {
                Tri::Match => {
                    if self.store.evict(&evict.collection, &doc.id) {
                        evicted += 1;
                    }
                }
                Tri::NoMatch => {}
                Tri::TypeMismatch => stats.skipped_type_mismatch += 1,
            }
        }

        stats.matched = evicted;
        Ok(QueryResult {
            outcome: QueryOutcome::Count(evicted),
            stats,
        })
    }

    // === Literal lowering ===

    fn literal_to_value(
        &self,
        literal: &ValueLiteral,
        params: &Params,
    ) -> Result<CrdtValue, QueryError> {
        match literal {
            ValueLiteral::Scalar(lit) => {
                let scalar = params.resolve(lit)?;
                Ok(CrdtValue::register(scalar, self.store.next_clock()))
            }
            ValueLiteral::Counter(lit) => {
                let start = resolve_int(lit, params)?;
                let clock = self.store.next_clock();
                let mut counter = PnCounter::new(clock.clone());
                if start != 0 {
                    counter.restart(start, clock);
                }
                Ok(CrdtValue::counter(counter))
            }
            ValueLiteral::Map(pairs) => {
                let clock = self.store.next_clock();
                let mut map = CrdtMap::new(clock);
                for (key, value) in pairs {
                    let child = self.literal_to_value(value, params)?;
                    map.put(key.clone(), child);
                }
                Ok(CrdtValue::map(map))
            }
        }
    }
}

fn resolve_int(literal: &Literal, params: &Params) -> Result<i64, QueryError> {
    match params.resolve(literal)? {
        Scalar::Int(i) => Ok(i),
        other => Err(QueryError::InvalidKey {
            field: "counter amount".into(),
            reason: format!("expected an integer, got {other}"),
        }),
    }
}

/// Extract the document id from an insert literal: a string `_id`, a map
/// `_id` (composite key, component order preserved), or a generated ULID.
fn document_id_from_literal(
    literal: &[(String, ValueLiteral)],
    params: &Params,
) -> Result<DocumentId, QueryError> {
    let Some((_, value)) = literal.iter().find(|(key, _)| key == "_id") else {
        return Ok(DocumentId::generate());
    };
    match value {
        ValueLiteral::Scalar(lit) => {
            let scalar = params.resolve(lit)?;
            match scalar {
                Scalar::Text(s) => Ok(DocumentId::text(s)),
                other => Err(QueryError::InvalidKey {
                    field: "_id".into(),
                    reason: format!("string expected, got {other}"),
                }),
            }
        }
        ValueLiteral::Map(pairs) => {
            let mut components = Vec::new();
            for (key, value) in pairs {
                let ValueLiteral::Scalar(lit) = value else {
                    return Err(QueryError::InvalidKey {
                        field: key.clone(),
                        reason: "composite key components must be scalars".into(),
                    });
                };
                let scalar = params.resolve(lit)?;
                let component =
                    KeyScalar::from_scalar(&scalar).ok_or_else(|| QueryError::InvalidKey {
                        field: key.clone(),
                        reason: "floats and attachments cannot be key components".into(),
                    })?;
                components.push((key.clone(), component));
            }
            Ok(DocumentId::composite(components))
        }
        ValueLiteral::Counter(_) => Err(QueryError::InvalidKey {
            field: "_id".into(),
            reason: "a counter cannot be a document id".into(),
        }),
    }
}

/// Render one document under a projection.
pub fn project(doc: &Document, projection: &Projection) -> serde_json::Value {
    match projection {
        Projection::All => doc.to_json(),
        Projection::Fields(fields) => {
            let mut obj = serde_json::Map::new();
            for path in fields {
                let value = match doc.get(path) {
                    Some(v) => match v.view() {
                        ValueView::Map(_) => {
                            // Project the subtree as JSON
                            doc.to_json()
                                .pointer(&format!("/{}", path.0.join("/")))
                                .cloned()
                                .unwrap_or(serde_json::Value::Null)
                        }
                        _ => scalar_to_json(v.read_scalar()),
                    },
                    None => serde_json::Value::Null,
                };
                obj.insert(path.to_string(), value);
            }
            serde_json::Value::Object(obj)
        }
        Projection::Aggregates(_) => serde_json::Value::Null,
    }
}

fn scalar_to_json(scalar: Option<Scalar>) -> serde_json::Value {
    match scalar {
        Some(Scalar::Bool(b)) => serde_json::Value::Bool(b),
        Some(Scalar::Int(i)) => serde_json::Value::from(i),
        Some(Scalar::Float(x)) => serde_json::Value::from(x),
        Some(Scalar::Text(s)) => serde_json::Value::String(s),
        Some(Scalar::Attachment(t)) => serde_json::Value::String(t.to_string()),
        Some(Scalar::Null) | None => serde_json::Value::Null,
    }
}

fn compare_for_sort(a: Option<Scalar>, b: Option<Scalar>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        // Missing fields sort last
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Evaluate aggregates over matched rows, optionally grouped by one field.
/// Every predicate was already applied before any row was buffered here.
fn aggregate_rows(
    docs: &[Document],
    aggs: &[AggregateExpr],
    group_by: Option<&FieldPath>,
) -> Vec<serde_json::Value> {
    let groups: BTreeMap<String, Vec<&Document>> = match group_by {
        None => {
            let mut all = BTreeMap::new();
            all.insert(String::new(), docs.iter().collect());
            all
        }
        Some(path) => {
            let mut groups: BTreeMap<String, Vec<&Document>> = BTreeMap::new();
            for doc in docs {
                let key = doc
                    .read_scalar(path)
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                groups.entry(key).or_default().push(doc);
            }
            groups
        }
    };

    let mut rows = Vec::new();
    for (group_key, members) in groups {
        let mut row = serde_json::Map::new();
        if let Some(path) = group_by {
            row.insert(path.to_string(), serde_json::Value::String(group_key));
        }
        for agg in aggs {
            let label = match &agg.arg {
                Some(path) => format!("{}({})", agg.func.name(), path),
                None => format!("{}(*)", agg.func.name()),
            };
            row.insert(label, aggregate_one(&members, agg));
        }
        rows.push(serde_json::Value::Object(row));
    }
    rows
}

fn aggregate_one(docs: &[&Document], agg: &AggregateExpr) -> serde_json::Value {
    let values = || {
        docs.iter()
            .filter_map(|doc| agg.arg.as_ref().and_then(|path| doc.read_scalar(path)))
    };

    match agg.func {
        AggregateFunc::Count => {
            let count = match &agg.arg {
                None => docs.len(),
                Some(_) => values().count(),
            };
            serde_json::Value::from(count)
        }
        AggregateFunc::Sum => sum_values(values()),
        AggregateFunc::Avg => {
            let mut count = 0usize;
            let mut sum = 0.0f64;
            for value in values() {
                match value {
                    Scalar::Int(i) => {
                        sum += i as f64;
                        count += 1;
                    }
                    Scalar::Float(x) => {
                        sum += x;
                        count += 1;
                    }
                    _ => {}
                }
            }
            if count == 0 {
                serde_json::Value::Null
            } else {
                serde_json::Value::from(sum / count as f64)
            }
        }
        AggregateFunc::Min => extremum(values(), Ordering::Less),
        AggregateFunc::Max => extremum(values(), Ordering::Greater),
    }
}

/// SUM keeps integers exact: the result stays i64 until the first float
/// contribution, then promotes once.
fn sum_values(values: impl Iterator<Item = Scalar>) -> serde_json::Value {
    let mut int_acc = 0i64;
    let mut float_acc = 0.0f64;
    let mut saw_float = false;
    let mut saw_any = false;
    for value in values {
        match value {
            Scalar::Int(i) => {
                saw_any = true;
                if saw_float {
                    float_acc += i as f64;
                } else {
                    int_acc = int_acc.saturating_add(i);
                }
            }
            Scalar::Float(x) => {
                saw_any = true;
                if !saw_float {
                    float_acc = int_acc as f64;
                    saw_float = true;
                }
                float_acc += x;
            }
            _ => {}
        }
    }
    if !saw_any {
        serde_json::Value::Null
    } else if saw_float {
        serde_json::Value::from(float_acc)
    } else {
        serde_json::Value::from(int_acc)
    }
}

fn extremum(values: impl Iterator<Item = Scalar>, keep: Ordering) -> serde_json::Value {
    let mut best: Option<Scalar> = None;
    for value in values {
        if matches!(value, Scalar::Null) {
            continue;
        }
        best = Some(match best {
            None => value,
            Some(current) => {
                if value.total_cmp(&current) == keep {
                    value
                } else {
                    current
                }
            }
        });
    }
    scalar_to_json(best)
}
