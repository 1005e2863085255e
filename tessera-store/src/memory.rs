//! In-memory reference backend.
//!
//! A complete [`Backend`] held in process memory: id allocation, ancestor
//! queries with filters, ordering, projection, cursors, and optimistic
//! transactions scoped to entity groups. Used by the test suites and as
//! the executable description of what a remote backend must provide.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use tessera_core::{
    BackendError, Cursor, CursorBound, Direction, Filter, FilterOp, Key, Property, Query,
    QueryError, QueryMode, TesseraError, TesseraResult, TransactionOptions, Value,
};

use crate::backend::{Backend, BackendTransaction, ItemResult, QueryCursor, QueryRow};

/// Entity groups a cross-group transaction may touch.
pub const MAX_CROSS_GROUP: usize = 25;

// ============================================================================
// STATE
// ============================================================================

#[derive(Debug, Clone)]
struct StoredEntity {
    properties: Vec<Property>,
    version: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    entities: BTreeMap<Key, StoredEntity>,
    failures: BTreeMap<Key, BackendError>,
    next_id: i64,
    version: u64,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> TesseraResult<()> {
        if self.unavailable {
            return Err(BackendError::Unavailable {
                reason: "memory backend switched off".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn failure(&self, key: &Key) -> Option<TesseraError> {
        self.failures.get(key).cloned().map(TesseraError::from)
    }

    fn version_of(&self, key: &Key) -> u64 {
        self.entities.get(key).map_or(0, |e| e.version)
    }

    fn allocate(&mut self, key: &Key) -> Key {
        loop {
            self.next_id += 1;
            let candidate = key.with_numeric_id(self.next_id);
            if !self.entities.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn read(&self, key: &Key) -> ItemResult<Vec<Property>> {
        if let Some(err) = self.failure(key) {
            return Err(err);
        }
        self.entities
            .get(key)
            .map(|e| e.properties.clone())
            .ok_or_else(|| BackendError::NotFound { key: key.clone() }.into())
    }

    fn write(&mut self, key: Key, properties: Vec<Property>) {
        self.version += 1;
        let version = self.version;
        self.entities.insert(
            key,
            StoredEntity {
                properties,
                version,
            },
        );
    }
}

// ============================================================================
// QUERY EVALUATION
// ============================================================================

fn indexed_values<'a>(properties: &'a [Property], name: &'a str) -> impl Iterator<Item = &'a Value> {
    properties
        .iter()
        .filter(move |p| p.indexed && p.name == name)
        .map(|p| &p.value)
}

fn matches_filter(properties: &[Property], filter: &Filter) -> bool {
    indexed_values(properties, &filter.property).any(|v| {
        let ord = v.cmp_total(&filter.value);
        match filter.op {
            FilterOp::Eq => ord.is_eq(),
            FilterOp::Lt => ord.is_lt(),
            FilterOp::Le => ord.is_le(),
            FilterOp::Gt => ord.is_gt(),
            FilterOp::Ge => ord.is_ge(),
        }
    })
}

/// Sort value of one order clause: the smallest value ascending, the
/// largest descending.
fn sort_value<'a>(properties: &'a [Property], name: &'a str, direction: Direction) -> Option<&'a Value> {
    let values = indexed_values(properties, name);
    match direction {
        Direction::Asc => values.min_by(|a, b| a.cmp_total(b)),
        Direction::Desc => values.max_by(|a, b| a.cmp_total(b)),
    }
}

fn projected_rows(key: &Key, properties: &[Property], projection: &[String]) -> Vec<QueryRow> {
    let mut combos: Vec<Vec<Property>> = vec![Vec::new()];
    for name in projection {
        let values: Vec<&Value> = indexed_values(properties, name).collect();
        if values.is_empty() {
            return Vec::new();
        }
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |v| {
                    let mut row = prefix.clone();
                    row.push(Property::new(name.clone(), (*v).clone()).indexed());
                    row
                })
            })
            .collect();
    }
    combos
        .into_iter()
        .map(|properties| QueryRow {
            key: key.clone(),
            properties: Some(properties),
        })
        .collect()
}

fn same_projection(a: &[Property], b: &[Property]) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(x, y)| x.name == y.name && x.value.cmp_total(&y.value).is_eq())
}

/// Every row of `query` in result order, before cursors, offset and limit.
fn evaluate(state: &MemoryState, query: &Query) -> Vec<QueryRow> {
    let mut matched: Vec<(&Key, &StoredEntity)> = state
        .entities
        .iter()
        .filter(|(key, _)| key.kind() == query.kind())
        .filter(|(key, _)| query.ancestor_key().map_or(true, |a| key.has_ancestor(a)))
        .filter(|(_, e)| query.filters().iter().all(|f| matches_filter(&e.properties, f)))
        .filter(|(_, e)| {
            query
                .orders()
                .iter()
                .all(|o| indexed_values(&e.properties, &o.property).next().is_some())
        })
        .collect();

    matched.sort_by(|(ka, a), (kb, b)| {
        for order in query.orders() {
            let va = sort_value(&a.properties, &order.property, order.direction);
            let vb = sort_value(&b.properties, &order.property, order.direction);
            let ord = match (va, vb) {
                (Some(x), Some(y)) => x.cmp_total(y),
                _ => std::cmp::Ordering::Equal,
            };
            let ord = match order.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if !ord.is_eq() {
                return ord;
            }
        }
        ka.cmp(kb)
    });

    match query.mode() {
        QueryMode::KeysOnly => matched
            .into_iter()
            .map(|(key, _)| QueryRow {
                key: key.clone(),
                properties: None,
            })
            .collect(),
        QueryMode::Full => matched
            .into_iter()
            .map(|(key, e)| QueryRow {
                key: key.clone(),
                properties: Some(e.properties.clone()),
            })
            .collect(),
        QueryMode::Projected => {
            let mut rows: Vec<QueryRow> = Vec::new();
            for (key, e) in matched {
                for row in projected_rows(key, &e.properties, query.projection()) {
                    let duplicate = query.is_distinct()
                        && rows.iter().any(|seen| {
                            same_projection(
                                seen.properties.as_deref().unwrap_or_default(),
                                row.properties.as_deref().unwrap_or_default(),
                            )
                        });
                    if !duplicate {
                        rows.push(row);
                    }
                }
            }
            rows
        }
    }
}

fn encode_position(position: usize) -> Cursor {
    Cursor::from_bytes((position as u64).to_be_bytes().to_vec())
}

fn decode_position(cursor: &Cursor, bound: CursorBound) -> TesseraResult<usize> {
    let bytes: [u8; 8] = cursor.as_bytes().try_into().map_err(|_| QueryError::InvalidCursor {
        bound,
        reason: format!("expected 8 bytes, found {}", cursor.as_bytes().len()),
    })?;
    Ok(u64::from_be_bytes(bytes) as usize)
}

/// Cursor over a materialized result list.
pub struct MemoryCursor {
    rows: Vec<QueryRow>,
    next: usize,
    end: usize,
    position: Option<usize>,
}

impl MemoryCursor {
    fn new(rows: Vec<QueryRow>, query: &Query) -> TesseraResult<Self> {
        let len = rows.len();
        let start = match query.start_at() {
            Some(c) => decode_position(c, CursorBound::Start)?.min(len),
            None => 0,
        };
        let end = match query.end_at() {
            Some(c) => decode_position(c, CursorBound::End)?.clamp(start, len),
            None => len,
        };
        let begin = start.saturating_add(query.row_offset()).min(end);
        let end = match query.row_limit() {
            Some(limit) => begin.saturating_add(limit).min(end),
            None => end,
        };
        Ok(Self {
            rows,
            next: begin,
            end,
            position: None,
        })
    }
}

#[async_trait]
impl QueryCursor for MemoryCursor {
    async fn next(&mut self) -> TesseraResult<Option<QueryRow>> {
        if self.next >= self.end {
            self.position = Some(self.next);
            return Ok(None);
        }
        let row = self.rows[self.next].clone();
        self.next += 1;
        self.position = Some(self.next);
        Ok(Some(row))
    }

    fn cursor(&self) -> TesseraResult<Cursor> {
        self.position
            .map(encode_position)
            .ok_or_else(|| QueryError::CursorUnavailable.into())
    }
}

// ============================================================================
// BACKEND
// ============================================================================

/// In-memory [`Backend`].
///
/// Clones share the same underlying data.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `key` fail with `error` until cleared.
    pub fn fail_key(&self, key: Key, error: BackendError) {
        self.state.write().failures.insert(key, error);
    }

    pub fn clear_failures(&self) {
        self.state.write().failures.clear();
    }

    /// Fail every call as a whole (or stop doing so).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.write().unavailable = unavailable;
    }

    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entities.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.state.read().entities.contains_key(key)
    }

    /// The stored properties of `key`, bypassing failure injection.
    pub fn properties(&self, key: &Key) -> Option<Vec<Property>> {
        self.state.read().entities.get(key).map(|e| e.properties.clone())
    }
}

fn check_lengths(keys: &[Key], entities: &[Vec<Property>]) -> TesseraResult<()> {
    if keys.len() != entities.len() {
        return Err(BackendError::Internal {
            reason: format!("{} keys but {} entities", keys.len(), entities.len()),
        }
        .into());
    }
    Ok(())
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<Vec<Property>>>> {
        let state = self.state.read();
        state.check_available()?;
        Ok(keys.iter().map(|key| state.read(key)).collect())
    }

    async fn put_multi(
        &self,
        keys: &[Key],
        entities: Vec<Vec<Property>>,
    ) -> TesseraResult<Vec<ItemResult<Key>>> {
        check_lengths(keys, &entities)?;
        let mut state = self.state.write();
        state.check_available()?;
        let mut results = Vec::with_capacity(keys.len());
        for (key, properties) in keys.iter().zip(entities) {
            if let Some(err) = state.failure(key) {
                results.push(Err(err));
                continue;
            }
            let key = if key.is_complete() {
                key.clone()
            } else {
                state.allocate(key)
            };
            state.write(key.clone(), properties);
            results.push(Ok(key));
        }
        Ok(results)
    }

    async fn delete_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<()>>> {
        let mut state = self.state.write();
        state.check_available()?;
        Ok(keys
            .iter()
            .map(|key| match state.failure(key) {
                Some(err) => Err(err),
                None => {
                    state.entities.remove(key);
                    Ok(())
                }
            })
            .collect())
    }

    async fn run_query(&self, query: &Query) -> TesseraResult<Box<dyn QueryCursor>> {
        query.validate()?;
        let rows = {
            let state = self.state.read();
            state.check_available()?;
            evaluate(&state, query)
        };
        Ok(Box::new(MemoryCursor::new(rows, query)?))
    }

    async fn begin_transaction(
        &self,
        options: TransactionOptions,
    ) -> TesseraResult<Box<dyn BackendTransaction>> {
        self.state.read().check_available()?;
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            options,
            inner: Mutex::new(TxnState::default()),
        }))
    }
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[derive(Debug, Default)]
struct TxnState {
    /// Version of every key read or written, as first observed.
    observed: BTreeMap<Key, u64>,
    /// Buffered writes; `None` is a delete.
    writes: BTreeMap<Key, Option<Vec<Property>>>,
    groups: BTreeSet<Key>,
    finished: bool,
}

/// Optimistic transaction over a [`MemoryBackend`].
///
/// Reads see committed data. Writes are buffered and applied atomically by
/// `commit`, which fails with a conflict if any key read or written has
/// changed since the transaction first observed it.
pub struct MemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    options: TransactionOptions,
    inner: Mutex<TxnState>,
}

impl MemoryTransaction {
    fn finished_error() -> TesseraError {
        BackendError::Internal {
            reason: "transaction already finished".to_string(),
        }
        .into()
    }

    /// Record `key` as part of the transaction, enforcing the group limit.
    fn observe(&self, txn: &mut TxnState, state: &MemoryState, key: &Key) -> TesseraResult<()> {
        txn.groups.insert(key.root().clone());
        let limit = if self.options.cross_group {
            MAX_CROSS_GROUP
        } else {
            1
        };
        if txn.groups.len() > limit {
            return Err(BackendError::EntityGroup {
                groups: txn.groups.len(),
            }
            .into());
        }
        txn.observed
            .entry(key.clone())
            .or_insert_with(|| state.version_of(key));
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryTransaction {
    async fn get_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<Vec<Property>>>> {
        let mut txn = self.inner.lock();
        if txn.finished {
            return Err(Self::finished_error());
        }
        let state = self.state.read();
        state.check_available()?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            self.observe(&mut txn, &state, key)?;
            results.push(state.read(key));
        }
        Ok(results)
    }

    async fn put_multi(
        &self,
        keys: &[Key],
        entities: Vec<Vec<Property>>,
    ) -> TesseraResult<Vec<ItemResult<Key>>> {
        check_lengths(keys, &entities)?;
        let mut txn = self.inner.lock();
        if txn.finished {
            return Err(Self::finished_error());
        }
        let mut state = self.state.write();
        state.check_available()?;
        let mut results = Vec::with_capacity(keys.len());
        for (key, properties) in keys.iter().zip(entities) {
            if let Some(err) = state.failure(key) {
                results.push(Err(err));
                continue;
            }
            let key = if key.is_complete() {
                key.clone()
            } else {
                state.allocate(key)
            };
            self.observe(&mut txn, &state, &key)?;
            txn.writes.insert(key.clone(), Some(properties));
            results.push(Ok(key));
        }
        Ok(results)
    }

    async fn delete_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<()>>> {
        let mut txn = self.inner.lock();
        if txn.finished {
            return Err(Self::finished_error());
        }
        let state = self.state.read();
        state.check_available()?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(err) = state.failure(key) {
                results.push(Err(err));
                continue;
            }
            self.observe(&mut txn, &state, key)?;
            txn.writes.insert(key.clone(), None);
            results.push(Ok(()));
        }
        Ok(results)
    }

    async fn run_query(&self, query: &Query) -> TesseraResult<Box<dyn QueryCursor>> {
        query.validate()?;
        let Some(ancestor) = query.ancestor_key() else {
            return Err(QueryError::InvalidQuery {
                reason: "queries inside a transaction must have an ancestor".to_string(),
            }
            .into());
        };
        let rows = {
            let mut txn = self.inner.lock();
            if txn.finished {
                return Err(Self::finished_error());
            }
            let state = self.state.read();
            state.check_available()?;
            self.observe(&mut txn, &state, ancestor)?;
            evaluate(&state, query)
        };
        Ok(Box::new(MemoryCursor::new(rows, query)?))
    }

    async fn begin_transaction(
        &self,
        _options: TransactionOptions,
    ) -> TesseraResult<Box<dyn BackendTransaction>> {
        Err(TesseraError::NestedTransaction)
    }
}

#[async_trait]
impl BackendTransaction for MemoryTransaction {
    fn backend(&self) -> &dyn Backend {
        self
    }

    async fn commit(&self) -> TesseraResult<()> {
        let mut txn = self.inner.lock();
        if txn.finished {
            return Err(Self::finished_error());
        }
        txn.finished = true;

        let mut state = self.state.write();
        state.check_available()?;
        for (key, seen) in &txn.observed {
            if state.version_of(key) != *seen {
                return Err(BackendError::Conflict {
                    reason: format!("{} changed during the transaction", key),
                }
                .into());
            }
        }

        let writes = std::mem::take(&mut txn.writes);
        let count = writes.len();
        for (key, write) in writes {
            match write {
                Some(properties) => state.write(key, properties),
                None => {
                    state.entities.remove(&key);
                }
            }
        }
        debug!(writes = count, groups = txn.groups.len(), "committed memory transaction");
        Ok(())
    }

    async fn rollback(&self) -> TesseraResult<()> {
        let mut txn = self.inner.lock();
        if txn.finished {
            return Err(Self::finished_error());
        }
        txn.finished = true;
        txn.writes.clear();
        debug!("rolled back memory transaction");
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
