//! Query execution.
//!
//! `all` runs either directly (decode each backend row as it arrives) or in
//! hybrid mode: a keys-only query followed by a cached batch get, which is
//! cheaper than refetching full entities once the cache is warm.

use std::sync::Arc;

use tracing::debug;

use tessera_core::{
    codec, Codec, Cursor, Key, MultiError, Query, QueryError, QueryMode, Record, TesseraResult,
};

use crate::backend::QueryCursor;
use crate::store::{decode_record, Store};

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub keys: Vec<Key>,
    /// Decoded records, aligned with `keys`. Empty for keys-only queries.
    pub records: Vec<R>,
    /// Position after the last result; feed to `Query::start_cursor` to resume.
    pub cursor: Cursor,
}

impl<R> Page<R> {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Streaming query results, decoded one row at a time.
pub struct QueryIter<R: Record> {
    rows: Box<dyn QueryCursor>,
    codec: Arc<Codec<R>>,
    mode: QueryMode,
}

impl<R: Record> QueryIter<R> {
    /// Next key and its decoded record (`None` for keys-only queries), or
    /// `None` once exhausted.
    pub async fn next(&mut self) -> TesseraResult<Option<(Key, Option<R>)>> {
        let Some(row) = self.rows.next().await? else {
            return Ok(None);
        };
        let record = match (self.mode, row.properties) {
            (QueryMode::KeysOnly, _) | (_, None) => None,
            (_, Some(properties)) => Some(decode_record(&self.codec, &row.key, properties)?),
        };
        Ok(Some((row.key, record)))
    }

    /// Position after the last row returned. Fails before the first `next`.
    pub fn cursor(&self) -> TesseraResult<Cursor> {
        self.rows.cursor()
    }
}

impl Store {
    /// Number of entities matching `query`.
    pub async fn count(&self, query: &Query) -> TesseraResult<usize> {
        query.validate()?;
        self.backend().count(query).await
    }

    /// Keys matching `query`, in query order, plus the end cursor.
    pub async fn keys(&self, query: &Query) -> TesseraResult<(Vec<Key>, Cursor)> {
        let query = query.keys_only();
        query.validate()?;
        let mut rows = self.backend().run_query(&query).await?;
        let mut keys = Vec::new();
        while let Some(row) = rows.next().await? {
            keys.push(row.key);
        }
        Ok((keys, rows.cursor()?))
    }

    /// First result of `query`, or `None` when nothing matches.
    ///
    /// Keys-only queries decode no record; use [`Store::keys`] for those.
    pub async fn first<R: Record>(&self, query: &Query) -> TesseraResult<Option<R>> {
        if query.mode() == QueryMode::KeysOnly {
            return Err(QueryError::InvalidQuery {
                reason: "first needs a full or projected query; use keys for keys-only".to_string(),
            }
            .into());
        }
        let mut iter = self.run::<R>(&query.limit(1)).await?;
        Ok(iter.next().await?.and_then(|(_, record)| record))
    }

    /// Every result of `query`.
    pub async fn all<R: Record>(&self, query: &Query) -> TesseraResult<Page<R>> {
        query.validate()?;
        let policy = self.policy();
        let hybrid = query.row_limit() != Some(1)
            && query.mode() == QueryMode::Full
            && policy.read_shared();
        debug!(kind = query.kind(), hybrid, "running query");
        if hybrid {
            self.all_hybrid(query).await
        } else {
            self.all_direct(query).await
        }
    }

    /// Start streaming `query`.
    pub async fn run<R: Record>(&self, query: &Query) -> TesseraResult<QueryIter<R>> {
        query.validate()?;
        let codec = codec::<R>()?;
        let rows = self.backend().run_query(query).await?;
        Ok(QueryIter {
            rows,
            codec,
            mode: query.mode(),
        })
    }

    async fn all_direct<R: Record>(&self, query: &Query) -> TesseraResult<Page<R>> {
        let mut iter = self.run::<R>(query).await?;
        let mut keys = Vec::new();
        let mut records = Vec::new();
        while let Some((key, record)) = iter.next().await? {
            keys.push(key);
            if let Some(record) = record {
                records.push(record);
            }
        }
        Ok(Page {
            keys,
            records,
            cursor: iter.cursor()?,
        })
    }

    async fn all_hybrid<R: Record>(&self, query: &Query) -> TesseraResult<Page<R>> {
        let (found, cursor) = self.keys(query).await?;
        if found.is_empty() {
            return Ok(Page {
                keys: found,
                records: Vec::new(),
                cursor,
            });
        }
        let codec = codec::<R>()?;
        let entries = self.fetch(&codec, &found, Some(query.kind())).await?;

        let errors = entries.iter().map(|e| e.state.error.clone()).collect();
        if let Some(multi) = MultiError::from_slots(errors) {
            return Err(multi.into());
        }

        let mut keys = Vec::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.exists() {
                debug!(key = %entry.key, "dropping key deleted since the keys-only pass");
                continue;
            }
            keys.push(entry.key.clone());
            records.push(entry.value);
        }
        Ok(Page {
            keys,
            records,
            cursor,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
