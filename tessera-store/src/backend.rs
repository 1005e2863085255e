//! Backend collaborator traits.
//!
//! The remote entity store is reached through [`Backend`]. Every batched
//! call returns one result per input index; a whole-call failure is the
//! outer `Err`. Implementations are free to reorder internally but must
//! answer index-aligned.

use async_trait::async_trait;
use tessera_core::{Cursor, Key, Property, Query, QueryMode, TesseraResult, TransactionOptions};

/// Per-index outcome of a batched backend call.
pub type ItemResult<T> = TesseraResult<T>;

/// One row yielded by a backend query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub key: Key,
    /// `None` for keys-only queries.
    pub properties: Option<Vec<Property>>,
}

/// Streaming query results.
#[async_trait]
pub trait QueryCursor: Send {
    /// Next row, or `None` once exhausted.
    async fn next(&mut self) -> TesseraResult<Option<QueryRow>>;

    /// Position after the last row returned.
    ///
    /// Only available once `next` has been called at least once.
    fn cursor(&self) -> TesseraResult<Cursor>;
}

/// The remote entity store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch every key. A missing entity is a per-index `NotFound`.
    async fn get_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<Vec<Property>>>>;

    /// Write every entity, returning the stored key per index. Incomplete
    /// keys receive a backend-allocated numeric id.
    async fn put_multi(
        &self,
        keys: &[Key],
        entities: Vec<Vec<Property>>,
    ) -> TesseraResult<Vec<ItemResult<Key>>>;

    /// Delete every key. Deleting a missing entity succeeds.
    async fn delete_multi(&self, keys: &[Key]) -> TesseraResult<Vec<ItemResult<()>>>;

    /// Start a query.
    async fn run_query(&self, query: &Query) -> TesseraResult<Box<dyn QueryCursor>>;

    /// Number of entities matching `query`.
    async fn count(&self, query: &Query) -> TesseraResult<usize> {
        let counted = match query.mode() {
            QueryMode::Projected => query.clone(),
            _ => query.with_mode(QueryMode::KeysOnly),
        };
        let mut rows = self.run_query(&counted).await?;
        let mut n = 0;
        while rows.next().await?.is_some() {
            n += 1;
        }
        Ok(n)
    }

    /// Open a transaction whose reads and writes are isolated until commit.
    async fn begin_transaction(
        &self,
        options: TransactionOptions,
    ) -> TesseraResult<Box<dyn BackendTransaction>>;
}

/// A backend transaction.
///
/// Operations issued through [`BackendTransaction::backend`] are buffered
/// and applied atomically by `commit`. After `commit` or `rollback` every
/// further call fails.
#[async_trait]
pub trait BackendTransaction: Send + Sync {
    /// The transaction-scoped view used for reads and writes.
    fn backend(&self) -> &dyn Backend;

    /// Apply every buffered write, or fail with a conflict.
    async fn commit(&self) -> TesseraResult<()>;

    /// Discard every buffered write.
    async fn rollback(&self) -> TesseraResult<()>;
}
