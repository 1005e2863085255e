//! Batch executor.
//!
//! Splits key and entity sequences into backend-sized chunks, issues one
//! backend call per chunk, and stitches the per-index results back into
//! input order. Preconditions are checked before the first backend call.

use chrono::Utc;
use tracing::debug;

use tessera_core::{
    BackendError, BatchLimits, Key, KeyError, KeyState, MultiError, Operation, Property,
    TesseraError, TesseraResult,
};

use crate::backend::Backend;

/// One fetched slot. `properties` is `None` when the entity does not exist
/// or the fetch failed; the state tells the two apart.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub properties: Option<Vec<Property>>,
    pub state: KeyState,
}

/// One written slot. `key` is the stored key on success, the input key on
/// failure.
#[derive(Debug, Clone)]
pub struct Written {
    pub key: Key,
    pub state: KeyState,
}

/// Index-aligned results plus the aggregate error, present only when at
/// least one index failed.
#[derive(Debug, Clone)]
pub struct BatchOutcome<T> {
    pub items: Vec<T>,
    pub errors: Option<MultiError>,
}

impl<T> BatchOutcome<T> {
    fn collect(items: Vec<T>, errors: Vec<Option<TesseraError>>) -> Self {
        Self {
            items,
            errors: MultiError::from_slots(errors),
        }
    }

    /// The items, or the aggregate error if any index failed.
    pub fn into_result(self) -> TesseraResult<Vec<T>> {
        match self.errors {
            Some(multi) => Err(multi.into()),
            None => Ok(self.items),
        }
    }
}

/// Fail unless `keys` is non-empty and every key is complete.
pub fn check_complete(operation: Operation, keys: &[Key]) -> Result<(), KeyError> {
    if keys.is_empty() {
        return Err(KeyError::NoKeys { operation });
    }
    match keys.iter().position(|k| !k.is_complete()) {
        Some(index) => Err(KeyError::IncompleteKey {
            operation,
            index,
            key: keys[index].clone(),
        }),
        None => Ok(()),
    }
}

fn check_aligned(operation: Operation, sent: usize, received: usize) -> TesseraResult<()> {
    if sent != received {
        return Err(BackendError::Internal {
            reason: format!(
                "{}: backend answered {} results for {} items",
                operation, received, sent
            ),
        }
        .into());
    }
    Ok(())
}

/// Chunked access to a [`Backend`].
pub struct BatchExecutor<'a> {
    backend: &'a dyn Backend,
    limits: BatchLimits,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(backend: &'a dyn Backend, limits: BatchLimits) -> Self {
        Self { backend, limits }
    }

    /// Fetch every key.
    ///
    /// A missing entity is not an error: its slot has no properties and a
    /// clean synced state. When `expected_kind` is given every key must be
    /// of that kind.
    pub async fn get(
        &self,
        keys: &[Key],
        expected_kind: Option<&str>,
    ) -> TesseraResult<BatchOutcome<Fetched>> {
        check_complete(Operation::Get, keys)?;
        if let Some(expected) = expected_kind {
            if let Some(index) = keys.iter().position(|k| k.kind() != expected) {
                return Err(KeyError::KindMismatch {
                    index,
                    expected: expected.to_string(),
                    found: keys[index].kind().to_string(),
                }
                .into());
            }
        }

        let mut items = Vec::with_capacity(keys.len());
        let mut errors = Vec::with_capacity(keys.len());
        for (chunk_index, chunk) in keys.chunks(self.limits.get.max(1)).enumerate() {
            debug!(operation = %Operation::Get, chunk = chunk_index, size = chunk.len(), "dispatching chunk");
            let results = self.backend.get_multi(chunk).await?;
            check_aligned(Operation::Get, chunk.len(), results.len())?;
            let now = Utc::now();
            for result in results {
                match result {
                    Ok(properties) => {
                        items.push(Fetched {
                            properties: Some(properties),
                            state: KeyState::synced(now),
                        });
                        errors.push(None);
                    }
                    Err(err) if err.is_not_found() => {
                        items.push(Fetched {
                            properties: None,
                            state: KeyState::synced(now),
                        });
                        errors.push(None);
                    }
                    Err(err) => {
                        items.push(Fetched {
                            properties: None,
                            state: KeyState::failed(err.clone()),
                        });
                        errors.push(Some(err));
                    }
                }
            }
        }
        Ok(BatchOutcome::collect(items, errors))
    }

    /// Write every entity. Incomplete keys are accepted unless
    /// `require_complete` is set, and come back with an allocated id.
    pub async fn put(
        &self,
        keys: &[Key],
        entities: Vec<Vec<Property>>,
        require_complete: bool,
    ) -> TesseraResult<BatchOutcome<Written>> {
        if require_complete {
            check_complete(Operation::Put, keys)?;
        } else if keys.is_empty() {
            return Err(KeyError::NoKeys {
                operation: Operation::Put,
            }
            .into());
        }
        if keys.len() != entities.len() {
            return Err(KeyError::LengthMismatch {
                operation: Operation::Put,
                keys: keys.len(),
                values: entities.len(),
            }
            .into());
        }

        let limit = self.limits.put.max(1);
        let mut items = Vec::with_capacity(keys.len());
        let mut errors = Vec::with_capacity(keys.len());
        let mut entities = entities.into_iter();
        for (chunk_index, chunk) in keys.chunks(limit).enumerate() {
            debug!(operation = %Operation::Put, chunk = chunk_index, size = chunk.len(), "dispatching chunk");
            let batch: Vec<Vec<Property>> = entities.by_ref().take(chunk.len()).collect();
            let results = self.backend.put_multi(chunk, batch).await?;
            check_aligned(Operation::Put, chunk.len(), results.len())?;
            let now = Utc::now();
            for (input, result) in chunk.iter().zip(results) {
                match result {
                    Ok(key) => {
                        items.push(Written {
                            key,
                            state: KeyState::synced(now),
                        });
                        errors.push(None);
                    }
                    Err(err) => {
                        items.push(Written {
                            key: input.clone(),
                            state: KeyState::failed(err.clone()),
                        });
                        errors.push(Some(err));
                    }
                }
            }
        }
        Ok(BatchOutcome::collect(items, errors))
    }

    /// Delete every key. The first failing index aborts the call; later
    /// chunks are not attempted.
    pub async fn delete(&self, keys: &[Key]) -> TesseraResult<()> {
        check_complete(Operation::Delete, keys)?;
        for (chunk_index, chunk) in keys.chunks(self.limits.delete.max(1)).enumerate() {
            debug!(operation = %Operation::Delete, chunk = chunk_index, size = chunk.len(), "dispatching chunk");
            let results = self.backend.delete_multi(chunk).await?;
            check_aligned(Operation::Delete, chunk.len(), results.len())?;
            if let Some(err) = results.into_iter().find_map(Result::err) {
                return Err(err);
            }
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
