//! Error types for tessera operations

use std::fmt;

use thiserror::Error;

use crate::key::Key;

/// The batched operation an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    Put,
    Delete,
    Query,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Get => "get",
            Operation::Put => "put",
            Operation::Delete => "delete",
            Operation::Query => "query",
        };
        f.write_str(name)
    }
}

/// Record shape, encode and decode errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid property name {name:?} in {record}")]
    InvalidFieldName { record: String, name: String },

    #[error("duplicate property name {name:?} in {record}")]
    DuplicateProperty { record: String, name: String },

    #[error("unsupported field type for property \"{name}\"")]
    UnsupportedFieldType { name: String },

    #[error("pointer field {name:?} in {record} is not supported")]
    PointerField { record: String, name: String },

    #[error("map field {name:?} in {record} must have string keys")]
    MapKeyNotString { record: String, name: String },

    #[error("recursive structure: {record} nests itself")]
    RecursiveStructure { record: String },

    #[error("field {name:?} in {record} produces a slice of slices")]
    SliceOfSlice { record: String, name: String },

    #[error("{record} declares more than one {capability} capability")]
    ConflictingCapability {
        record: String,
        capability: &'static str,
    },

    #[error("property {name:?}: cannot load {found} into {expected}")]
    FieldMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("{hook} hook failed for {record}: {reason}")]
    Hook {
        record: String,
        hook: &'static str,
        reason: String,
    },

    #[error("invalid cache payload: {reason}")]
    Payload { reason: String },

    #[error("codec registry error for {record}: {reason}")]
    Registry { record: String, reason: String },
}

/// Key derivation and precondition errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("value type \"{type_name}\" does not provide an identifier")]
    NoIdentifier { type_name: String },

    #[error("{operation}: no keys provided")]
    NoKeys { operation: Operation },

    #[error("{operation}: incomplete key at index {index}: {key}")]
    IncompleteKey {
        operation: Operation,
        index: usize,
        key: Key,
    },

    #[error("kind mismatch at index {index}: expected {expected:?}, found {found:?}")]
    KindMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("{key} cannot be stored in a {expected} identifier")]
    IdentifierMismatch { key: Key, expected: &'static str },

    #[error("{operation}: {keys} keys but {values} values")]
    LengthMismatch {
        operation: Operation,
        keys: usize,
        values: usize,
    },
}

/// Backend collaborator errors, per item or per call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("no such entity: {key}")]
    NotFound { key: Key },

    #[error("transaction conflict: {reason}")]
    Conflict { reason: String },

    #[error("cross-group transaction touched {groups} entity groups")]
    EntityGroup { groups: usize },

    #[error("backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("backend error on {key}: {reason}")]
    Item { key: Key, reason: String },

    #[error("internal backend error: {reason}")]
    Internal { reason: String },
}

/// Cache tier errors. Never propagated out of a governing get, put or delete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("shared cache unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("LMDB {operation} failed: {reason}")]
    Lmdb {
        operation: &'static str,
        reason: String,
    },
}

/// Which end of a query range a cursor was supplied for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorBound {
    Start,
    End,
}

impl fmt::Display for CursorBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorBound::Start => f.write_str("start"),
            CursorBound::End => f.write_str("end"),
        }
    }
}

/// Query construction and execution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("invalid {bound} cursor: {reason}")]
    InvalidCursor { bound: CursorBound, reason: String },

    #[error("cursor is not available before the first call to next")]
    CursorUnavailable,

    #[error("invalid filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("invalid query: {reason}")]
    InvalidQuery { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Index-aligned per-item errors of a batched call.
///
/// Slot `i` holds the failure for input `i`, or `None` if that item succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiError {
    errors: Vec<Option<TesseraError>>,
}

impl MultiError {
    pub fn new(errors: Vec<Option<TesseraError>>) -> Self {
        Self { errors }
    }

    /// Wrap `errors` only if at least one slot failed.
    pub fn from_slots(errors: Vec<Option<TesseraError>>) -> Option<Self> {
        if errors.iter().any(Option::is_some) {
            Some(Self { errors })
        } else {
            None
        }
    }

    pub fn errors(&self) -> &[Option<TesseraError>] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<Option<TesseraError>> {
        self.errors
    }

    pub fn get(&self, index: usize) -> Option<&TesseraError> {
        self.errors.get(index).and_then(Option::as_ref)
    }

    pub fn failed(&self) -> usize {
        self.errors.iter().filter(|e| e.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} items failed", self.failed(), self.len())?;
        if let Some((index, err)) = self
            .errors
            .iter()
            .enumerate()
            .find_map(|(i, e)| e.as_ref().map(|e| (i, e)))
        {
            write!(f, " (first at index {}: {})", index, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Master error type for all tessera errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TesseraError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Multi(#[from] MultiError),

    #[error("nested transactions are not supported")]
    NestedTransaction,
}

impl TesseraError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, TesseraError::Backend(BackendError::NotFound { .. }))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, TesseraError::Backend(BackendError::Conflict { .. }))
    }

    /// The per-index errors, when this is an aggregate.
    pub fn as_multi(&self) -> Option<&MultiError> {
        match self {
            TesseraError::Multi(multi) => Some(multi),
            _ => None,
        }
    }
}

/// Result type alias for tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================
