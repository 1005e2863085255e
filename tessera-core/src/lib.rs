//! Tessera Core - keys, properties and the entity codec
//!
//! Pure data model shared by every other crate: hierarchical keys and their
//! per-key state, typed property values, the record codec and its
//! process-wide registry, cache policy, query descriptors, configuration and
//! the error taxonomy. No I/O happens here.

use chrono::{DateTime, Utc};

pub mod codec;
pub mod config;
pub mod error;
pub mod key;
pub mod policy;
pub mod query;
pub mod value;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use codec::{
    codec, decode_payload, encode_payload, Blob, Capabilities, Codec, FieldBuilder, FieldKind,
    FieldOptions, FieldValue, Identity, MapKey, Parent, Record, Schema, Structure,
};
pub use config::{BatchLimits, StoreConfig, TransactionOptions};
pub use error::{
    BackendError, CacheError, CodecError, ConfigError, CursorBound, KeyError, MultiError,
    Operation, QueryError, TesseraError, TesseraResult,
};
pub use key::{Key, KeyId, KeyState, Source};
pub use policy::{CacheFlags, CachePolicy, SharedExpiration};
pub use query::{Cursor, Direction, Filter, FilterOp, Order, Query, QueryMode};
pub use value::{Property, Value};
