//! Tessera Store - cached, batched access to an entity store
//!
//! Wraps a remote [`Backend`] with a process-local LRU tier and an optional
//! shared tier. Batched reads and writes are chunked to the backend's
//! limits and reassembled in input order; queries can be answered through
//! the cached read path; transactions buffer their cache effects until
//! commit.

pub mod backend;
pub mod batch;
pub mod cache;
pub mod entry;
pub mod memory;
pub mod query;
pub mod store;
pub mod transaction;

pub use backend::{Backend, BackendTransaction, ItemResult, QueryCursor, QueryRow};
pub use batch::{check_complete, BatchExecutor, BatchOutcome, Fetched, Written};
pub use entry::Entry;
pub use memory::{MemoryBackend, MemoryCursor, MemoryTransaction};
pub use query::{Page, QueryIter};
pub use store::{KeyPolicy, Store};

// Re-export cache types for callers wiring their own tiers
pub use cache::{
    BufferedCache, CacheHit, CacheItem, CacheKeyer, CacheLayer, CacheStats, CacheWrite,
    DirectCache, LmdbSharedCache, LocalCache, LocalValue, LruLocalCache, MemorySharedCache,
    SharedCache, TransactionBuffer,
};
