//! Two-tier cache subsystem.
//!
//! - `traits`: the [`LocalCache`] and [`SharedCache`] tier contracts
//! - `local`: bounded LRU local tier
//! - `memory`: in-process shared tier with TTLs
//! - `lmdb_backend`: LMDB shared tier
//! - `cache_key`: cache key derivation from entity keys
//! - `layer`: read/write/delete algorithms, direct and transaction-buffered

mod cache_key;
mod layer;
mod lmdb_backend;
mod local;
mod memory;
mod traits;

pub use cache_key::CacheKeyer;
pub use layer::{BufferedCache, CacheHit, CacheLayer, CacheWrite, DirectCache, TransactionBuffer};
pub use lmdb_backend::LmdbSharedCache;
pub use local::LruLocalCache;
pub use memory::MemorySharedCache;
pub use traits::{CacheItem, CacheStats, LocalCache, LocalValue, SharedCache};
