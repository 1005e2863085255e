//! Cache tier traits.
//!
//! Two tiers sit in front of the backend. The local tier lives in process
//! memory and holds decoded records behind a type-erased `Arc`; it is
//! synchronous and must tolerate concurrent callers. The shared tier is a
//! distributed byte store reached asynchronously, so everything it holds
//! has gone through the stable payload encoding.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_core::TesseraResult;

/// A decoded record held by the local tier.
pub type LocalValue = Arc<dyn Any + Send + Sync>;

/// Process-local cache tier.
///
/// # Implementation Requirements
///
/// - Safe for concurrent reads and writes from many callers
/// - Bounded; eviction policy is up to the implementation
/// - `get` returns whatever was last `set` under the key unless evicted
pub trait LocalCache: Send + Sync {
    /// Look up a decoded record.
    fn get(&self, key: &str) -> Option<LocalValue>;

    /// Insert or replace a decoded record.
    fn set(&self, key: &str, value: LocalValue);

    /// Remove a record. Removing an absent key is a no-op.
    fn delete(&self, key: &str);

    /// Drop every entry.
    fn clear(&self);

    /// Usage counters.
    fn stats(&self) -> CacheStats;
}

/// One item of a shared tier bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub key: String,
    pub value: Vec<u8>,
    /// `None` defers to the tier's own default expiration.
    pub ttl: Option<Duration>,
}

/// Shared (cross-process) cache tier.
///
/// Every method is a bulk call; callers batch all keys of one operation
/// into a single round trip. Failures are reported but callers treat the
/// tier as best-effort: a failed read is a miss and a failed write or
/// delete is logged and ignored.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Fetch every key that is present and not expired.
    async fn get_multi(&self, keys: &[String]) -> TesseraResult<HashMap<String, Vec<u8>>>;

    /// Store every item, replacing existing values.
    async fn set_multi(&self, items: Vec<CacheItem>) -> TesseraResult<()>;

    /// Remove every key. Absent keys are ignored.
    async fn delete_multi(&self, keys: &[String]) -> TesseraResult<()>;

    /// Drop every entry. Test and diagnostic use only.
    async fn flush(&self) -> TesseraResult<()>;

    /// Get cache statistics.
    async fn stats(&self) -> TesseraResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes, where the tier can tell.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity or expiry.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
