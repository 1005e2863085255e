//! Cache layer: the two-tier read and write algorithms.
//!
//! [`DirectCache`] applies effects to the tiers immediately.
//! [`BufferedCache`] is the transaction-scoped variant: it never serves
//! reads and records writes and deletes in a [`TransactionBuffer`] that is
//! reconciled into the parent `DirectCache` only after commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use tessera_core::{CachePolicy, Key, SharedExpiration, TesseraResult};

use super::cache_key::CacheKeyer;
use super::traits::{CacheItem, CacheStats, LocalCache, LocalValue, SharedCache};

/// A tier hit for one key.
#[derive(Clone)]
pub enum CacheHit {
    /// Decoded record from the local tier.
    Local(LocalValue),
    /// Encoded payload from the shared tier.
    Shared(Vec<u8>),
}

/// One record to cache, with the effective policy of its key.
#[derive(Clone)]
pub struct CacheWrite {
    pub key: Key,
    pub record: LocalValue,
    /// Shared-tier payload; `None` skips the shared tier for this key.
    pub payload: Option<Vec<u8>>,
    pub policy: CachePolicy,
    /// Per-call expiration override.
    pub expiration: Option<SharedExpiration>,
}

/// The cache operations the store drives.
#[async_trait]
pub trait CacheLayer: Send + Sync {
    /// Whether effects are buffered for a transaction.
    fn is_transactional(&self) -> bool;

    /// Look `keys` up tier by tier; `None` slots are misses.
    async fn read(&self, keys: &[Key], policies: &[CachePolicy]) -> Vec<Option<CacheHit>>;

    /// Copy a record served by the shared tier into the local tier.
    fn promote(&self, key: &Key, record: LocalValue);

    async fn write(&self, writes: Vec<CacheWrite>);

    async fn delete(&self, keys: &[Key]);
}

// ============================================================================
// DIRECT
// ============================================================================

/// Applies cache effects to both tiers immediately.
#[derive(Clone)]
pub struct DirectCache {
    local: Arc<dyn LocalCache>,
    shared: Option<Arc<dyn SharedCache>>,
    keyer: CacheKeyer,
    /// TTL sent for writes that resolve to the tier default.
    default_ttl: Option<Duration>,
}

impl DirectCache {
    pub fn new(
        local: Arc<dyn LocalCache>,
        shared: Option<Arc<dyn SharedCache>>,
        keyer: CacheKeyer,
    ) -> Self {
        Self {
            local,
            shared,
            keyer,
            default_ttl: None,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_shared(mut self, shared: Arc<dyn SharedCache>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn with_local(mut self, local: Arc<dyn LocalCache>) -> Self {
        self.local = local;
        self
    }

    pub fn keyer(&self) -> &CacheKeyer {
        &self.keyer
    }

    pub fn has_shared(&self) -> bool {
        self.shared.is_some()
    }

    pub fn flush_local(&self) {
        self.local.clear();
    }

    pub async fn flush_shared(&self) -> TesseraResult<()> {
        match &self.shared {
            Some(shared) => shared.flush().await,
            None => Ok(()),
        }
    }

    pub fn local_stats(&self) -> CacheStats {
        self.local.stats()
    }

    pub async fn shared_stats(&self) -> TesseraResult<Option<CacheStats>> {
        match &self.shared {
            Some(shared) => shared.stats().await.map(Some),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl CacheLayer for DirectCache {
    fn is_transactional(&self) -> bool {
        false
    }

    async fn read(&self, keys: &[Key], policies: &[CachePolicy]) -> Vec<Option<CacheHit>> {
        let cache_keys = self.keyer.keys(keys);
        let mut hits: Vec<Option<CacheHit>> = vec![None; keys.len()];
        let mut pending = Vec::new();

        for (i, policy) in policies.iter().enumerate() {
            if policy.read_local() {
                if let Some(value) = self.local.get(&cache_keys[i]) {
                    hits[i] = Some(CacheHit::Local(value));
                    continue;
                }
            }
            if policy.read_shared() {
                pending.push(i);
            }
        }
        let local_hits = keys.len() - hits.iter().filter(|h| h.is_none()).count();

        let mut shared_hits = 0;
        if let (Some(shared), false) = (&self.shared, pending.is_empty()) {
            let lookup: Vec<String> = pending.iter().map(|&i| cache_keys[i].clone()).collect();
            match shared.get_multi(&lookup).await {
                Ok(mut found) => {
                    for &i in &pending {
                        if let Some(bytes) = found.remove(&cache_keys[i]) {
                            hits[i] = Some(CacheHit::Shared(bytes));
                            shared_hits += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(operation = "get", keys = lookup.len(), error = %err, "shared cache read failed");
                }
            }
        }

        debug!(
            keys = keys.len(),
            local_hits,
            shared_hits,
            misses = keys.len() - local_hits - shared_hits,
            "cache read"
        );
        hits
    }

    fn promote(&self, key: &Key, record: LocalValue) {
        self.local.set(&self.keyer.key(key), record);
    }

    async fn write(&self, writes: Vec<CacheWrite>) {
        let mut items = Vec::new();
        let mut stale = Vec::new();
        for write in writes {
            let cache_key = self.keyer.key(&write.key);
            if write.policy.write_local() {
                self.local.set(&cache_key, write.record);
            } else {
                self.local.delete(&cache_key);
            }
            match (write.policy.shared_ttl(write.expiration), write.payload) {
                (Some(ttl), Some(value)) => items.push(CacheItem {
                    key: cache_key,
                    value,
                    ttl: ttl.or(self.default_ttl),
                }),
                _ => stale.push(cache_key),
            }
        }

        let Some(shared) = &self.shared else {
            return;
        };
        if !items.is_empty() {
            let count = items.len();
            if let Err(err) = shared.set_multi(items).await {
                warn!(operation = "set", keys = count, error = %err, "shared cache write failed");
            }
        }
        if !stale.is_empty() {
            if let Err(err) = shared.delete_multi(&stale).await {
                warn!(operation = "delete", keys = stale.len(), error = %err, "shared cache invalidation failed");
            }
        }
    }

    async fn delete(&self, keys: &[Key]) {
        let cache_keys = self.keyer.keys(keys);
        for key in &cache_keys {
            self.local.delete(key);
        }
        if let Some(shared) = &self.shared {
            if let Err(err) = shared.delete_multi(&cache_keys).await {
                warn!(operation = "delete", keys = cache_keys.len(), error = %err, "shared cache delete failed");
            }
        }
    }
}

// ============================================================================
// BUFFERED
// ============================================================================

/// Cache effects recorded by one transaction.
///
/// Each key lives in at most one of the two sets; the latest operation on
/// a key decides which.
#[derive(Default)]
pub struct TransactionBuffer {
    to_put: BTreeMap<Key, CacheWrite>,
    to_delete: BTreeSet<Key>,
}

impl TransactionBuffer {
    pub fn put(&mut self, write: CacheWrite) {
        self.to_delete.remove(&write.key);
        self.to_put.insert(write.key.clone(), write);
    }

    pub fn delete(&mut self, key: &Key) {
        self.to_put.remove(key);
        self.to_delete.insert(key.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.to_put.is_empty() && self.to_delete.is_empty()
    }

    /// Keys that will be written to the parent on reconcile.
    pub fn pending_puts(&self) -> impl Iterator<Item = &Key> {
        self.to_put.keys()
    }

    /// Keys that will be deleted from the parent on reconcile.
    pub fn pending_deletes(&self) -> impl Iterator<Item = &Key> {
        self.to_delete.iter()
    }

    /// Apply the buffer to `parent`: deletes first, then puts.
    pub async fn reconcile(self, parent: &DirectCache) {
        let TransactionBuffer { to_put, to_delete } = self;
        let deletes: Vec<Key> = to_delete
            .into_iter()
            .filter(|key| !to_put.contains_key(key))
            .collect();
        debug!(
            puts = to_put.len(),
            deletes = deletes.len(),
            "reconciling transaction cache effects"
        );
        if !deletes.is_empty() {
            parent.delete(&deletes).await;
        }
        if !to_put.is_empty() {
            parent.write(to_put.into_values().collect()).await;
        }
    }
}

/// Transaction-scoped cache: no reads, buffered writes and deletes.
#[derive(Default)]
pub struct BufferedCache {
    buffer: Mutex<TransactionBuffer>,
}

impl BufferedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the recorded effects, leaving the buffer empty.
    pub fn take(&self) -> TransactionBuffer {
        std::mem::take(&mut *self.buffer.lock())
    }
}

#[async_trait]
impl CacheLayer for BufferedCache {
    fn is_transactional(&self) -> bool {
        true
    }

    async fn read(&self, keys: &[Key], _policies: &[CachePolicy]) -> Vec<Option<CacheHit>> {
        vec![None; keys.len()]
    }

    fn promote(&self, _key: &Key, _record: LocalValue) {}

    async fn write(&self, writes: Vec<CacheWrite>) {
        let mut buffer = self.buffer.lock();
        for write in writes {
            buffer.put(write);
        }
    }

    async fn delete(&self, keys: &[Key]) {
        let mut buffer = self.buffer.lock();
        for key in keys {
            buffer.delete(key);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
