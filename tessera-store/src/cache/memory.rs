//! In-process shared tier.
//!
//! Stands in for a distributed cache in tests and single-process
//! deployments. Honors per-item TTLs, and can be switched into an
//! unavailable state to exercise the best-effort paths of the cache layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tessera_core::{CacheError, TesseraResult};

use super::traits::{CacheItem, CacheStats, SharedCache};

#[derive(Debug, Clone)]
struct StoredItem {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredItem {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// TTL-aware shared tier held in process memory.
#[derive(Debug, Default)]
pub struct MemorySharedCache {
    items: RwLock<HashMap<String, StoredItem>>,
    default_ttl: Option<Duration>,
    unavailable: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiration applied to items written without their own TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether `key` holds a live entry. Does not count toward stats.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.items
            .read()
            .get(key)
            .is_some_and(|item| !item.is_expired(now))
    }

    /// Raw bytes stored under `key`, ignoring expiry.
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.items.read().get(key).map(|item| item.value.clone())
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn check_available(&self) -> TesseraResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable {
                reason: "memory shared cache switched off".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get_multi(&self, keys: &[String]) -> TesseraResult<HashMap<String, Vec<u8>>> {
        self.check_available()?;
        let now = Instant::now();
        let mut found = HashMap::new();
        let mut expired = Vec::new();
        {
            let items = self.items.read();
            for key in keys {
                match items.get(key) {
                    Some(item) if item.is_expired(now) => expired.push(key.clone()),
                    Some(item) => {
                        found.insert(key.clone(), item.value.clone());
                    }
                    None => {}
                }
            }
        }

        if !expired.is_empty() {
            let mut items = self.items.write();
            for key in &expired {
                if items.get(key).is_some_and(|item| item.is_expired(now)) {
                    items.remove(key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses
            .fetch_add((keys.len() - found.len()) as u64, Ordering::Relaxed);
        Ok(found)
    }

    async fn set_multi(&self, items: Vec<CacheItem>) -> TesseraResult<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut stored = self.items.write();
        for item in items {
            let ttl = item.ttl.or(self.default_ttl);
            stored.insert(
                item.key,
                StoredItem {
                    value: item.value,
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        }
        Ok(())
    }

    async fn delete_multi(&self, keys: &[String]) -> TesseraResult<()> {
        self.check_available()?;
        let mut items = self.items.write();
        for key in keys {
            items.remove(key);
        }
        Ok(())
    }

    async fn flush(&self) -> TesseraResult<()> {
        self.check_available()?;
        self.items.write().clear();
        Ok(())
    }

    async fn stats(&self) -> TesseraResult<CacheStats> {
        let items = self.items.read();
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: items.len() as u64,
            memory_bytes: items
                .iter()
                .map(|(k, v)| (k.len() + v.value.len()) as u64)
                .sum(),
            evictions: self.evictions.load(Ordering::Relaxed),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
