//! Bounded LRU local tier.
//!
//! Entries are ordered by a monotonically increasing access tick; the
//! smallest tick is the least recently used and is evicted first when an
//! insert would exceed capacity.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::traits::{CacheStats, LocalCache, LocalValue};

struct LruInner {
    entries: HashMap<String, (LocalValue, u64)>,
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl LruInner {
    fn touch(&mut self, key: &str) -> Option<LocalValue> {
        self.tick += 1;
        let tick = self.tick;
        let (value, last) = self.entries.get_mut(key)?;
        let previous = std::mem::replace(last, tick);
        let value = value.clone();
        if let Some(name) = self.order.remove(&previous) {
            self.order.insert(tick, name);
        }
        Some(value)
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, tick)) => {
                self.order.remove(&tick);
                true
            }
            None => false,
        }
    }
}

/// LRU local cache with a fixed entry budget.
pub struct LruLocalCache {
    capacity: usize,
    inner: Mutex<LruInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LruLocalCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LruInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Whether `key` is cached, without counting a hit or refreshing recency.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }
}

impl LocalCache for LruLocalCache {
    fn get(&self, key: &str) -> Option<LocalValue> {
        let found = self.inner.lock().touch(key);
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn set(&self, key: &str, value: LocalValue) {
        let mut inner = self.inner.lock();
        inner.remove(key);

        while inner.entries.len() >= self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.order.insert(tick, key.to_string());
        inner.entries.insert(key.to_string(), (value, tick));
    }

    fn delete(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            memory_bytes: 0,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
