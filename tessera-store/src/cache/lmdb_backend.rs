//! LMDB-backed shared tier.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! byte store that several processes on one host can open concurrently,
//! which makes it a usable shared tier without a network cache.
//!
//! # Value Format
//!
//! `[expires_at_ms: 8 bytes LE i64][payload]`. An expiry of 0 means the
//! entry never expires. Expired entries read as misses and are purged by
//! the read that discovers them.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The tier uses:
//! - Read transactions for `get_multi`
//! - Write transactions for `set_multi`, `delete_multi`, `flush` and purges
//! - Statistics are tracked behind a lock

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use parking_lot::RwLock;
use tessera_core::{CacheError, TesseraResult};

use super::traits::{CacheItem, CacheStats, SharedCache};

const HEADER_LEN: usize = 8;

fn lmdb_err(operation: &'static str) -> impl Fn(heed::Error) -> CacheError {
    move |e| CacheError::Lmdb {
        operation,
        reason: e.to_string(),
    }
}

/// Frame `payload` with its absolute expiry.
fn frame(payload: &[u8], ttl: Option<Duration>, now_ms: i64) -> Vec<u8> {
    let expires_at = match ttl {
        Some(ttl) => now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64),
        None => 0,
    };
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&expires_at.to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

enum Framed<'a> {
    Live(&'a [u8]),
    Expired,
    Corrupt,
}

fn unframe(bytes: &[u8], now_ms: i64) -> Framed<'_> {
    if bytes.len() < HEADER_LEN {
        return Framed::Corrupt;
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let expires_at = i64::from_le_bytes(header);
    if expires_at != 0 && now_ms >= expires_at {
        Framed::Expired
    } else {
        Framed::Live(&bytes[HEADER_LEN..])
    }
}

/// LMDB-backed shared cache.
///
/// # Example
///
/// ```ignore
/// use tessera_store::cache::{LmdbSharedCache, SharedCache};
///
/// let tier = LmdbSharedCache::open("/tmp/tessera-cache", 100)?
///     .with_default_ttl(Duration::from_secs(600));
/// let store = Store::new(backend, config)?.with_shared_cache(Arc::new(tier));
/// ```
pub struct LmdbSharedCache {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Expiration for items written without a TTL.
    default_ttl: Option<Duration>,
    stats: RwLock<CacheStats>,
}

impl LmdbSharedCache {
    /// Open (or create) the cache under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> TesseraResult<Self> {
        std::fs::create_dir_all(&path).map_err(|e| CacheError::Lmdb {
            operation: "create_dir",
            reason: e.to_string(),
        })?;

        // SAFETY: the environment is opened once per path by this process and
        // never remapped while transactions are live.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(lmdb_err("open"))?;

        let mut wtxn = env.write_txn().map_err(lmdb_err("write_txn"))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(lmdb_err("create_database"))?;
        wtxn.commit().map_err(lmdb_err("commit"))?;

        let entry_count = {
            let rtxn = env.read_txn().map_err(lmdb_err("read_txn"))?;
            db.len(&rtxn).map_err(lmdb_err("len"))?
        };

        Ok(Self {
            env,
            db,
            default_ttl: None,
            stats: RwLock::new(CacheStats {
                entry_count,
                ..Default::default()
            }),
        })
    }

    /// Expiration applied to items written without their own TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    fn purge(&self, keys: &[String], now_ms: i64) -> TesseraResult<u64> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err("write_txn"))?;
        let mut purged = 0u64;
        for key in keys {
            // Re-check under the write transaction; a writer may have refreshed it.
            let expired = match self.db.get(&wtxn, key.as_bytes()).map_err(lmdb_err("get"))? {
                Some(bytes) => matches!(unframe(bytes, now_ms), Framed::Expired | Framed::Corrupt),
                None => false,
            };
            if expired && self.db.delete(&mut wtxn, key.as_bytes()).map_err(lmdb_err("delete"))? {
                purged += 1;
            }
        }
        wtxn.commit().map_err(lmdb_err("commit"))?;
        Ok(purged)
    }
}

#[async_trait]
impl SharedCache for LmdbSharedCache {
    async fn get_multi(&self, keys: &[String]) -> TesseraResult<HashMap<String, Vec<u8>>> {
        let now_ms = Utc::now().timestamp_millis();
        let mut found = HashMap::new();
        let mut stale = Vec::new();
        {
            let rtxn = self.env.read_txn().map_err(lmdb_err("read_txn"))?;
            for key in keys {
                match self.db.get(&rtxn, key.as_bytes()).map_err(lmdb_err("get"))? {
                    Some(bytes) => match unframe(bytes, now_ms) {
                        Framed::Live(payload) => {
                            found.insert(key.clone(), payload.to_vec());
                        }
                        Framed::Expired | Framed::Corrupt => stale.push(key.clone()),
                    },
                    None => {}
                }
            }
        }

        let purged = if stale.is_empty() {
            0
        } else {
            self.purge(&stale, now_ms)?
        };

        let mut stats = self.stats.write();
        stats.hits += found.len() as u64;
        stats.misses += (keys.len() - found.len()) as u64;
        stats.evictions += purged;
        stats.entry_count = stats.entry_count.saturating_sub(purged);
        Ok(found)
    }

    async fn set_multi(&self, items: Vec<CacheItem>) -> TesseraResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let mut wtxn = self.env.write_txn().map_err(lmdb_err("write_txn"))?;
        let mut added = 0u64;
        let mut bytes_written = 0u64;
        for item in &items {
            let framed = frame(&item.value, item.ttl.or(self.default_ttl), now_ms);
            let is_new = self
                .db
                .get(&wtxn, item.key.as_bytes())
                .map_err(lmdb_err("get"))?
                .is_none();
            self.db
                .put(&mut wtxn, item.key.as_bytes(), &framed)
                .map_err(lmdb_err("put"))?;
            if is_new {
                added += 1;
            }
            bytes_written += framed.len() as u64;
        }
        wtxn.commit().map_err(lmdb_err("commit"))?;

        let mut stats = self.stats.write();
        stats.entry_count += added;
        stats.memory_bytes += bytes_written;
        Ok(())
    }

    async fn delete_multi(&self, keys: &[String]) -> TesseraResult<()> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err("write_txn"))?;
        let mut deleted = 0u64;
        for key in keys {
            if self
                .db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(lmdb_err("delete"))?
            {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(lmdb_err("commit"))?;

        let mut stats = self.stats.write();
        stats.entry_count = stats.entry_count.saturating_sub(deleted);
        Ok(())
    }

    async fn flush(&self) -> TesseraResult<()> {
        let mut wtxn = self.env.write_txn().map_err(lmdb_err("write_txn"))?;
        self.db.clear(&mut wtxn).map_err(lmdb_err("clear"))?;
        wtxn.commit().map_err(lmdb_err("commit"))?;

        let mut stats = self.stats.write();
        stats.entry_count = 0;
        stats.memory_bytes = 0;
        Ok(())
    }

    async fn stats(&self) -> TesseraResult<CacheStats> {
        Ok(self.stats.read().clone())
    }
}
