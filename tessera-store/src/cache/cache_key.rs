//! Cache key derivation.
//!
//! Both tiers address entries by a string derived from the full key path,
//! prefixed with the namespace and the cache version so that bumping the
//! version orphans every entry written under an older record shape.
//!
//! # Format
//!
//! `<namespace>:<version>:<encoded key path>`, e.g.
//! `tessera:1:Shelf:n:1/Widget:n:7`. A derived key longer than the
//! configured ceiling is replaced by `<namespace>:<version>:h:<sha256 hex>`
//! of the full form, which keeps it within shared-tier key limits while
//! staying unique. The `h:` marker cannot collide with an encoded path,
//! whose first segment always carries an `:n:` or `:s:` id tag.

use sha2::{Digest, Sha256};
use tessera_core::{Key, StoreConfig};

/// Derives tier cache keys from entity keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyer {
    prefix: String,
    max_len: usize,
}

impl CacheKeyer {
    pub fn new(namespace: &str, version: u32, max_len: usize) -> Self {
        Self {
            prefix: format!("{}:{}:", namespace, version),
            max_len,
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            &config.cache_namespace,
            config.cache_version,
            config.max_shared_key_len,
        )
    }

    /// The prefix shared by every key this keyer produces.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Cache key for `key`.
    pub fn key(&self, key: &Key) -> String {
        let full = format!("{}{}", self.prefix, key.encode());
        if full.len() <= self.max_len {
            return full;
        }
        let digest = Sha256::digest(full.as_bytes());
        format!("{}h:{}", self.prefix, hex::encode(digest))
    }

    /// Cache keys for every entry of `keys`, index-aligned.
    pub fn keys(&self, keys: &[Key]) -> Vec<String> {
        keys.iter().map(|k| self.key(k)).collect()
    }
}

impl Default for CacheKeyer {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
