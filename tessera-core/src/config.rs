//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ConfigError, TesseraResult};
use crate::policy::CachePolicy;

/// Backend batch-size ceilings, one per operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub get: usize,
    pub put: usize,
    pub delete: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            get: 1000,
            put: 500,
            delete: 500,
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Chunk sizes handed to the batch executor
    pub batch: BatchLimits,
    /// Default per-operation cache policy
    pub policy: CachePolicy,
    /// Local tier capacity in entries (LRU eviction)
    pub local_capacity: usize,
    /// Prefix folded into every cache key
    pub cache_namespace: String,
    /// Bump to invalidate cached entries written by an older record layout
    pub cache_version: u32,
    /// Cache keys longer than this are replaced by a SHA-256 digest
    pub max_shared_key_len: usize,
    /// TTL sent to the shared tier for writes resolving to `SharedExpiration::BackendDefault`
    pub shared_default_ttl: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch: BatchLimits::default(),
            policy: CachePolicy::default(),
            local_capacity: 10_000,
            cache_namespace: "tessera".to_string(),
            cache_version: 1,
            max_shared_key_len: 250,
            shared_default_ttl: None,
        }
    }
}

impl StoreConfig {
    pub fn with_batch_limits(mut self, batch: BatchLimits) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local_capacity = capacity;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = namespace.into();
        self
    }

    pub fn with_cache_version(mut self, version: u32) -> Self {
        self.cache_version = version;
        self
    }

    pub fn with_max_shared_key_len(mut self, len: usize) -> Self {
        self.max_shared_key_len = len;
        self
    }

    pub fn with_shared_default_ttl(mut self, ttl: Duration) -> Self {
        self.shared_default_ttl = Some(ttl);
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - every batch limit > 0
    /// - local_capacity > 0
    /// - cache_namespace is non-empty and contains no ':'
    /// - max_shared_key_len leaves room for a hashed key
    pub fn validate(&self) -> TesseraResult<()> {
        let limits = [
            ("batch.get", self.batch.get),
            ("batch.put", self.batch.put),
            ("batch.delete", self.batch.delete),
        ];
        for (field, limit) in limits {
            if limit == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "batch limit must be greater than 0".to_string(),
                }
                .into());
            }
        }

        if self.local_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "local_capacity",
                reason: "local_capacity must be greater than 0".to_string(),
            }
            .into());
        }

        if self.cache_namespace.is_empty() || self.cache_namespace.contains(':') {
            return Err(ConfigError::InvalidValue {
                field: "cache_namespace",
                reason: format!(
                    "namespace {:?} must be non-empty and free of ':'",
                    self.cache_namespace
                ),
            }
            .into());
        }

        // namespace + version + ":h:" + 64 hex chars
        let hashed_len = self.cache_namespace.len() + self.cache_version.to_string().len() + 68;
        if self.max_shared_key_len < hashed_len {
            return Err(ConfigError::InvalidValue {
                field: "max_shared_key_len",
                reason: format!(
                    "max_shared_key_len {} is shorter than a hashed key ({})",
                    self.max_shared_key_len, hashed_len
                ),
            }
            .into());
        }

        Ok(())
    }
}

/// Options for a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    /// Allow the transaction to touch more than one entity group
    pub cross_group: bool,
}

impl TransactionOptions {
    pub fn cross_group() -> Self {
        Self { cross_group: true }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TesseraError;

    #[test]
    fn test_default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.get, 1000);
        assert_eq!(config.batch.put, 500);
        assert_eq!(config.batch.delete, 500);
    }

    #[test]
    fn test_zero_batch_limit_rejected() {
        let config = StoreConfig::default().with_batch_limits(BatchLimits {
            get: 10,
            put: 0,
            delete: 10,
        });
        match config.validate() {
            Err(TesseraError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "batch.put")
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_namespace_with_separator_rejected() {
        let config = StoreConfig::default().with_namespace("a:b");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tiny_key_budget_rejected() {
        let config = StoreConfig::default().with_max_shared_key_len(20);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = StoreConfig::default()
            .with_cache_version(3)
            .with_shared_default_ttl(Duration::from_secs(30));
        let json = serde_json::to_string(&config).unwrap();
        let back: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
