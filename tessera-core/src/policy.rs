//! Cache policy: which tiers an operation may read and write, and how long
//! shared-tier entries live.

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Tier read/write switches.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CacheFlags: u8 {
        /// Consult the process-local tier on reads
        const READ_LOCAL = 0b0000_0001;
        /// Populate the process-local tier
        const WRITE_LOCAL = 0b0000_0010;
        /// Consult the shared tier on reads
        const READ_SHARED = 0b0000_0100;
        /// Populate the shared tier
        const WRITE_SHARED = 0b0000_1000;
    }
}

impl Default for CacheFlags {
    fn default() -> Self {
        Self::all()
    }
}

// Manual serde implementation for CacheFlags (bitflags 2.x + serde)
impl Serialize for CacheFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CacheFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid CacheFlags bits: {:#04x}", bits))
        })
    }
}

/// Lifetime of an entry written to the shared tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedExpiration {
    /// Defer to the tier's own default TTL.
    #[default]
    BackendDefault,
    /// Expire after the given duration. A zero duration means `BackendDefault`.
    After(Duration),
    /// Never write this entry to the shared tier.
    DoNotCache,
}

/// Per-operation cache policy, overridable per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    pub flags: CacheFlags,
    pub shared_expiration: SharedExpiration,
}

impl CachePolicy {
    /// Every tier disabled; reads and writes go straight to the backend.
    pub fn no_cache() -> Self {
        Self {
            flags: CacheFlags::empty(),
            shared_expiration: SharedExpiration::DoNotCache,
        }
    }

    /// Only the process-local tier.
    pub fn local_only() -> Self {
        Self {
            flags: CacheFlags::READ_LOCAL | CacheFlags::WRITE_LOCAL,
            shared_expiration: SharedExpiration::DoNotCache,
        }
    }

    pub fn with_flags(mut self, flags: CacheFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn without(mut self, flags: CacheFlags) -> Self {
        self.flags.remove(flags);
        self
    }

    pub fn with_expiration(mut self, expiration: SharedExpiration) -> Self {
        self.shared_expiration = expiration;
        self
    }

    pub fn read_local(&self) -> bool {
        self.flags.contains(CacheFlags::READ_LOCAL)
    }

    pub fn write_local(&self) -> bool {
        self.flags.contains(CacheFlags::WRITE_LOCAL)
    }

    pub fn read_shared(&self) -> bool {
        self.flags.contains(CacheFlags::READ_SHARED)
    }

    pub fn write_shared(&self) -> bool {
        self.flags.contains(CacheFlags::WRITE_SHARED)
    }

    /// Resolve the shared-tier TTL for a write.
    ///
    /// Returns `None` when the entry must not reach the shared tier,
    /// `Some(None)` for the tier default and `Some(Some(ttl))` otherwise.
    /// Precedence: a policy of `DoNotCache` (or a cleared `WRITE_SHARED`)
    /// always skips; then the per-call override; then the policy value.
    pub fn shared_ttl(&self, override_with: Option<SharedExpiration>) -> Option<Option<Duration>> {
        if !self.write_shared() || self.shared_expiration == SharedExpiration::DoNotCache {
            return None;
        }
        match override_with.unwrap_or(self.shared_expiration) {
            SharedExpiration::DoNotCache => None,
            SharedExpiration::BackendDefault => Some(None),
            SharedExpiration::After(ttl) if ttl.is_zero() => Some(None),
            SharedExpiration::After(ttl) => Some(Some(ttl)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_enables_every_tier() {
        let policy = CachePolicy::default();
        assert!(policy.read_local());
        assert!(policy.write_local());
        assert!(policy.read_shared());
        assert!(policy.write_shared());
        assert_eq!(policy.shared_ttl(None), Some(None));
    }

    #[test]
    fn test_do_not_cache_beats_override() {
        let policy = CachePolicy::default().with_expiration(SharedExpiration::DoNotCache);
        let ttl = policy.shared_ttl(Some(SharedExpiration::After(Duration::from_secs(5))));
        assert_eq!(ttl, None);
    }

    #[test]
    fn test_override_beats_policy_value() {
        let policy = CachePolicy::default()
            .with_expiration(SharedExpiration::After(Duration::from_secs(60)));
        assert_eq!(
            policy.shared_ttl(Some(SharedExpiration::After(Duration::from_secs(5)))),
            Some(Some(Duration::from_secs(5)))
        );
        assert_eq!(policy.shared_ttl(None), Some(Some(Duration::from_secs(60))));
    }

    #[test]
    fn test_zero_duration_is_backend_default() {
        let policy = CachePolicy::default().with_expiration(SharedExpiration::After(Duration::ZERO));
        assert_eq!(policy.shared_ttl(None), Some(None));
    }

    #[test]
    fn test_write_shared_flag_cleared_skips() {
        let policy = CachePolicy::default().without(CacheFlags::WRITE_SHARED);
        assert_eq!(
            policy.shared_ttl(Some(SharedExpiration::BackendDefault)),
            None
        );
    }

    #[test]
    fn test_override_do_not_cache_skips() {
        let policy = CachePolicy::default();
        assert_eq!(policy.shared_ttl(Some(SharedExpiration::DoNotCache)), None);
    }

    #[test]
    fn test_flags_serde_roundtrip() {
        let policy = CachePolicy::local_only();
        let json = serde_json::to_string(&policy).unwrap();
        let back: CachePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_invalid_flag_bits_rejected() {
        let result: Result<CacheFlags, _> = serde_json::from_str("255");
        assert!(result.is_err());
    }
}
