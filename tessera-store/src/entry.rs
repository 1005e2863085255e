//! Per-key read results.

use tessera_core::{Key, KeyState};

/// A record read by key, with the state of its last round trip.
///
/// A missing or failed entry holds the record type's zero value; use
/// [`Entry::exists`] and `state.error` to tell them apart.
#[derive(Debug, Clone)]
pub struct Entry<R> {
    pub key: Key,
    pub state: KeyState,
    pub value: R,
    found: bool,
}

impl<R: Default> Entry<R> {
    pub(crate) fn found(key: Key, value: R, state: KeyState) -> Self {
        Self {
            key,
            state,
            value,
            found: true,
        }
    }

    pub(crate) fn missing(key: Key, state: KeyState) -> Self {
        Self {
            key,
            state,
            value: R::default(),
            found: false,
        }
    }

    /// Whether the entity exists.
    pub fn exists(&self) -> bool {
        self.found
    }

    pub fn into_value(self) -> Option<R> {
        self.found.then_some(self.value)
    }
}
