//! Key model: hierarchical record identity plus per-key operational state.
//!
//! A [`Key`] is pure identity (kind, id, parent chain) and is compared,
//! hashed and ordered on that identity alone. Round-trip bookkeeping lives
//! in the separately owned [`KeyState`], which only the batch executor and
//! the cache layer ever fill in.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TesseraError;
use crate::Timestamp;

// ============================================================================
// KEY IDENTITY
// ============================================================================

/// The leaf identifier of a key.
///
/// `Numeric(0)` and `Text("")` both denote an incomplete key that still
/// waits for a backend-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyId {
    Numeric(i64),
    Text(String),
}

impl KeyId {
    fn is_set(&self) -> bool {
        match self {
            KeyId::Numeric(id) => *id != 0,
            KeyId::Text(id) => !id.is_empty(),
        }
    }
}

impl Ord for KeyId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyId::Numeric(a), KeyId::Numeric(b)) => a.cmp(b),
            (KeyId::Text(a), KeyId::Text(b)) => a.cmp(b),
            (KeyId::Numeric(_), KeyId::Text(_)) => Ordering::Less,
            (KeyId::Text(_), KeyId::Numeric(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for KeyId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyId::Numeric(id) => write!(f, "{}", id),
            KeyId::Text(id) => write!(f, "{}", id),
        }
    }
}

/// Hierarchical record identifier: kind + id + optional parent key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    kind: String,
    id: KeyId,
    parent: Option<Box<Key>>,
}

impl Key {
    /// Build a key with a numeric id. An id of zero yields an incomplete key.
    pub fn numeric(kind: impl Into<String>, id: i64, parent: Option<Key>) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Numeric(id),
            parent: parent.map(Box::new),
        }
    }

    /// Build a key with a text id. An empty id yields an incomplete key.
    pub fn text(kind: impl Into<String>, id: impl Into<String>, parent: Option<Key>) -> Self {
        Self {
            kind: kind.into(),
            id: KeyId::Text(id.into()),
            parent: parent.map(Box::new),
        }
    }

    /// Build an incomplete key; the backend assigns a numeric id on put.
    pub fn incomplete(kind: impl Into<String>, parent: Option<Key>) -> Self {
        Self::numeric(kind, 0, parent)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &KeyId {
        &self.id
    }

    /// The numeric id, if this key uses one.
    pub fn numeric_id(&self) -> Option<i64> {
        match self.id {
            KeyId::Numeric(id) => Some(id),
            KeyId::Text(_) => None,
        }
    }

    /// The text id, if this key uses one.
    pub fn text_id(&self) -> Option<&str> {
        match &self.id {
            KeyId::Text(id) => Some(id),
            KeyId::Numeric(_) => None,
        }
    }

    pub fn parent(&self) -> Option<&Key> {
        self.parent.as_deref()
    }

    /// A key is complete iff it has a non-zero numeric id or a non-empty text id.
    pub fn is_complete(&self) -> bool {
        self.id.is_set()
    }

    /// Kind, id and the whole parent chain must match.
    pub fn is_equal(&self, other: &Key) -> bool {
        self == other
    }

    /// The top-most ancestor; identifies the entity group.
    pub fn root(&self) -> &Key {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// True when `ancestor` equals this key or any key in its parent chain.
    pub fn has_ancestor(&self, ancestor: &Key) -> bool {
        let mut current = Some(self);
        while let Some(key) = current {
            if key == ancestor {
                return true;
            }
            current = key.parent();
        }
        false
    }

    /// A copy of this key carrying a backend-assigned numeric id.
    pub fn with_numeric_id(&self, id: i64) -> Key {
        Key {
            kind: self.kind.clone(),
            id: KeyId::Numeric(id),
            parent: self.parent.clone(),
        }
    }

    /// Path from the root down to this key.
    pub fn path(&self) -> Vec<&Key> {
        let mut path = Vec::new();
        let mut current = Some(self);
        while let Some(key) = current {
            path.push(key);
            current = key.parent();
        }
        path.reverse();
        path
    }

    /// Stable textual encoding of the full path, used to derive cache keys.
    ///
    /// Format: `Kind:n:12/Child:s:abc`. Kind and text segments are
    /// percent-escaped for `%`, `/` and `:` so that the encoding is injective.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, key) in self.path().into_iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            escape_into(&mut out, &key.kind);
            match &key.id {
                KeyId::Numeric(id) => {
                    out.push_str(":n:");
                    out.push_str(&id.to_string());
                }
                KeyId::Text(id) => {
                    out.push_str(":s:");
                    escape_into(&mut out, id);
                }
            }
        }
        out
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
}

/// The zero key: no kind, no id. Used as the empty value of key-typed fields.
impl Default for Key {
    fn default() -> Self {
        Self::incomplete(String::new(), None)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        let left = self.path();
        let right = other.path();
        for (a, b) in left.iter().zip(right.iter()) {
            let ord = a.kind.cmp(&b.kind).then_with(|| a.id.cmp(&b.id));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        left.len().cmp(&right.len())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key{{'{}', {}}}", self.kind, self.id)?;
        if let Some(parent) = self.parent() {
            write!(f, "[Parent{}]", parent)?;
        }
        Ok(())
    }
}

// ============================================================================
// KEY STATE
// ============================================================================

/// Where a value was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Local,
    Shared,
    Backend,
}

/// Per-key operational metadata, correlated with a [`Key`] by position.
///
/// Never part of key equality.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    /// When the backend last confirmed this key (read or write).
    pub synced_at: Option<Timestamp>,
    /// Per-key failure from the last round trip.
    pub error: Option<TesseraError>,
    /// Which tier produced the value, if any.
    pub source: Option<Source>,
}

impl KeyState {
    /// State after a successful backend round trip.
    pub fn synced(at: Timestamp) -> Self {
        Self {
            synced_at: Some(at),
            error: None,
            source: Some(Source::Backend),
        }
    }

    /// State for a value served from a cache tier.
    pub fn cached(source: Source) -> Self {
        Self {
            synced_at: None,
            error: None,
            source: Some(source),
        }
    }

    /// State for a key whose round trip failed.
    pub fn failed(error: TesseraError) -> Self {
        Self {
            synced_at: None,
            error: Some(error),
            source: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
