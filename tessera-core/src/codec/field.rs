//! Field types the codec can persist.
//!
//! Scalars map onto a single [`Value`]; `Vec<T>` is a repeated field;
//! `BTreeMap<K, V>` is a map field flattened into `name.key` properties.
//! `Option<T>` and `Box<T>` are pointer kinds and are rejected when a
//! record type is registered.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::key::Key;
use crate::value::Value;

/// Raw byte sequence. Never indexed and never treated as a repeated field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Blob(pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

/// Shape of a field type, inspected once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Float,
    Bool,
    Text,
    Bytes,
    Time,
    Key,
    Repeated(Box<FieldKind>),
    Map { text_keys: bool, value: Box<FieldKind> },
    Pointer(Box<FieldKind>),
}

impl FieldKind {
    pub fn contains_pointer(&self) -> bool {
        match self {
            FieldKind::Pointer(_) => true,
            FieldKind::Repeated(inner) => inner.contains_pointer(),
            FieldKind::Map { value, .. } => value.contains_pointer(),
            _ => false,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            FieldKind::Repeated(_) | FieldKind::Map { .. } | FieldKind::Pointer(_)
        )
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Int => f.write_str("int"),
            FieldKind::Float => f.write_str("float"),
            FieldKind::Bool => f.write_str("bool"),
            FieldKind::Text => f.write_str("text"),
            FieldKind::Bytes => f.write_str("bytes"),
            FieldKind::Time => f.write_str("time"),
            FieldKind::Key => f.write_str("key"),
            FieldKind::Repeated(inner) => write!(f, "[]{}", inner),
            FieldKind::Map { text_keys, value } => {
                let key = if *text_keys { "text" } else { "int" };
                write!(f, "map[{}]{}", key, value)
            }
            FieldKind::Pointer(inner) => write!(f, "*{}", inner),
        }
    }
}

/// One value produced by a field; `suffix` carries the map key for map fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Saved {
    pub suffix: Option<String>,
    pub value: Value,
}

impl Saved {
    fn plain(value: Value) -> Self {
        Self {
            suffix: None,
            value,
        }
    }
}

/// A record field the codec can save and load.
pub trait FieldValue: Default + Send + Sync + 'static {
    fn kind() -> FieldKind;

    /// True when the value equals the type's zero value.
    fn is_zero(&self) -> bool;

    fn save(&self, out: &mut Vec<Saved>);

    /// Load one incoming value. On a type mismatch the value is handed back.
    fn load(&mut self, suffix: Option<&str>, value: Value) -> Result<(), Value>;
}

macro_rules! int_field {
    ($($ty:ty),*) => {$(
        impl FieldValue for $ty {
            fn kind() -> FieldKind {
                FieldKind::Int
            }

            fn is_zero(&self) -> bool {
                *self == 0
            }

            fn save(&self, out: &mut Vec<Saved>) {
                out.push(Saved::plain(Value::Int(i64::from(*self))));
            }

            fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
                match value {
                    Value::Int(v) => {
                        *self = <$ty>::try_from(v).map_err(|_| Value::Int(v))?;
                        Ok(())
                    }
                    other => Err(other),
                }
            }
        }
    )*};
}

int_field!(i64, i32, i16, i8, u32, u16);

impl FieldValue for f64 {
    fn kind() -> FieldKind {
        FieldKind::Float
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }

    fn save(&self, out: &mut Vec<Saved>) {
        out.push(Saved::plain(Value::Float(*self)));
    }

    fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
        match value {
            Value::Float(v) => {
                *self = v;
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl FieldValue for f32 {
    fn kind() -> FieldKind {
        FieldKind::Float
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }

    fn save(&self, out: &mut Vec<Saved>) {
        out.push(Saved::plain(Value::Float(f64::from(*self))));
    }

    fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
        match value {
            Value::Float(v) => {
                *self = v as f32;
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl FieldValue for bool {
    fn kind() -> FieldKind {
        FieldKind::Bool
    }

    fn is_zero(&self) -> bool {
        !*self
    }

    fn save(&self, out: &mut Vec<Saved>) {
        out.push(Saved::plain(Value::Bool(*self)));
    }

    fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
        match value {
            Value::Bool(v) => {
                *self = v;
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl FieldValue for String {
    fn kind() -> FieldKind {
        FieldKind::Text
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        out.push(Saved::plain(Value::Text(self.clone())));
    }

    fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
        match value {
            Value::Text(v) => {
                *self = v;
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl FieldValue for Blob {
    fn kind() -> FieldKind {
        FieldKind::Bytes
    }

    fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        out.push(Saved::plain(Value::Bytes(self.0.clone())));
    }

    fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
        match value {
            Value::Bytes(v) => {
                self.0 = v;
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl FieldValue for DateTime<Utc> {
    fn kind() -> FieldKind {
        FieldKind::Time
    }

    fn is_zero(&self) -> bool {
        *self == DateTime::<Utc>::default()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        out.push(Saved::plain(Value::Time(*self)));
    }

    fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
        match value {
            Value::Time(v) => {
                *self = v;
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl FieldValue for Key {
    fn kind() -> FieldKind {
        FieldKind::Key
    }

    fn is_zero(&self) -> bool {
        *self == Key::default()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        out.push(Saved::plain(Value::Key(self.clone())));
    }

    fn load(&mut self, _suffix: Option<&str>, value: Value) -> Result<(), Value> {
        match value {
            Value::Key(v) => {
                *self = v;
                Ok(())
            }
            other => Err(other),
        }
    }
}

impl<T: FieldValue> FieldValue for Vec<T> {
    fn kind() -> FieldKind {
        FieldKind::Repeated(Box::new(T::kind()))
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        for item in self {
            item.save(out);
        }
    }

    fn load(&mut self, suffix: Option<&str>, value: Value) -> Result<(), Value> {
        let mut item = T::default();
        item.load(suffix, value)?;
        self.push(item);
        Ok(())
    }
}

/// Key type of a map field.
pub trait MapKey: Ord + Send + Sync + 'static {
    /// Only text-keyed maps pass registration.
    fn is_text() -> bool;
    fn to_suffix(&self) -> String;
    fn from_suffix(raw: &str) -> Option<Self>
    where
        Self: Sized;
}

impl MapKey for String {
    fn is_text() -> bool {
        true
    }

    fn to_suffix(&self) -> String {
        self.clone()
    }

    fn from_suffix(raw: &str) -> Option<Self> {
        Some(raw.to_string())
    }
}

impl MapKey for i64 {
    fn is_text() -> bool {
        false
    }

    fn to_suffix(&self) -> String {
        self.to_string()
    }

    fn from_suffix(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

impl<K: MapKey, V: FieldValue> FieldValue for BTreeMap<K, V> {
    fn kind() -> FieldKind {
        FieldKind::Map {
            text_keys: K::is_text(),
            value: Box::new(V::kind()),
        }
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        for (key, value) in self {
            let start = out.len();
            value.save(out);
            for saved in &mut out[start..] {
                saved.suffix = Some(key.to_suffix());
            }
        }
    }

    fn load(&mut self, suffix: Option<&str>, value: Value) -> Result<(), Value> {
        let Some(key) = suffix.and_then(K::from_suffix) else {
            return Err(value);
        };
        self.entry(key).or_default().load(None, value)
    }
}

impl<T: FieldValue> FieldValue for Option<T> {
    fn kind() -> FieldKind {
        FieldKind::Pointer(Box::new(T::kind()))
    }

    fn is_zero(&self) -> bool {
        self.is_none()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        if let Some(inner) = self {
            inner.save(out);
        }
    }

    fn load(&mut self, suffix: Option<&str>, value: Value) -> Result<(), Value> {
        self.get_or_insert_with(T::default).load(suffix, value)
    }
}

impl<T: FieldValue> FieldValue for Box<T> {
    fn kind() -> FieldKind {
        FieldKind::Pointer(Box::new(T::kind()))
    }

    fn is_zero(&self) -> bool {
        self.as_ref().is_zero()
    }

    fn save(&self, out: &mut Vec<Saved>) {
        self.as_ref().save(out);
    }

    fn load(&mut self, suffix: Option<&str>, value: Value) -> Result<(), Value> {
        self.as_mut().load(suffix, value)
    }
}
