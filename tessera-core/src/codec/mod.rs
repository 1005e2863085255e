//! Entity codec: typed records to and from ordered property lists.
//!
//! Each record type gets one [`Codec`], built from its [`Schema`] on first
//! use, validated once and cached process-wide by [`codec`]. Encoding walks
//! fields in declaration order; nested value types recurse with a dotted
//! `parent.child` prefix unless declared inline. Decoding routes each
//! incoming property back by name and ignores names it does not know.

mod field;
mod registry;
mod schema;

pub use field::{Blob, FieldKind, FieldValue, MapKey, Saved};
pub use registry::codec;
pub use schema::{
    Capabilities, FieldBuilder, FieldOptions, Identity, Parent, Record, Schema, Structure,
};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

use crate::error::{CodecError, KeyError, TesseraResult};
use crate::key::Key;
use crate::value::{Property, Value};

use schema::FieldDecl;

static PROPERTY_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

fn valid_property_name(name: &str) -> bool {
    match PROPERTY_NAME.as_ref() {
        Some(re) => re.is_match(name),
        None => false,
    }
}

fn join(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}.{}", prefix, name),
        None => name.to_string(),
    }
}

// ============================================================================
// FIELD SLOTS
// ============================================================================

/// Flattened view of one property a codec can produce.
#[derive(Debug, Clone)]
pub(crate) struct FlatProp {
    name: String,
    field: usize,
    /// Name inside the nested codec, for properties contributed by nested types.
    inner: Option<String>,
    repeated: bool,
    map: bool,
}

pub(crate) enum Shape {
    Scalar(FieldKind),
    Nested { props: Vec<FlatProp>, repeated: bool },
}

pub(crate) struct SaveCtx<'a> {
    prefix: Option<&'a str>,
    name: &'a str,
    options: FieldOptions,
    force_multi: bool,
}

#[derive(Default)]
pub(crate) struct LoadCtx {
    occurrences: HashMap<String, usize>,
}

impl LoadCtx {
    fn next_index(&mut self, full: &str) -> usize {
        let count = self.occurrences.entry(full.to_string()).or_insert(0);
        let index = *count;
        *count += 1;
        index
    }
}

/// Type-erased access to one declared field of `S`.
pub(crate) trait Slot<S>: Send + Sync {
    fn shape(&self) -> Result<Shape, CodecError>;

    fn save(&self, record: &S, ctx: &SaveCtx<'_>, out: &mut Vec<Property>) -> Result<(), CodecError>;

    fn load(
        &self,
        record: &mut S,
        inner: Option<&str>,
        full: &str,
        value: Value,
        ctx: &mut LoadCtx,
    ) -> Result<(), CodecError>;
}

pub(crate) struct ScalarSlot<S, T> {
    pub(crate) get: fn(&S) -> &T,
    pub(crate) get_mut: fn(&mut S) -> &mut T,
}

impl<S: Structure, T: FieldValue> Slot<S> for ScalarSlot<S, T> {
    fn shape(&self) -> Result<Shape, CodecError> {
        Ok(Shape::Scalar(T::kind()))
    }

    fn save(&self, record: &S, ctx: &SaveCtx<'_>, out: &mut Vec<Property>) -> Result<(), CodecError> {
        let value = (self.get)(record);
        let empty = value.is_zero();
        // Elements of a repeated nested type are matched up by occurrence
        // index on load, so every child must be written for every element.
        if ctx.options.omit_empty && empty && !ctx.force_multi {
            return Ok(());
        }
        let indexed = if ctx.options.index_omit_empty {
            !empty
        } else {
            ctx.options.indexed
        };
        let multi = ctx.force_multi || matches!(T::kind(), FieldKind::Repeated(_));

        let mut saved = Vec::new();
        value.save(&mut saved);
        for Saved { suffix, value } in saved {
            let name = match suffix {
                Some(suffix) => format!("{}.{}", ctx.name, suffix),
                None => ctx.name.to_string(),
            };
            out.push(Property {
                name,
                indexed: indexed && !value.is_bytes(),
                value,
                multi,
            });
        }
        Ok(())
    }

    fn load(
        &self,
        record: &mut S,
        inner: Option<&str>,
        full: &str,
        value: Value,
        _ctx: &mut LoadCtx,
    ) -> Result<(), CodecError> {
        (self.get_mut)(record)
            .load(inner, value)
            .map_err(|rejected| CodecError::FieldMismatch {
                name: full.to_string(),
                expected: T::kind().to_string(),
                found: rejected.type_name().to_string(),
            })
    }
}

fn nested_shape<T: Structure>(
    cell: &OnceCell<Arc<Codec<T>>>,
    repeated: bool,
) -> Result<Shape, CodecError> {
    let nested = cell.get_or_try_init(codec::<T>)?;
    Ok(Shape::Nested {
        props: nested.props.clone(),
        repeated,
    })
}

fn nested_codec<T: Structure>(cell: &OnceCell<Arc<Codec<T>>>) -> Result<&Arc<Codec<T>>, CodecError> {
    cell.get_or_try_init(codec::<T>)
}

fn child_prefix<'a>(ctx: &SaveCtx<'a>) -> Option<&'a str> {
    if ctx.options.inline {
        ctx.prefix
    } else {
        Some(ctx.name)
    }
}

pub(crate) struct NestedSlot<S, T: Structure> {
    pub(crate) get: fn(&S) -> &T,
    pub(crate) get_mut: fn(&mut S) -> &mut T,
    pub(crate) codec: OnceCell<Arc<Codec<T>>>,
}

impl<S: Structure, T: Structure> Slot<S> for NestedSlot<S, T> {
    fn shape(&self) -> Result<Shape, CodecError> {
        nested_shape(&self.codec, false)
    }

    fn save(&self, record: &S, ctx: &SaveCtx<'_>, out: &mut Vec<Property>) -> Result<(), CodecError> {
        let nested = nested_codec(&self.codec)?;
        nested.save_into((self.get)(record), child_prefix(ctx), ctx.force_multi, out)
    }

    fn load(
        &self,
        record: &mut S,
        inner: Option<&str>,
        full: &str,
        value: Value,
        ctx: &mut LoadCtx,
    ) -> Result<(), CodecError> {
        let nested = nested_codec(&self.codec)?;
        match inner {
            Some(inner) => nested.load_named((self.get_mut)(record), inner, full, value, ctx),
            None => Ok(()),
        }
    }
}

pub(crate) struct NestedVecSlot<S, T: Structure> {
    pub(crate) get: fn(&S) -> &Vec<T>,
    pub(crate) get_mut: fn(&mut S) -> &mut Vec<T>,
    pub(crate) codec: OnceCell<Arc<Codec<T>>>,
}

impl<S: Structure, T: Structure> Slot<S> for NestedVecSlot<S, T> {
    fn shape(&self) -> Result<Shape, CodecError> {
        nested_shape(&self.codec, true)
    }

    fn save(&self, record: &S, ctx: &SaveCtx<'_>, out: &mut Vec<Property>) -> Result<(), CodecError> {
        let nested = nested_codec(&self.codec)?;
        let prefix = child_prefix(ctx);
        for element in (self.get)(record) {
            nested.save_into(element, prefix, true, out)?;
        }
        Ok(())
    }

    fn load(
        &self,
        record: &mut S,
        inner: Option<&str>,
        full: &str,
        value: Value,
        ctx: &mut LoadCtx,
    ) -> Result<(), CodecError> {
        let nested = nested_codec(&self.codec)?;
        let Some(inner) = inner else {
            return Ok(());
        };
        // The i-th occurrence of a child property belongs to element i.
        let index = ctx.next_index(full);
        let elements = (self.get_mut)(record);
        if elements.len() <= index {
            elements.resize_with(index + 1, T::default);
        }
        nested.load_named(&mut elements[index], inner, full, value, ctx)
    }
}

// ============================================================================
// CODEC
// ============================================================================

struct MapRoute {
    prefix: String,
    field: usize,
    /// Prefix of the same map inside the nested codec, if the map is nested.
    inner_prefix: Option<String>,
}

/// Validated, immutable codec for one record type.
pub struct Codec<S> {
    type_name: String,
    fields: Vec<FieldDecl<S>>,
    props: Vec<FlatProp>,
    by_name: HashMap<String, usize>,
    map_routes: Vec<MapRoute>,
    capabilities: Capabilities<S>,
}

impl<S: Structure> Codec<S> {
    /// Describe and validate `S`. Nested codecs are resolved through the
    /// registry, which is what catches recursive structures.
    pub(crate) fn build() -> Result<Self, CodecError> {
        let mut schema = Schema::<S>::new();
        S::describe(&mut schema);
        if let Some(err) = schema.errors.into_iter().next() {
            return Err(err);
        }

        let type_name = std::any::type_name::<S>().to_string();
        let mut props = Vec::new();
        let mut seen = HashSet::new();
        let mut claim = |name: &str| -> Result<(), CodecError> {
            if seen.insert(name.to_lowercase()) {
                Ok(())
            } else {
                Err(CodecError::DuplicateProperty {
                    record: type_name.clone(),
                    name: name.to_string(),
                })
            }
        };

        for (index, decl) in schema.fields.iter().enumerate() {
            if !valid_property_name(&decl.name) {
                return Err(CodecError::InvalidFieldName {
                    record: type_name.clone(),
                    name: decl.name.clone(),
                });
            }
            match decl.slot.shape()? {
                Shape::Scalar(kind) => {
                    let (repeated, map) = check_kind(&type_name, &decl.name, &kind)?;
                    claim(&decl.name)?;
                    props.push(FlatProp {
                        name: decl.name.clone(),
                        field: index,
                        inner: None,
                        repeated,
                        map,
                    });
                }
                Shape::Nested {
                    props: children,
                    repeated,
                } => {
                    for child in children {
                        let name = if decl.options.inline {
                            child.name.clone()
                        } else {
                            format!("{}.{}", decl.name, child.name)
                        };
                        if repeated && (child.repeated || child.map) {
                            return Err(CodecError::SliceOfSlice {
                                record: type_name.clone(),
                                name,
                            });
                        }
                        claim(&name)?;
                        props.push(FlatProp {
                            name,
                            field: index,
                            inner: Some(child.name),
                            repeated: repeated || child.repeated,
                            map: child.map,
                        });
                    }
                }
            }
        }

        let mut by_name = HashMap::new();
        let mut map_routes = Vec::new();
        for (i, prop) in props.iter().enumerate() {
            if prop.map {
                map_routes.push(MapRoute {
                    prefix: format!("{}.", prop.name),
                    field: prop.field,
                    inner_prefix: prop.inner.as_ref().map(|inner| format!("{}.", inner)),
                });
            } else {
                by_name.insert(prop.name.clone(), i);
            }
        }

        Ok(Self {
            type_name,
            fields: schema.fields,
            props,
            by_name,
            map_routes,
            capabilities: schema.capabilities,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Flattened property names in declaration order. Map fields appear by
    /// their prefix.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.props.iter().map(|p| p.name.as_str())
    }

    pub fn capabilities(&self) -> &Capabilities<S> {
        &self.capabilities
    }

    pub(crate) fn save_into(
        &self,
        record: &S,
        prefix: Option<&str>,
        force_multi: bool,
        out: &mut Vec<Property>,
    ) -> Result<(), CodecError> {
        for decl in &self.fields {
            let name = join(prefix, &decl.name);
            let ctx = SaveCtx {
                prefix,
                name: &name,
                options: decl.options,
                force_multi,
            };
            decl.slot.save(record, &ctx, out)?;
        }
        Ok(())
    }

    pub(crate) fn load_named(
        &self,
        record: &mut S,
        name: &str,
        full: &str,
        value: Value,
        ctx: &mut LoadCtx,
    ) -> Result<(), CodecError> {
        if let Some(&index) = self.by_name.get(name) {
            let prop = &self.props[index];
            let slot = &self.fields[prop.field].slot;
            return slot.load(record, prop.inner.as_deref(), full, value, ctx);
        }
        for route in &self.map_routes {
            if let Some(suffix) = name.strip_prefix(route.prefix.as_str()) {
                let inner = match &route.inner_prefix {
                    Some(inner_prefix) => format!("{}{}", inner_prefix, suffix),
                    None => suffix.to_string(),
                };
                let slot = &self.fields[route.field].slot;
                return slot.load(record, Some(&inner), full, value, ctx);
            }
        }
        // Unknown properties are ignored.
        Ok(())
    }

    /// Flatten `record` into properties, without lifecycle hooks.
    pub fn encode_fields(&self, record: &S) -> Result<Vec<Property>, CodecError> {
        let mut out = Vec::new();
        self.save_into(record, None, false, &mut out)?;
        Ok(out)
    }

    /// Populate `record` from `properties`, without lifecycle hooks.
    ///
    /// Every property is consumed even after a type mismatch; the first
    /// mismatch is returned once the input is drained.
    pub fn decode_into(&self, record: &mut S, properties: Vec<Property>) -> Result<(), CodecError> {
        let mut ctx = LoadCtx::default();
        let mut first_err = None;
        for prop in properties {
            if let Err(err) = self.load_named(record, &prop.name, &prop.name, prop.value, &mut ctx) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn decode_fields(&self, properties: Vec<Property>) -> Result<S, CodecError> {
        let mut record = S::default();
        self.decode_into(&mut record, properties)?;
        Ok(record)
    }
}

/// Returns `(repeated, map)` for an accepted scalar field kind.
fn check_kind(record: &str, name: &str, kind: &FieldKind) -> Result<(bool, bool), CodecError> {
    if kind.contains_pointer() {
        return Err(CodecError::PointerField {
            record: record.to_string(),
            name: name.to_string(),
        });
    }
    match kind {
        FieldKind::Repeated(inner) => match inner.as_ref() {
            FieldKind::Repeated(_) => Err(CodecError::SliceOfSlice {
                record: record.to_string(),
                name: name.to_string(),
            }),
            inner if inner.is_composite() => Err(CodecError::UnsupportedFieldType {
                name: name.to_string(),
            }),
            _ => Ok((true, false)),
        },
        FieldKind::Map { text_keys, value } => {
            if !text_keys {
                return Err(CodecError::MapKeyNotString {
                    record: record.to_string(),
                    name: name.to_string(),
                });
            }
            if value.is_composite() {
                return Err(CodecError::UnsupportedFieldType {
                    name: name.to_string(),
                });
            }
            Ok((false, true))
        }
        _ => Ok((false, false)),
    }
}

// ============================================================================
// RECORD OPERATIONS
// ============================================================================

impl<R: Record> Codec<R> {
    /// `before_save`, flatten, `after_save`.
    pub fn encode(&self, record: &mut R) -> TesseraResult<Vec<Property>> {
        record.before_save()?;
        let properties = self.encode_fields(record)?;
        record.after_save()?;
        Ok(properties)
    }

    /// `before_load`, populate, `after_load`.
    ///
    /// `after_load` is skipped when any property failed to load.
    pub fn decode(&self, properties: Vec<Property>) -> TesseraResult<R> {
        let mut record = R::default();
        record.before_load()?;
        self.decode_into(&mut record, properties)?;
        record.after_load()?;
        Ok(record)
    }

    /// Derive the key of `record`: parent first, then the record's own id.
    pub fn key_of(&self, record: &R) -> Result<Key, KeyError> {
        let parent = match &self.capabilities.parent {
            Parent::Missing => None,
            Parent::Numeric { kind, get, .. } => {
                let id = *get(record);
                (id != 0).then(|| Key::numeric(*kind, id, None))
            }
            Parent::Text { kind, get, .. } => {
                let id = get(record);
                (!id.is_empty()).then(|| Key::text(*kind, id.clone(), None))
            }
            Parent::Key { get, .. } => get(record).clone(),
        };
        match &self.capabilities.identity {
            Identity::Missing => Err(KeyError::NoIdentifier {
                type_name: self.type_name.clone(),
            }),
            Identity::Numeric { get, .. } => Ok(Key::numeric(R::KIND, *get(record), parent)),
            Identity::Text { get, .. } => Ok(Key::text(R::KIND, get(record).clone(), parent)),
        }
    }

    /// Write the identifier (and parent) carried by `key` back into `record`.
    pub fn set_key(&self, record: &mut R, key: &Key) -> Result<(), KeyError> {
        match &self.capabilities.identity {
            Identity::Missing => {
                return Err(KeyError::NoIdentifier {
                    type_name: self.type_name.clone(),
                })
            }
            Identity::Numeric { get_mut, .. } => {
                let id = key.numeric_id().ok_or_else(|| KeyError::IdentifierMismatch {
                    key: key.clone(),
                    expected: "numeric",
                })?;
                *get_mut(record) = id;
            }
            Identity::Text { get_mut, .. } => {
                let id = key.text_id().ok_or_else(|| KeyError::IdentifierMismatch {
                    key: key.clone(),
                    expected: "text",
                })?;
                *get_mut(record) = id.to_string();
            }
        }
        match &self.capabilities.parent {
            Parent::Missing => {}
            Parent::Numeric { get_mut, .. } => {
                *get_mut(record) = key.parent().and_then(Key::numeric_id).unwrap_or(0);
            }
            Parent::Text { get_mut, .. } => {
                *get_mut(record) = key
                    .parent()
                    .and_then(Key::text_id)
                    .map(str::to_string)
                    .unwrap_or_default();
            }
            Parent::Key { get_mut, .. } => {
                *get_mut(record) = key.parent().cloned();
            }
        }
        Ok(())
    }
}

// ============================================================================
// SHARED-TIER PAYLOAD
// ============================================================================

/// Stable encoding of a property list for the shared cache tier.
pub fn encode_payload(properties: &[Property]) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(properties).map_err(|e| CodecError::Payload {
        reason: e.to_string(),
    })
}

pub fn decode_payload(bytes: &[u8]) -> Result<Vec<Property>, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::Payload {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests;
