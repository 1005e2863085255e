//! Record self-description.
//!
//! A record type implements [`Structure::describe`] once, listing its
//! persisted fields and its identifier capabilities on a [`Schema`]. The
//! codec registry turns that description into a validated [`Codec`](super::Codec).

use once_cell::sync::OnceCell;

use crate::error::{CodecError, TesseraResult};
use crate::key::Key;

use super::field::FieldValue;
use super::{NestedSlot, NestedVecSlot, ScalarSlot, Slot};

/// A struct-like type whose fields the codec can flatten into properties.
///
/// Nested value types only need this trait; top-level records also
/// implement [`Record`].
pub trait Structure: Default + Send + Sync + 'static {
    fn describe(schema: &mut Schema<Self>);
}

/// A top-level record stored under its own key.
///
/// Hooks default to no-ops. A failing `before_save`/`after_save` aborts the
/// save before any backend call; a failing load hook fails the decode.
pub trait Record: Structure + Clone {
    /// Kind of every key derived from this record type.
    const KIND: &'static str;

    fn before_save(&mut self) -> TesseraResult<()> {
        Ok(())
    }

    fn after_save(&mut self) -> TesseraResult<()> {
        Ok(())
    }

    fn before_load(&mut self) -> TesseraResult<()> {
        Ok(())
    }

    fn after_load(&mut self) -> TesseraResult<()> {
        Ok(())
    }
}

/// Per-field modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldOptions {
    pub indexed: bool,
    pub omit_empty: bool,
    /// Indexed, except when the value is empty (the property is still written).
    pub index_omit_empty: bool,
    /// Nested fields only: children are not prefixed with this field's name.
    pub inline: bool,
}

/// Chained modifiers for the field just declared.
pub struct FieldBuilder<'a> {
    options: &'a mut FieldOptions,
}

impl FieldBuilder<'_> {
    pub fn indexed(self) -> Self {
        self.options.indexed = true;
        self
    }

    pub fn omit_empty(self) -> Self {
        self.options.omit_empty = true;
        self
    }

    pub fn index_omit_empty(self) -> Self {
        self.options.index_omit_empty = true;
        self
    }

    pub fn inline(self) -> Self {
        self.options.inline = true;
        self
    }
}

pub(crate) struct FieldDecl<S> {
    pub(crate) name: String,
    pub(crate) options: FieldOptions,
    pub(crate) slot: Box<dyn Slot<S>>,
}

// ============================================================================
// CAPABILITIES
// ============================================================================

/// How a record exposes its own identifier.
pub enum Identity<S> {
    Missing,
    Numeric {
        get: fn(&S) -> &i64,
        get_mut: fn(&mut S) -> &mut i64,
    },
    Text {
        get: fn(&S) -> &String,
        get_mut: fn(&mut S) -> &mut String,
    },
}

/// How a record exposes its parent key, if at all.
pub enum Parent<S> {
    Missing,
    Numeric {
        kind: &'static str,
        get: fn(&S) -> &i64,
        get_mut: fn(&mut S) -> &mut i64,
    },
    Text {
        kind: &'static str,
        get: fn(&S) -> &String,
        get_mut: fn(&mut S) -> &mut String,
    },
    Key {
        get: fn(&S) -> &Option<Key>,
        get_mut: fn(&mut S) -> &mut Option<Key>,
    },
}

/// Identifier capabilities resolved once per type and kept on its codec.
pub struct Capabilities<S> {
    pub identity: Identity<S>,
    pub parent: Parent<S>,
}

impl<S> Capabilities<S> {
    pub fn has_identity(&self) -> bool {
        !matches!(self.identity, Identity::Missing)
    }

    pub fn has_parent(&self) -> bool {
        !matches!(self.parent, Parent::Missing)
    }
}

// ============================================================================
// SCHEMA BUILDER
// ============================================================================

/// Collects the field declarations and capabilities of `S`.
pub struct Schema<S> {
    pub(crate) fields: Vec<FieldDecl<S>>,
    pub(crate) capabilities: Capabilities<S>,
    pub(crate) errors: Vec<CodecError>,
}

impl<S: Structure> Schema<S> {
    pub(crate) fn new() -> Self {
        Self {
            fields: Vec::new(),
            capabilities: Capabilities {
                identity: Identity::Missing,
                parent: Parent::Missing,
            },
            errors: Vec::new(),
        }
    }

    fn push(&mut self, name: &str, slot: Box<dyn Slot<S>>) -> FieldBuilder<'_> {
        self.fields.push(FieldDecl {
            name: name.to_string(),
            options: FieldOptions::default(),
            slot,
        });
        let index = self.fields.len() - 1;
        FieldBuilder {
            options: &mut self.fields[index].options,
        }
    }

    /// Declare a scalar, repeated or map field.
    pub fn field<T: FieldValue>(
        &mut self,
        name: &str,
        get: fn(&S) -> &T,
        get_mut: fn(&mut S) -> &mut T,
    ) -> FieldBuilder<'_> {
        self.push(name, Box::new(ScalarSlot { get, get_mut }))
    }

    /// Declare a nested value type; its properties are written as `name.child`.
    pub fn nested<T: Structure>(
        &mut self,
        name: &str,
        get: fn(&S) -> &T,
        get_mut: fn(&mut S) -> &mut T,
    ) -> FieldBuilder<'_> {
        self.push(
            name,
            Box::new(NestedSlot {
                get,
                get_mut,
                codec: OnceCell::new(),
            }),
        )
    }

    /// Declare a sequence of nested value types; every child property is multi-valued.
    pub fn nested_vec<T: Structure>(
        &mut self,
        name: &str,
        get: fn(&S) -> &Vec<T>,
        get_mut: fn(&mut S) -> &mut Vec<T>,
    ) -> FieldBuilder<'_> {
        self.push(
            name,
            Box::new(NestedVecSlot {
                get,
                get_mut,
                codec: OnceCell::new(),
            }),
        )
    }

    fn set_identity(&mut self, identity: Identity<S>) {
        if self.capabilities.has_identity() {
            self.errors.push(CodecError::ConflictingCapability {
                record: std::any::type_name::<S>().to_string(),
                capability: "identifier",
            });
            return;
        }
        self.capabilities.identity = identity;
    }

    fn set_parent(&mut self, parent: Parent<S>) {
        if self.capabilities.has_parent() {
            self.errors.push(CodecError::ConflictingCapability {
                record: std::any::type_name::<S>().to_string(),
                capability: "parent",
            });
            return;
        }
        self.capabilities.parent = parent;
    }

    /// The record's numeric identifier; zero means "let the backend assign one".
    pub fn numeric_id(&mut self, get: fn(&S) -> &i64, get_mut: fn(&mut S) -> &mut i64) {
        self.set_identity(Identity::Numeric { get, get_mut });
    }

    pub fn text_id(&mut self, get: fn(&S) -> &String, get_mut: fn(&mut S) -> &mut String) {
        self.set_identity(Identity::Text { get, get_mut });
    }

    /// Parent key of `kind` built from a numeric id; zero means no parent.
    pub fn numeric_parent(
        &mut self,
        kind: &'static str,
        get: fn(&S) -> &i64,
        get_mut: fn(&mut S) -> &mut i64,
    ) {
        self.set_parent(Parent::Numeric { kind, get, get_mut });
    }

    /// Parent key of `kind` built from a text id; empty means no parent.
    pub fn text_parent(
        &mut self,
        kind: &'static str,
        get: fn(&S) -> &String,
        get_mut: fn(&mut S) -> &mut String,
    ) {
        self.set_parent(Parent::Text { kind, get, get_mut });
    }

    /// Parent key stored verbatim, for arbitrarily deep ancestor paths.
    pub fn parent_key(
        &mut self,
        get: fn(&S) -> &Option<Key>,
        get_mut: fn(&mut S) -> &mut Option<Key>,
    ) {
        self.set_parent(Parent::Key { get, get_mut });
    }
}
