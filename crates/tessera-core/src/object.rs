//! Typed objects and the type registry.
//!
//! Every value stored in a mosaic has a full type name. A type's schema
//! must be registered before capsules of that type can be decoded or
//! walked for embedded refs.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::codec::{DecodeError, Schema, Value};

/// A Rust type with a stable type name and schema.
pub trait Object: Sized {
    /// Globally unique name, e.g. `tessera.bundle`.
    const TYPE_NAME: &'static str;

    fn schema() -> Schema;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self, DecodeError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown type: {0}")]
pub struct UnknownType(pub String);

/// Type name → schema. Shared by every component that decodes capsules.
#[derive(Default)]
pub struct TypeRegistry {
    schemas: DashMap<String, Arc<Schema>>,
}

pub type SharedTypes = Arc<TypeRegistry>;

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the types this crate defines.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register::<Text>();
        registry.register::<crate::bundle::Bundle>();
        registry.register::<crate::crypto::Peer>();
        registry.register::<crate::crypto::Parcel>();
        registry
    }

    pub fn register<T: Object>(&self) {
        self.register_schema(T::TYPE_NAME, T::schema());
    }

    /// Re-registering a name replaces its schema.
    pub fn register_schema(&self, type_name: impl Into<String>, schema: Schema) {
        let type_name = type_name.into();
        tracing::debug!(type_name = %type_name, "type registered");
        self.schemas.insert(type_name, Arc::new(schema));
    }

    pub fn schema(&self, type_name: &str) -> Result<Arc<Schema>, UnknownType> {
        self.schemas
            .get(type_name)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.schemas.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

// ── Text ──────────────────────────────────────────────────────────────────────

/// A plain string object. The simplest thing a servant can take or return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl Text {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Object for Text {
    const TYPE_NAME: &'static str = "tessera.text";

    fn schema() -> Schema {
        Schema::record([("text", Schema::String)])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![Value::String(self.0.clone())])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        Ok(Self(f.string("text")?))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = TypeRegistry::with_builtins();
        for name in ["tessera.text", "tessera.bundle", "tessera.peer", "tessera.parcel"] {
            assert!(registry.contains(name), "{name} missing");
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        let registry = TypeRegistry::new();
        assert_eq!(
            registry.schema("nope").unwrap_err(),
            UnknownType("nope".into())
        );
    }

    #[test]
    fn register_schema_replaces() {
        let registry = TypeRegistry::new();
        registry.register_schema("x", Schema::Int);
        registry.register_schema("x", Schema::String);
        assert_eq!(*registry.schema("x").unwrap(), Schema::String);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn text_value_roundtrip() {
        let text = Text::new("hello");
        assert_eq!(Text::from_value(text.to_value()).unwrap(), text);
    }
}
