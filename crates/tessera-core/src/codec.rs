//! Value model and codec registry.
//!
//! A [`Schema`] describes the shape of a value; a [`Value`] is the dynamic
//! tree that codecs turn into bytes and back. Two encodings ship with the
//! crate:
//!
//!   * `cdr`: canonical fixed-width binary. Every capsule hash is computed
//!     over this encoding, so its layout is part of the protocol.
//!   * `json`: human-inspectable, used for ref files handed across
//!     process boundaries through the filesystem.
//!
//! Decoding failures carry a dotted path (field names and list indices)
//! leading to the offending value. That path is the primary debugging
//! surface for corrupt or mismatched data, so every nested decode step
//! wraps its error with the segment it was working on.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::capsule::Ref;

/// Canonical binary encoding name.
pub const CDR: &str = "cdr";

/// Human-inspectable encoding name.
pub const JSON: &str = "json";

/// Upper bound for any single length or count field seen while decoding.
/// Protects against corrupt or malicious length prefixes.
pub const MAX_DECODE_LEN: u64 = 64 * 1024 * 1024;

// ── Schema ────────────────────────────────────────────────────────────────────

/// Shape of an encodable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Bool,
    Int,
    Float,
    String,
    Binary,
    /// A reference to another capsule. The bundler follows these.
    Ref,
    Optional(Box<Schema>),
    List(Box<Schema>),
    /// Fields are encoded in declaration order.
    Record(Vec<Field>),
    /// Tagged union: discriminant string, then the variant's fields.
    Union(Vec<Variant>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub schema: Schema,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn optional(inner: Schema) -> Self {
        Self::Optional(Box::new(inner))
    }

    pub fn list(element: Schema) -> Self {
        Self::List(Box::new(element))
    }

    pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, Schema)>) -> Self {
        Self::Record(fields_from(fields))
    }

    pub fn union<'a>(
        variants: impl IntoIterator<Item = (&'a str, Vec<(&'a str, Schema)>)>,
    ) -> Self {
        Self::Union(
            variants
                .into_iter()
                .map(|(name, fields)| Variant {
                    name: name.to_string(),
                    fields: fields_from(fields),
                })
                .collect(),
        )
    }

    /// Human-readable kind, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::Binary => "binary",
            Self::Ref => "ref",
            Self::Optional(_) => "optional",
            Self::List(_) => "list",
            Self::Record(_) => "record",
            Self::Union(_) => "union",
        }
    }

    /// Does any value of this shape possibly embed a ref?
    /// Lets the ref walk skip whole subtrees of plain data.
    pub fn may_contain_refs(&self) -> bool {
        match self {
            Self::Ref => true,
            Self::Optional(inner) | Self::List(inner) => inner.may_contain_refs(),
            Self::Record(fields) => fields.iter().any(|f| f.schema.may_contain_refs()),
            Self::Union(variants) => variants
                .iter()
                .any(|v| v.fields.iter().any(|f| f.schema.may_contain_refs())),
            _ => false,
        }
    }
}

fn fields_from<'a>(fields: impl IntoIterator<Item = (&'a str, Schema)>) -> Vec<Field> {
    fields
        .into_iter()
        .map(|(name, schema)| Field {
            name: name.to_string(),
            schema,
        })
        .collect()
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// A dynamically typed value. Interpreted against a [`Schema`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Ref(Ref),
    Optional(Option<Box<Value>>),
    List(Vec<Value>),
    Record(Vec<Value>),
    Variant { name: String, fields: Vec<Value> },
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Ref(_) => "ref",
            Self::Optional(_) => "optional",
            Self::List(_) => "list",
            Self::Record(_) => "record",
            Self::Variant { .. } => "union",
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn some(value: Value) -> Self {
        Self::Optional(Some(Box::new(value)))
    }

    pub fn variant(name: impl Into<String>, fields: Vec<Value>) -> Self {
        Self::Variant {
            name: name.into(),
            fields,
        }
    }

    /// Collect every ref embedded in this value, guided by `schema`.
    ///
    /// Only positions whose declared type is `Ref` (or containers thereof)
    /// are followed. Shape mismatches are skipped; the codec has already
    /// validated anything that came off the wire.
    pub fn collect_refs(&self, schema: &Schema, out: &mut Vec<Ref>) {
        if !schema.may_contain_refs() {
            return;
        }
        match (schema, self) {
            (Schema::Ref, Value::Ref(r)) => out.push(*r),
            (Schema::Optional(inner), Value::Optional(Some(v))) => v.collect_refs(inner, out),
            (Schema::List(inner), Value::List(items)) => {
                for item in items {
                    item.collect_refs(inner, out);
                }
            }
            (Schema::Record(fields), Value::Record(values)) => {
                for (field, value) in fields.iter().zip(values) {
                    value.collect_refs(&field.schema, out);
                }
            }
            (Schema::Union(variants), Value::Variant { name, fields }) => {
                if let Some(variant) = variants.iter().find(|v| &v.name == name) {
                    for (field, value) in variant.fields.iter().zip(fields) {
                        value.collect_refs(&field.schema, out);
                    }
                }
            }
            _ => {}
        }
    }

    /// Split a record value into a field cursor for typed extraction.
    pub fn into_fields(self, type_name: &'static str) -> Result<Fields, DecodeError> {
        match self {
            Value::Record(values) => Ok(Fields {
                values: values.into_iter(),
                type_name,
            }),
            other => Err(DecodeError::mismatch("record", other.kind())),
        }
    }

    pub fn into_string(self) -> Result<String, DecodeError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(DecodeError::mismatch("string", other.kind())),
        }
    }

    pub fn into_int(self) -> Result<i64, DecodeError> {
        match self {
            Value::Int(i) => Ok(i),
            other => Err(DecodeError::mismatch("int", other.kind())),
        }
    }

    pub fn into_bool(self) -> Result<bool, DecodeError> {
        match self {
            Value::Bool(b) => Ok(b),
            other => Err(DecodeError::mismatch("bool", other.kind())),
        }
    }

    pub fn into_binary(self) -> Result<Vec<u8>, DecodeError> {
        match self {
            Value::Binary(b) => Ok(b),
            other => Err(DecodeError::mismatch("binary", other.kind())),
        }
    }

    pub fn into_ref(self) -> Result<Ref, DecodeError> {
        match self {
            Value::Ref(r) => Ok(r),
            other => Err(DecodeError::mismatch("ref", other.kind())),
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>, DecodeError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(DecodeError::mismatch("list", other.kind())),
        }
    }

    pub fn into_optional(self) -> Result<Option<Value>, DecodeError> {
        match self {
            Value::Optional(v) => Ok(v.map(|b| *b)),
            other => Err(DecodeError::mismatch("optional", other.kind())),
        }
    }

    pub fn into_variant(self) -> Result<(String, Vec<Value>), DecodeError> {
        match self {
            Value::Variant { name, fields } => Ok((name, fields)),
            other => Err(DecodeError::mismatch("union", other.kind())),
        }
    }
}

/// Cursor over the fields of a record value, in declaration order.
///
/// Each accessor names the field it expects so that a mismatch
/// reports `TypeName.field` in its path.
pub struct Fields {
    values: std::vec::IntoIter<Value>,
    type_name: &'static str,
}

impl Fields {
    pub fn next_value(&mut self, name: &str) -> Result<Value, DecodeError> {
        self.values.next().ok_or_else(|| {
            DecodeError::new(DecodeErrorKind::MissingField(name.to_string()))
                .within(PathSegment::Field(self.type_name.to_string()))
        })
    }

    /// Pull the next field and convert it, attaching the field path on failure.
    pub fn next<T>(
        &mut self,
        name: &str,
        convert: impl FnOnce(Value) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        let value = self.next_value(name)?;
        convert(value).map_err(|e| {
            e.within(PathSegment::Field(name.to_string()))
                .within(PathSegment::Field(self.type_name.to_string()))
        })
    }

    pub fn string(&mut self, name: &str) -> Result<String, DecodeError> {
        self.next(name, Value::into_string)
    }

    pub fn int(&mut self, name: &str) -> Result<i64, DecodeError> {
        self.next(name, Value::into_int)
    }

    pub fn binary(&mut self, name: &str) -> Result<Vec<u8>, DecodeError> {
        self.next(name, Value::into_binary)
    }

    pub fn reference(&mut self, name: &str) -> Result<Ref, DecodeError> {
        self.next(name, Value::into_ref)
    }

    pub fn refs(&mut self, name: &str) -> Result<Vec<Ref>, DecodeError> {
        self.next(name, |v| {
            v.into_list()?
                .into_iter()
                .enumerate()
                .map(|(i, item)| item.into_ref().map_err(|e| e.within(PathSegment::Index(i))))
                .collect()
        })
    }

    pub fn strings(&mut self, name: &str) -> Result<Vec<String>, DecodeError> {
        self.next(name, |v| {
            v.into_list()?
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    item.into_string()
                        .map_err(|e| e.within(PathSegment::Index(i)))
                })
                .collect()
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// One step of a decode path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

/// Dotted trail from the root value to the failure, e.g. `capsule_list.3.encoded_object`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path(pub Vec<PathSegment>);

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                PathSegment::Field(name) => f.write_str(name)?,
                PathSegment::Index(idx) => write!(f, "{idx}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: u64, remaining: usize },

    #[error("length {len} exceeds bound {max}")]
    LengthTooLarge { len: u64, max: u64 },

    #[error("invalid utf-8 string")]
    InvalidUtf8,

    #[error("invalid bool byte: 0x{0:02x}")]
    InvalidBool(u8),

    #[error("invalid presence byte: 0x{0:02x}")]
    InvalidPresence(u8),

    #[error("unknown union variant: {0}")]
    UnknownVariant(String),

    #[error("invalid ref: {0}")]
    InvalidRef(String),

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("expected {expected}, found {found}")]
    SchemaMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing field {0}")]
    MissingField(String),

    #[error("invalid value: {0}")]
    Invalid(String),

    #[error("invalid json: {0}")]
    InvalidJson(String),
}

/// Malformed, truncated, or mismatched input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("decode error at {path}: {kind}")]
pub struct DecodeError {
    pub path: Path,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind) -> Self {
        Self {
            path: Path::default(),
            kind,
        }
    }

    pub fn mismatch(expected: &'static str, found: &'static str) -> Self {
        Self::new(DecodeErrorKind::SchemaMismatch { expected, found })
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::new(DecodeErrorKind::Invalid(reason.into()))
    }

    /// Prepend a path segment. Called while unwinding out of nested values.
    pub fn within(mut self, segment: PathSegment) -> Self {
        self.path.0.insert(0, segment);
        self
    }
}

/// A value that does not match the schema it is being encoded with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("encode error at {path}: expected {expected}, found {found}")]
pub struct EncodeError {
    pub path: Path,
    pub expected: &'static str,
    pub found: &'static str,
}

impl EncodeError {
    pub fn mismatch(expected: &'static str, found: &'static str) -> Self {
        Self {
            path: Path::default(),
            expected,
            found,
        }
    }

    pub fn within(mut self, segment: PathSegment) -> Self {
        self.path.0.insert(0, segment);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown encoding: {0}")]
pub struct UnknownEncoding(pub String);

// ── Codec registry ────────────────────────────────────────────────────────────

/// A named encoding that maps values to bytes and back.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, schema: &Schema, value: &Value) -> Result<Vec<u8>, EncodeError>;

    fn decode(&self, schema: &Schema, data: &[u8]) -> Result<Value, DecodeError>;
}

/// Codecs keyed by encoding name.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<&'static str, Arc<dyn Codec>>,
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// `cdr` and `json`, both bounded by `max_len` per length field.
    pub fn with_defaults(max_len: u64) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(crate::cdr::CdrCodec::with_max_len(max_len)));
        registry.register(Arc::new(crate::json::JsonCodec::new()));
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name(), codec);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>, UnknownEncoding> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownEncoding(name.to_string()))
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.codecs.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults(MAX_DECODE_LEN)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
