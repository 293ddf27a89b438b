//! Canonical binary encoding.
//!
//! Layout rules, all integers big-endian:
//!
//! ```text
//! bool      1 byte, 0x00 or 0x01
//! int       8 bytes, two's complement
//! float     8 bytes, IEEE-754 binary64
//! string    u64 length | utf-8 bytes
//! binary    u64 length | bytes
//! optional  presence byte 0x00/0x01 | value when present
//! list      u64 count | elements
//! record    fields in declared order, no framing
//! union     discriminant string | variant fields
//! ref       record { hash_algorithm: string, hash: binary }
//! ```
//!
//! The encoding is deterministic: equal values always produce equal bytes.
//! Capsule identity depends on that.

use crate::capsule::{HashAlgorithm, Ref};
use crate::codec::{
    Codec, DecodeError, DecodeErrorKind, EncodeError, PathSegment, Schema, Value, CDR,
    MAX_DECODE_LEN,
};

/// Cap on list items whose encoding takes no bytes at all.
const MAX_ZERO_WIDTH_ITEMS: u64 = 1 << 16;

/// Fewest bytes any value of `schema` can encode to.
fn min_width(schema: &Schema) -> u64 {
    match schema {
        Schema::Bool | Schema::Optional(_) => 1,
        Schema::Int | Schema::Float | Schema::String | Schema::Binary | Schema::List(_) => 8,
        Schema::Union(_) => 8,
        Schema::Ref => 16,
        Schema::Record(fields) => fields
            .iter()
            .fold(0u64, |acc, f| acc.saturating_add(min_width(&f.schema))),
    }
}

/// Encode `value` as `schema` using the canonical layout.
pub fn encode(schema: &Schema, value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut enc = Encoder::new();
    enc.value(schema, value)?;
    Ok(enc.finish())
}

/// Decode a complete buffer. Trailing bytes are an error.
pub fn decode(schema: &Schema, data: &[u8]) -> Result<Value, DecodeError> {
    decode_bounded(schema, data, MAX_DECODE_LEN)
}

pub fn decode_bounded(schema: &Schema, data: &[u8], max_len: u64) -> Result<Value, DecodeError> {
    let mut dec = Decoder::new(data, max_len);
    let value = dec.value(schema)?;
    dec.finish()?;
    Ok(value)
}

// ── Codec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct CdrCodec {
    max_len: u64,
}

impl CdrCodec {
    pub const fn new() -> Self {
        Self {
            max_len: MAX_DECODE_LEN,
        }
    }

    pub const fn with_max_len(max_len: u64) -> Self {
        Self { max_len }
    }
}

impl Default for CdrCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for CdrCodec {
    fn name(&self) -> &'static str {
        CDR
    }

    fn encode(&self, schema: &Schema, value: &Value) -> Result<Vec<u8>, EncodeError> {
        encode(schema, value)
    }

    fn decode(&self, schema: &Schema, data: &[u8]) -> Result<Value, DecodeError> {
        decode_bounded(schema, data, self.max_len)
    }
}

// ── Encoder ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.u64(v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    pub fn str(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    pub fn reference(&mut self, r: &Ref) {
        self.str(r.algorithm.name());
        self.bytes(&r.hash);
    }

    pub fn value(&mut self, schema: &Schema, value: &Value) -> Result<(), EncodeError> {
        match (schema, value) {
            (Schema::Bool, Value::Bool(b)) => self.u8(u8::from(*b)),
            (Schema::Int, Value::Int(i)) => self.i64(*i),
            (Schema::Float, Value::Float(f)) => self.buf.extend_from_slice(&f.to_be_bytes()),
            (Schema::String, Value::String(s)) => self.str(s),
            (Schema::Binary, Value::Binary(b)) => self.bytes(b),
            (Schema::Ref, Value::Ref(r)) => self.reference(r),
            (Schema::Optional(_), Value::Optional(None)) => self.u8(0),
            (Schema::Optional(inner), Value::Optional(Some(v))) => {
                self.u8(1);
                self.value(inner, v)?;
            }
            (Schema::List(inner), Value::List(items)) => {
                self.u64(items.len() as u64);
                for (i, item) in items.iter().enumerate() {
                    self.value(inner, item)
                        .map_err(|e| e.within(PathSegment::Index(i)))?;
                }
            }
            (Schema::Record(fields), Value::Record(values)) => {
                if fields.len() != values.len() {
                    return Err(EncodeError::mismatch("record arity", "other arity"));
                }
                for (field, v) in fields.iter().zip(values) {
                    self.value(&field.schema, v)
                        .map_err(|e| e.within(PathSegment::Field(field.name.clone())))?;
                }
            }
            (Schema::Union(variants), Value::Variant { name, fields }) => {
                let variant = variants
                    .iter()
                    .find(|v| &v.name == name)
                    .ok_or_else(|| EncodeError::mismatch("declared variant", "unknown variant"))?;
                if variant.fields.len() != fields.len() {
                    return Err(EncodeError::mismatch("variant arity", "other arity")
                        .within(PathSegment::Field(name.clone())));
                }
                self.str(name);
                for (field, v) in variant.fields.iter().zip(fields) {
                    self.value(&field.schema, v).map_err(|e| {
                        e.within(PathSegment::Field(field.name.clone()))
                            .within(PathSegment::Field(name.clone()))
                    })?;
                }
            }
            (schema, value) => return Err(EncodeError::mismatch(schema.kind(), value.kind())),
        }
        Ok(())
    }
}

// ── Decoder ───────────────────────────────────────────────────────────────────

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    max_len: u64,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], max_len: u64) -> Self {
        Self {
            data,
            pos: 0,
            max_len,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Error if any input is left unconsumed.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::new(DecodeErrorKind::TrailingBytes(n))),
        }
    }

    fn take(&mut self, n: u64) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if n > remaining as u64 {
            return Err(DecodeError::new(DecodeErrorKind::UnexpectedEof {
                needed: n,
                remaining,
            }));
        }
        let start = self.pos;
        self.pos += n as usize;
        Ok(&self.data[start..self.pos])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N as u64)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    /// Read a length or count prefix and check it against the bound.
    fn len(&mut self) -> Result<u64, DecodeError> {
        let len = self.u64()?;
        if len > self.max_len {
            return Err(DecodeError::new(DecodeErrorKind::LengthTooLarge {
                len,
                max: self.max_len,
            }));
        }
        Ok(len)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.len()?;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String, DecodeError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| DecodeError::new(DecodeErrorKind::InvalidUtf8))
    }

    pub fn reference(&mut self) -> Result<Ref, DecodeError> {
        let algorithm = self
            .string()
            .map_err(|e| e.within(PathSegment::Field("hash_algorithm".into())))?;
        let algorithm = HashAlgorithm::from_name(&algorithm).ok_or_else(|| {
            DecodeError::new(DecodeErrorKind::InvalidRef(format!(
                "unsupported hash algorithm {algorithm:?}"
            )))
            .within(PathSegment::Field("hash_algorithm".into()))
        })?;
        let hash = self
            .bytes()
            .map_err(|e| e.within(PathSegment::Field("hash".into())))?;
        let hash: [u8; 32] = hash.try_into().map_err(|_| {
            DecodeError::new(DecodeErrorKind::InvalidRef(format!(
                "hash is {} bytes, expected 32",
                hash.len()
            )))
            .within(PathSegment::Field("hash".into()))
        })?;
        Ok(Ref { algorithm, hash })
    }

    pub fn value(&mut self, schema: &Schema) -> Result<Value, DecodeError> {
        Ok(match schema {
            Schema::Bool => match self.u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                b => return Err(DecodeError::new(DecodeErrorKind::InvalidBool(b))),
            },
            Schema::Int => Value::Int(self.i64()?),
            Schema::Float => Value::Float(f64::from_be_bytes(self.array()?)),
            Schema::String => Value::String(self.string()?),
            Schema::Binary => Value::Binary(self.bytes()?.to_vec()),
            Schema::Ref => Value::Ref(self.reference()?),
            Schema::Optional(inner) => match self.u8()? {
                0 => Value::Optional(None),
                1 => Value::some(self.value(inner)?),
                b => return Err(DecodeError::new(DecodeErrorKind::InvalidPresence(b))),
            },
            Schema::List(inner) => {
                let count = self.len()?;
                let width = min_width(inner);
                if width == 0 && count > MAX_ZERO_WIDTH_ITEMS {
                    return Err(DecodeError::new(DecodeErrorKind::LengthTooLarge {
                        len: count,
                        max: MAX_ZERO_WIDTH_ITEMS,
                    }));
                }
                let needed = count.saturating_mul(width);
                if needed > self.remaining() as u64 {
                    return Err(DecodeError::new(DecodeErrorKind::UnexpectedEof {
                        needed,
                        remaining: self.remaining(),
                    }));
                }
                // Never trust the count for preallocation.
                let mut items = Vec::with_capacity((count as usize).min(self.remaining()));
                for i in 0..count as usize {
                    items.push(
                        self.value(inner)
                            .map_err(|e| e.within(PathSegment::Index(i)))?,
                    );
                }
                Value::List(items)
            }
            Schema::Record(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(
                        self.value(&field.schema)
                            .map_err(|e| e.within(PathSegment::Field(field.name.clone())))?,
                    );
                }
                Value::Record(values)
            }
            Schema::Union(variants) => {
                let name = self.string()?;
                let variant = variants
                    .iter()
                    .find(|v| v.name == name)
                    .ok_or_else(|| DecodeError::new(DecodeErrorKind::UnknownVariant(name.clone())))?;
                let mut values = Vec::with_capacity(variant.fields.len());
                for field in &variant.fields {
                    values.push(self.value(&field.schema).map_err(|e| {
                        e.within(PathSegment::Field(field.name.clone()))
                            .within(PathSegment::Field(name.clone()))
                    })?);
                }
                Value::Variant {
                    name,
                    fields: values,
                }
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
