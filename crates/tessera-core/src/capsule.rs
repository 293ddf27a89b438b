//! Capsules and refs.
//!
//! A capsule is an encoded value plus the metadata needed to decode it:
//! the full type name and the encoding name. A ref is the hash of a
//! capsule's canonical encoding, so it identifies the capsule's exact
//! content. Equal capsules always have equal refs.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use thiserror::Error;

use crate::cdr::Encoder;
use crate::codec::{DecodeError, Schema, Value};
use crate::crypto;

// ── Ref ───────────────────────────────────────────────────────────────────────

/// Hash function a ref was computed with. Only BLAKE3 is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Blake3,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Blake3 => "blake3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "blake3" => Some(Self::Blake3),
            _ => None,
        }
    }
}

/// Content address of a capsule.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    pub algorithm: HashAlgorithm,
    pub hash: [u8; 32],
}

impl Ref {
    pub const fn from_hash(hash: [u8; 32]) -> Self {
        Self {
            algorithm: HashAlgorithm::Blake3,
            hash,
        }
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.hash[..4])
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), hex::encode(self.hash))
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({}:{})", self.algorithm.name(), self.short())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseRefError {
    #[error("missing ':' separator")]
    MissingSeparator,
    #[error("unsupported hash algorithm {0:?}")]
    UnknownAlgorithm(String),
    #[error("hash must be 64 hex characters")]
    BadHash,
}

impl FromStr for Ref {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, digest) = s.split_once(':').ok_or(ParseRefError::MissingSeparator)?;
        let algorithm = HashAlgorithm::from_name(algorithm)
            .ok_or_else(|| ParseRefError::UnknownAlgorithm(algorithm.to_string()))?;
        let mut hash = [0u8; 32];
        hex::decode_to_slice(digest, &mut hash).map_err(|_| ParseRefError::BadHash)?;
        Ok(Self { algorithm, hash })
    }
}

// ── Capsule ───────────────────────────────────────────────────────────────────

/// An encoded value tagged with its type and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capsule {
    pub full_type_name: String,
    pub encoding: String,
    pub encoded_object: Bytes,
}

impl Capsule {
    pub fn new(
        full_type_name: impl Into<String>,
        encoding: impl Into<String>,
        encoded_object: impl Into<Bytes>,
    ) -> Self {
        Self {
            full_type_name: full_type_name.into(),
            encoding: encoding.into(),
            encoded_object: encoded_object.into(),
        }
    }

    pub fn schema() -> Schema {
        Schema::record([
            ("full_type_name", Schema::String),
            ("encoding", Schema::String),
            ("encoded_object", Schema::Binary),
        ])
    }

    pub fn to_value(&self) -> Value {
        Value::Record(vec![
            Value::String(self.full_type_name.clone()),
            Value::String(self.encoding.clone()),
            Value::Binary(self.encoded_object.to_vec()),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields("capsule")?;
        Ok(Self {
            full_type_name: f.string("full_type_name")?,
            encoding: f.string("encoding")?,
            encoded_object: Bytes::from(f.binary("encoded_object")?),
        })
    }

    /// Canonical bytes of the whole capsule record.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.str(&self.full_type_name);
        enc.str(&self.encoding);
        enc.bytes(&self.encoded_object);
        enc.finish()
    }

    /// Content address: BLAKE3 over the canonical encoding.
    pub fn make_ref(&self) -> Ref {
        Ref::from_hash(crypto::hash(&self.canonical_bytes()))
    }

    /// Decode the canonical bytes of a capsule record.
    pub fn from_canonical_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(crate::cdr::decode(&Self::schema(), data)?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
