//! The mosaic: a process-wide content-addressed capsule store.
//!
//! Append-only for the life of the process. Every stored pair satisfies
//! `ref == capsule.make_ref()`; lookups of an unknown ref fail.
//!
//! An optional [`CapsuleSpill`] backend mirrors every new capsule to slower
//! storage and serves lookups that miss in memory. Spilled capsules are
//! re-verified against their ref before they are trusted again.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::capsule::{Capsule, Ref};
use crate::cdr;
use crate::codec::{CodecRegistry, DecodeError, EncodeError, Schema, UnknownEncoding, Value, CDR};
use crate::object::{Object, TypeRegistry, UnknownType};

/// Secondary storage behind the in-memory map.
pub trait CapsuleSpill: Send + Sync {
    /// Persist a capsule. Failures are logged by the caller and otherwise ignored.
    fn store(&self, r: &Ref, capsule: &Capsule) -> std::io::Result<()>;

    fn load(&self, r: &Ref) -> Option<Capsule>;
}

#[derive(Debug, Error)]
pub enum MosaicError {
    #[error("unknown ref {0}")]
    UnknownRef(Ref),

    #[error("hash mismatch: claimed {claimed}, computed {computed}")]
    HashMismatch { claimed: Ref, computed: Ref },

    #[error("{0}")]
    UnknownType(#[from] UnknownType),

    #[error("{0}")]
    UnknownEncoding(#[from] UnknownEncoding),

    #[error("type mismatch for {r}: expected {expected}, found {found}")]
    TypeMismatch {
        r: Ref,
        expected: &'static str,
        found: String,
    },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub struct Mosaic {
    capsules: DashMap<Ref, Capsule>,
    codecs: CodecRegistry,
    spill: Option<Arc<dyn CapsuleSpill>>,
}

pub type SharedMosaic = Arc<Mosaic>;

impl Default for Mosaic {
    fn default() -> Self {
        Self::new()
    }
}

impl Mosaic {
    pub fn new() -> Self {
        Self::with_codecs(CodecRegistry::default())
    }

    pub fn with_codecs(codecs: CodecRegistry) -> Self {
        Self {
            capsules: DashMap::new(),
            codecs,
            spill: None,
        }
    }

    pub fn with_spill(mut self, spill: Arc<dyn CapsuleSpill>) -> Self {
        self.spill = Some(spill);
        self
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    // ── Insertion ─────────────────────────────────────────────────────────────

    /// Encode an object canonically and store it. Idempotent.
    pub fn put<T: Object>(&self, object: &T) -> Result<Ref, MosaicError> {
        self.put_value(T::TYPE_NAME, &T::schema(), &object.to_value())
    }

    pub fn put_value(
        &self,
        type_name: &str,
        schema: &Schema,
        value: &Value,
    ) -> Result<Ref, MosaicError> {
        let encoded = cdr::encode(schema, value)?;
        Ok(self.put_capsule(Capsule::new(type_name, CDR, encoded)))
    }

    /// Store a capsule under its computed ref.
    pub fn put_capsule(&self, capsule: Capsule) -> Ref {
        let r = capsule.make_ref();
        self.insert_new(r, capsule);
        r
    }

    /// Store a capsule received from elsewhere, checking it against the ref
    /// it was claimed under. Returns `true` if it was not already present.
    pub fn register_verified(&self, claimed: &Ref, capsule: Capsule) -> Result<bool, MosaicError> {
        let computed = capsule.make_ref();
        if computed != *claimed {
            tracing::error!(
                claimed = %claimed.short(),
                computed = %computed.short(),
                "capsule hash mismatch"
            );
            return Err(MosaicError::HashMismatch {
                claimed: *claimed,
                computed,
            });
        }
        Ok(self.insert_new(computed, capsule))
    }

    fn insert_new(&self, r: Ref, capsule: Capsule) -> bool {
        use dashmap::mapref::entry::Entry;
        let spilled = match self.capsules.entry(r) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                tracing::trace!(r = %r.short(), type_name = %capsule.full_type_name, "capsule stored");
                let spilled = self.spill.as_ref().map(|_| capsule.clone());
                slot.insert(capsule);
                spilled
            }
        };
        // Spill outside the shard lock; disk writes must not stall lookups.
        if let (Some(spill), Some(capsule)) = (&self.spill, spilled) {
            if let Err(e) = spill.store(&r, &capsule) {
                tracing::warn!(r = %r.short(), error = %e, "capsule spill failed");
            }
        }
        true
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    pub fn resolve(&self, r: &Ref) -> Result<Capsule, MosaicError> {
        if let Some(capsule) = self.capsules.get(r) {
            return Ok(capsule.clone());
        }
        self.load_spilled(r).ok_or(MosaicError::UnknownRef(*r))
    }

    fn load_spilled(&self, r: &Ref) -> Option<Capsule> {
        let capsule = self.spill.as_ref()?.load(r)?;
        if capsule.make_ref() != *r {
            tracing::warn!(r = %r.short(), "spilled capsule failed verification");
            return None;
        }
        self.capsules.entry(*r).or_insert_with(|| capsule.clone());
        Some(capsule)
    }

    /// Resolve and decode, using the schema registered for the capsule's type.
    pub fn resolve_typed(&self, r: &Ref, types: &TypeRegistry) -> Result<Value, MosaicError> {
        let capsule = self.resolve(r)?;
        let schema = types.schema(&capsule.full_type_name)?;
        self.decode_capsule(&capsule, &schema)
    }

    /// Resolve a capsule that must hold a `T`.
    pub fn resolve_object<T: Object>(&self, r: &Ref) -> Result<T, MosaicError> {
        let capsule = self.resolve(r)?;
        if capsule.full_type_name != T::TYPE_NAME {
            return Err(MosaicError::TypeMismatch {
                r: *r,
                expected: T::TYPE_NAME,
                found: capsule.full_type_name,
            });
        }
        let value = self.decode_capsule(&capsule, &T::schema())?;
        Ok(T::from_value(value)?)
    }

    pub fn decode_capsule(&self, capsule: &Capsule, schema: &Schema) -> Result<Value, MosaicError> {
        let codec = self.codecs.get(&capsule.encoding)?;
        Ok(codec.decode(schema, &capsule.encoded_object)?)
    }

    /// Present in memory, or recoverable from the spill backend.
    pub fn contains(&self, r: &Ref) -> bool {
        self.capsules.contains_key(r) || self.load_spilled(r).is_some()
    }

    pub fn len(&self) -> usize {
        self.capsules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capsules.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::object::Text;

    #[derive(Default)]
    struct MemSpill {
        stored: Mutex<Vec<(Ref, Capsule)>>,
    }

    impl CapsuleSpill for MemSpill {
        fn store(&self, r: &Ref, capsule: &Capsule) -> std::io::Result<()> {
            self.stored.lock().unwrap().push((*r, capsule.clone()));
            Ok(())
        }

        fn load(&self, r: &Ref) -> Option<Capsule> {
            self.stored
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _)| k == r)
                .map(|(_, c)| c.clone())
        }
    }

    /// Looks back into its own mosaic while storing.
    #[derive(Default)]
    struct ReentrantSpill {
        mosaic: std::sync::OnceLock<std::sync::Weak<Mosaic>>,
        seen: Mutex<Vec<bool>>,
    }

    impl CapsuleSpill for ReentrantSpill {
        fn store(&self, r: &Ref, _capsule: &Capsule) -> std::io::Result<()> {
            if let Some(mosaic) = self.mosaic.get().and_then(std::sync::Weak::upgrade) {
                let present = mosaic.capsules.contains_key(r);
                self.seen.lock().unwrap().push(present);
            }
            Ok(())
        }

        fn load(&self, _r: &Ref) -> Option<Capsule> {
            None
        }
    }

    #[test]
    fn spill_runs_after_the_capsule_is_visible() {
        let spill = Arc::new(ReentrantSpill::default());
        let mosaic = Arc::new(Mosaic::new().with_spill(spill.clone()));
        spill.mosaic.set(Arc::downgrade(&mosaic)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let writer = mosaic.clone();
        std::thread::spawn(move || {
            let _ = tx.send(writer.put(&Text::new("spilled")).is_ok());
        });
        let stored = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("put blocked on its own shard");
        assert!(stored);
        assert_eq!(*spill.seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn put_is_idempotent() {
        let mosaic = Mosaic::new();
        let a = mosaic.put(&Text::new("hello")).unwrap();
        let b = mosaic.put(&Text::new("hello")).unwrap();
        assert_eq!(a, b);
        assert_eq!(mosaic.len(), 1);
    }

    #[test]
    fn resolve_object_returns_what_was_put() {
        let mosaic = Mosaic::new();
        let r = mosaic.put(&Text::new("hello")).unwrap();
        assert_eq!(mosaic.resolve_object::<Text>(&r).unwrap(), Text::new("hello"));
    }

    #[test]
    fn resolve_typed_uses_registry() {
        let mosaic = Mosaic::new();
        let types = TypeRegistry::with_builtins();
        let r = mosaic.put(&Text::new("x")).unwrap();
        assert_eq!(
            mosaic.resolve_typed(&r, &types).unwrap(),
            Value::Record(vec![Value::string("x")])
        );
        let empty = TypeRegistry::new();
        assert!(matches!(
            mosaic.resolve_typed(&r, &empty),
            Err(MosaicError::UnknownType(_))
        ));
    }

    #[test]
    fn unknown_ref_fails() {
        let mosaic = Mosaic::new();
        let r = Ref::from_hash([0; 32]);
        assert!(matches!(mosaic.resolve(&r), Err(MosaicError::UnknownRef(x)) if x == r));
        assert!(!mosaic.contains(&r));
    }

    #[test]
    fn register_verified_rejects_wrong_ref() {
        let mosaic = Mosaic::new();
        let capsule = Capsule::new("t", CDR, &b"abc"[..]);
        let wrong = Ref::from_hash([1; 32]);
        assert!(matches!(
            mosaic.register_verified(&wrong, capsule.clone()),
            Err(MosaicError::HashMismatch { .. })
        ));
        assert!(mosaic.is_empty());
        let r = capsule.make_ref();
        assert!(mosaic.register_verified(&r, capsule.clone()).unwrap());
        assert!(!mosaic.register_verified(&r, capsule).unwrap());
    }

    #[test]
    fn resolve_object_checks_type_name() {
        let mosaic = Mosaic::new();
        let r = mosaic.put_capsule(Capsule::new("other.type", CDR, &b""[..]));
        assert!(matches!(
            mosaic.resolve_object::<Text>(&r),
            Err(MosaicError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn spill_is_written_through_and_read_back() {
        let spill = Arc::new(MemSpill::default());
        let first = Mosaic::new().with_spill(spill.clone());
        let r = first.put(&Text::new("persisted")).unwrap();
        assert_eq!(spill.stored.lock().unwrap().len(), 1);

        let second = Mosaic::new().with_spill(spill);
        assert!(second.is_empty());
        assert!(second.contains(&r));
        assert_eq!(second.resolve_object::<Text>(&r).unwrap(), Text::new("persisted"));
    }

    #[test]
    fn corrupt_spill_entry_is_ignored() {
        let spill = Arc::new(MemSpill::default());
        let r = Ref::from_hash([5; 32]);
        spill
            .store(&r, &Capsule::new("t", CDR, &b"not it"[..]))
            .unwrap();
        let mosaic = Mosaic::new().with_spill(spill);
        assert!(matches!(mosaic.resolve(&r), Err(MosaicError::UnknownRef(_))));
    }
}
