//! Bundling: minimal transitive-closure transfers between mosaics.
//!
//! The bundler walks the ref graph breadth-first from a set of roots and
//! packs every capsule the receiver is not assumed to hold. The unbundler
//! verifies a received bundle in full before registering anything, then
//! replays its auxiliary roots through registered association handlers.
//!
//! Associations are side-channel bindings attached to a ref from outside
//! the value graph, e.g. "this route reaches that peer". They travel as
//! `aux_roots`: refs to association records, each decoded by its own type.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::capsule::{Capsule, Ref};
use crate::cdr;
use crate::codec::{DecodeError, EncodeError, PathSegment, Schema, Value};
use crate::mosaic::{Mosaic, MosaicError};
use crate::object::{Object, TypeRegistry};

// ── Bundle ────────────────────────────────────────────────────────────────────

/// A self-contained transfer unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bundle {
    pub roots: Vec<Ref>,
    pub aux_roots: Vec<Ref>,
    pub capsule_list: Vec<Capsule>,
}

impl Bundle {
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        cdr::encode(&Self::schema(), &self.to_value())
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        Self::from_value(cdr::decode(&Self::schema(), data)?)
    }
}

impl Object for Bundle {
    const TYPE_NAME: &'static str = "tessera.bundle";

    fn schema() -> Schema {
        Schema::record([
            ("roots", Schema::list(Schema::Ref)),
            ("aux_roots", Schema::list(Schema::Ref)),
            ("capsule_list", Schema::list(Capsule::schema())),
        ])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![
            Value::List(self.roots.iter().copied().map(Value::Ref).collect()),
            Value::List(self.aux_roots.iter().copied().map(Value::Ref).collect()),
            Value::List(self.capsule_list.iter().map(Capsule::to_value).collect()),
        ])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        let roots = f.refs("roots")?;
        let aux_roots = f.refs("aux_roots")?;
        let capsule_list: Vec<Capsule> = f.next("capsule_list", |v| {
            v.into_list()?
                .into_iter()
                .enumerate()
                .map(|(i, c)| Capsule::from_value(c).map_err(|e| e.within(PathSegment::Index(i))))
                .collect()
        })?;
        Ok(Self {
            roots,
            aux_roots,
            capsule_list,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BundleError {
    #[error(transparent)]
    Mosaic(#[from] MosaicError),

    #[error("hash mismatch: claimed {claimed} is absent, bundle carries unclaimed {computed}")]
    HashMismatch { claimed: Ref, computed: Ref },

    #[error("bundle is missing capsule {0}")]
    MissingCapsule(Ref),

    #[error("association {type_name} rejected: {reason}")]
    Association { type_name: String, reason: String },
}

// ── Associations ──────────────────────────────────────────────────────────────

/// Base ref → association refs that must travel with it.
#[derive(Default)]
pub struct AssociationRegistry {
    associations: DashMap<Ref, Vec<Ref>>,
}

impl AssociationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the pair was already recorded.
    pub fn associate(&self, base: Ref, association: Ref) -> bool {
        let mut entry = self.associations.entry(base).or_default();
        if entry.contains(&association) {
            return false;
        }
        entry.push(association);
        true
    }

    pub fn associations_for(&self, base: &Ref) -> Vec<Ref> {
        self.associations
            .get(base)
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

/// Applies one kind of association record when it arrives in a bundle.
pub trait AssociationHandler: Send + Sync {
    /// Must be idempotent; bundles may be replayed.
    fn apply(&self, association: &Ref, value: Value) -> Result<(), String>;
}

// ── Ref walking ───────────────────────────────────────────────────────────────

/// Refs embedded in a capsule, discovered through its registered schema.
/// Capsules of unregistered types are treated as leaves.
fn embedded_refs(
    mosaic: &Mosaic,
    types: &TypeRegistry,
    capsule: &Capsule,
) -> Result<Vec<Ref>, MosaicError> {
    let Ok(schema) = types.schema(&capsule.full_type_name) else {
        tracing::debug!(type_name = %capsule.full_type_name, "unregistered type treated as leaf");
        return Ok(Vec::new());
    };
    if !schema.may_contain_refs() {
        return Ok(Vec::new());
    }
    let value = mosaic.decode_capsule(capsule, &schema)?;
    let mut refs = Vec::new();
    value.collect_refs(&schema, &mut refs);
    Ok(refs)
}

// ── Bundler ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Bundler {
    mosaic: Arc<Mosaic>,
    types: Arc<TypeRegistry>,
    associations: Arc<AssociationRegistry>,
}

impl Bundler {
    pub fn new(
        mosaic: Arc<Mosaic>,
        types: Arc<TypeRegistry>,
        associations: Arc<AssociationRegistry>,
    ) -> Self {
        Self {
            mosaic,
            types,
            associations,
        }
    }

    /// Pack `roots` and everything they reach, minus what `known` covers.
    ///
    /// Each distinct capsule appears once. Refs in `known` end the walk at
    /// that point, associations included. Associations of every visited
    /// ref are attached as aux roots and walked like any other ref.
    pub fn bundle(&self, roots: &[Ref], known: &HashSet<Ref>) -> Result<Bundle, BundleError> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<Ref> = roots.iter().copied().collect();
        let mut aux_seen = HashSet::new();
        let mut aux_roots = Vec::new();
        let mut capsule_list = Vec::new();

        while let Some(r) = queue.pop_front() {
            if known.contains(&r) || !visited.insert(r) {
                continue;
            }
            for association in self.associations.associations_for(&r) {
                if aux_seen.insert(association) {
                    aux_roots.push(association);
                    queue.push_back(association);
                }
            }
            let capsule = self.mosaic.resolve(&r)?;
            queue.extend(embedded_refs(&self.mosaic, &self.types, &capsule)?);
            capsule_list.push(capsule);
        }

        let mut seen_roots = HashSet::new();
        let roots: Vec<Ref> = roots.iter().copied().filter(|r| seen_roots.insert(*r)).collect();
        tracing::debug!(
            roots = roots.len(),
            aux_roots = aux_roots.len(),
            capsules = capsule_list.len(),
            "bundled"
        );
        Ok(Bundle {
            roots,
            aux_roots,
            capsule_list,
        })
    }
}

// ── Unbundler ─────────────────────────────────────────────────────────────────

pub struct Unbundler {
    mosaic: Arc<Mosaic>,
    types: Arc<TypeRegistry>,
    handlers: DashMap<String, Arc<dyn AssociationHandler>>,
}

impl Unbundler {
    pub fn new(mosaic: Arc<Mosaic>, types: Arc<TypeRegistry>) -> Self {
        Self {
            mosaic,
            types,
            handlers: DashMap::new(),
        }
    }

    /// Route association records of `type_name` to `handler`.
    pub fn add_handler(&self, type_name: impl Into<String>, handler: Arc<dyn AssociationHandler>) {
        self.handlers.insert(type_name.into(), handler);
    }

    /// Verify, register, and replay a bundle. Returns the refs that were
    /// not in the mosaic before this call.
    pub fn unbundle(&self, bundle: &Bundle) -> Result<HashSet<Ref>, BundleError> {
        let mut carried: HashMap<Ref, &Capsule> = HashMap::with_capacity(bundle.capsule_list.len());
        for capsule in &bundle.capsule_list {
            carried.entry(capsule.make_ref()).or_insert(capsule);
        }

        // Only capsules reached through a claim are decoded; a carried hit
        // already hashes to the ref that claimed it.
        let mut claimed: HashSet<Ref> = HashSet::new();
        let mut missing: Vec<Ref> = Vec::new();
        let mut queue: VecDeque<Ref> = bundle.roots.iter().chain(&bundle.aux_roots).copied().collect();
        while let Some(r) = queue.pop_front() {
            if !claimed.insert(r) {
                continue;
            }
            match carried.get(&r) {
                Some(capsule) => queue.extend(embedded_refs(&self.mosaic, &self.types, capsule)?),
                None if self.mosaic.contains(&r) => {}
                None => missing.push(r),
            }
        }

        if !missing.is_empty() {
            missing.sort();
            let mut unclaimed: Vec<Ref> = carried.keys().filter(|r| !claimed.contains(r)).copied().collect();
            unclaimed.sort();
            return Err(match unclaimed.first() {
                Some(computed) => {
                    tracing::error!(
                        claimed = %missing[0].short(),
                        computed = %computed.short(),
                        "bundle failed hash verification"
                    );
                    BundleError::HashMismatch {
                        claimed: missing[0],
                        computed: *computed,
                    }
                }
                None => BundleError::MissingCapsule(missing[0]),
            });
        }

        let mut learned = HashSet::new();
        for (r, capsule) in &carried {
            if self.mosaic.register_verified(r, (*capsule).clone())? {
                learned.insert(*r);
            }
        }

        for association in &bundle.aux_roots {
            self.replay(association)?;
        }

        tracing::debug!(
            carried = carried.len(),
            learned = learned.len(),
            "unbundled"
        );
        Ok(learned)
    }

    fn replay(&self, association: &Ref) -> Result<(), BundleError> {
        let capsule = self.mosaic.resolve(association)?;
        let Some(handler) = self
            .handlers
            .get(&capsule.full_type_name)
            .map(|h| Arc::clone(h.value()))
        else {
            tracing::debug!(type_name = %capsule.full_type_name, "no handler for association");
            return Ok(());
        };
        let value = self.mosaic.resolve_typed(association, &self.types)?;
        handler
            .apply(association, value)
            .map_err(|reason| BundleError::Association {
                type_name: capsule.full_type_name.clone(),
                reason,
            })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
