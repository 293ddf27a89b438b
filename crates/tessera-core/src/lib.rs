//! Tessera core: values, content addressing, bundling, and parcels.
//!
//! Everything here is synchronous and transport-agnostic. The services
//! crate layers routing, transports, and RPC on top.

pub mod bundle;
pub mod capsule;
pub mod cdr;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod json;
pub mod mosaic;
pub mod object;
pub mod ref_file;
pub mod wire;

pub use bundle::{AssociationHandler, AssociationRegistry, Bundle, BundleError, Bundler, Unbundler};
pub use capsule::{Capsule, Ref};
pub use codec::{CodecRegistry, DecodeError, Schema, Value};
pub use crypto::{CryptoError, Identity, Parcel, Peer, Signature};
pub use mosaic::{Mosaic, MosaicError};
pub use object::{Object, Text, TypeRegistry};
