//! Cryptographic identity and parcels.
//!
//! Provides three things:
//!   1. BLAKE3 hashing for content addresses and key derivation
//!   2. Identity / Peer pairs: ed25519 for signatures, x25519 for key agreement
//!   3. Parcels: a bundle encrypted to one peer and signed by its sender
//!
//! Parcel construction is hybrid. A fresh 32-byte key encrypts the
//! canonical bundle bytes with XChaCha20-Poly1305. That key is then sealed
//! for the receiver with single-shot HPKE in Auth mode (RFC 9180,
//! X25519-HKDF-SHA256 / HKDF-SHA256 / ChaCha20Poly1305), keyed by the
//! sender's and receiver's X25519 keys. The sender signs the encrypted
//! bundle bytes.
//!
//! ```text
//! encrypted_bundle        = nonce(24) || aead(bundle_key, cdr(bundle))
//! encrypted_symmetric_key = encapped_key(32) || hpke_seal(bundle_key)
//! ```
//!
//! All private key material is zeroized on drop.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hpke::aead::ChaCha20Poly1305;
use hpke::kdf::HkdfSha256;
use hpke::kem::X25519HkdfSha256;
use hpke::{Deserializable, Kem as KemTrait, OpModeR, OpModeS, Serializable};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bundle::Bundle;
use crate::codec::{DecodeError, EncodeError, Schema, Value};
use crate::object::Object;

type Kem = X25519HkdfSha256;

/// Bound into every key wrap; bump when the parcel format changes.
const KEY_WRAP_INFO: &[u8] = b"tessera-parcel-v1";
const ENCAPPED_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// The public half of an identity. Addressable: its ref names the peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub signing_key: [u8; 32],
    pub encryption_key: [u8; 32],
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer({})", hex::encode(&self.signing_key[..4]))
    }
}

impl Peer {
    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.signing_key).map_err(|_| CryptoError::InvalidKey)
    }

    /// Encrypt `bundle` to this peer and sign it as `sender`.
    pub fn make_parcel(&self, bundle: &Bundle, sender: &Identity) -> Result<Parcel, CryptoError> {
        let plaintext = Zeroizing::new(bundle.encode()?);
        let bundle_key = Zeroizing::new(random_bytes::<KEY_LEN>());

        let encrypted_bundle = seal(&bundle_key, &plaintext)?;
        let encrypted_symmetric_key = self.wrap_key(&bundle_key, sender)?;
        let sender_signature = sender.sign(&encrypted_bundle);

        Ok(Parcel {
            receiver: *self,
            encrypted_symmetric_key,
            encrypted_bundle,
            sender_signature,
        })
    }

    fn wrap_key(&self, bundle_key: &[u8; KEY_LEN], sender: &Identity) -> Result<Vec<u8>, CryptoError> {
        let (sender_priv, sender_pub) = sender.hpke_keypair()?;
        let receiver = hpke_public(&self.encryption_key)?;
        let (encapped, sealed) = hpke::single_shot_seal::<ChaCha20Poly1305, HkdfSha256, Kem, _>(
            &OpModeS::Auth((sender_priv, sender_pub)),
            &receiver,
            KEY_WRAP_INFO,
            bundle_key,
            &[],
            &mut rand::rngs::OsRng,
        )
        .map_err(|_| CryptoError::Encryption)?;

        let encapped = encapped.to_bytes();
        let mut out = Vec::with_capacity(encapped.len() + sealed.len());
        out.extend_from_slice(&encapped);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
}

impl Object for Peer {
    const TYPE_NAME: &'static str = "tessera.peer";

    fn schema() -> Schema {
        Schema::record([
            ("signing_key", Schema::Binary),
            ("encryption_key", Schema::Binary),
        ])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![
            Value::Binary(self.signing_key.to_vec()),
            Value::Binary(self.encryption_key.to_vec()),
        ])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        let signing_key = f.next("signing_key", key_bytes)?;
        let encryption_key = f.next("encryption_key", key_bytes)?;
        let peer = Self {
            signing_key,
            encryption_key,
        };
        peer.verifying_key()
            .map_err(|_| DecodeError::invalid("signing key is not a valid ed25519 point"))?;
        Ok(peer)
    }
}

fn key_bytes(value: Value) -> Result<[u8; 32], DecodeError> {
    let raw = value.into_binary()?;
    raw.as_slice()
        .try_into()
        .map_err(|_| DecodeError::invalid(format!("key is {} bytes, expected 32", raw.len())))
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// The private half: signs outgoing parcels and opens incoming ones.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Identity {
    signing: Zeroizing<[u8; 32]>,
    encryption: Zeroizing<[u8; 32]>,
    #[zeroize(skip)]
    peer: Peer,
}

impl Identity {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let encryption = StaticSecret::random_from_rng(rand::thread_rng());
        Self::from_parts(signing.to_bytes(), encryption.to_bytes())
    }

    fn from_parts(signing: [u8; 32], encryption: [u8; 32]) -> Self {
        let verifying = SigningKey::from_bytes(&signing).verifying_key();
        let public = PublicKey::from(&StaticSecret::from(encryption));
        Self {
            signing: Zeroizing::new(signing),
            encryption: Zeroizing::new(encryption),
            peer: Peer {
                signing_key: verifying.to_bytes(),
                encryption_key: *public.as_bytes(),
            },
        }
    }

    /// Rebuild from the 64 bytes produced by [`Identity::secret_bytes`].
    /// Public halves are always derived, never stored.
    pub fn from_secret_bytes(bytes: &[u8; 64]) -> Self {
        let mut signing = [0u8; 32];
        let mut encryption = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        encryption.copy_from_slice(&bytes[32..]);
        let identity = Self::from_parts(signing, encryption);
        signing.zeroize();
        encryption.zeroize();
        identity
    }

    /// Signing secret followed by encryption secret. Store with mode 0600.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 64]> {
        let mut out = Zeroizing::new([0u8; 64]);
        out[..32].copy_from_slice(&*self.signing);
        out[32..].copy_from_slice(&*self.encryption);
        out
    }

    /// Load the identity stored at `path`, creating one if the file is absent.
    pub fn load_or_generate(path: &Path) -> Result<Self, CryptoError> {
        match std::fs::read(path) {
            Ok(raw) => {
                let raw = Zeroizing::new(raw);
                let bytes: &[u8; 64] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::KeyFile(format!("{}: expected 64 bytes", path.display())))?;
                let identity = Self::from_secret_bytes(bytes);
                tracing::info!(path = %path.display(), peer = ?identity.peer, "identity loaded");
                Ok(identity)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate();
                write_secret_file(path, &*identity.secret_bytes())
                    .map_err(|e| CryptoError::KeyFile(format!("{}: {e}", path.display())))?;
                tracing::info!(path = %path.display(), peer = ?identity.peer, "identity generated");
                Ok(identity)
            }
            Err(e) => Err(CryptoError::KeyFile(format!("{}: {e}", path.display()))),
        }
    }

    pub fn peer(&self) -> Peer {
        self.peer
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        let key = SigningKey::from_bytes(&self.signing);
        Signature {
            signer: self.peer,
            signature: key.sign(data).to_bytes(),
        }
    }

    /// Open a parcel addressed to this identity.
    ///
    /// The signature is checked before any decryption is attempted.
    pub fn decrypt_parcel(&self, parcel: &Parcel) -> Result<Bundle, CryptoError> {
        if parcel.receiver != self.peer {
            return Err(CryptoError::NotAddressedToUs);
        }
        parcel.sender_signature.verify(&parcel.encrypted_bundle)?;

        let bundle_key = self.unwrap_key(&parcel.encrypted_symmetric_key, parcel.sender())?;
        let plaintext = Zeroizing::new(open(&bundle_key, &parcel.encrypted_bundle)?);
        Ok(Bundle::decode(&plaintext)?)
    }

    fn unwrap_key(&self, wrapped: &[u8], sender: &Peer) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
        if wrapped.len() < ENCAPPED_KEY_LEN + 16 {
            return Err(CryptoError::TooShort);
        }
        let (encapped, sealed) = wrapped.split_at(ENCAPPED_KEY_LEN);
        let encapped =
            <Kem as KemTrait>::EncappedKey::from_bytes(encapped).map_err(|_| CryptoError::InvalidKey)?;
        let (own_priv, _) = self.hpke_keypair()?;
        let sender_pub = hpke_public(&sender.encryption_key)?;

        let raw = Zeroizing::new(
            hpke::single_shot_open::<ChaCha20Poly1305, HkdfSha256, Kem>(
                &OpModeR::Auth(sender_pub),
                &own_priv,
                &encapped,
                KEY_WRAP_INFO,
                sealed,
                &[],
            )
            .map_err(|_| CryptoError::Decryption)?,
        );
        if raw.len() != KEY_LEN {
            return Err(CryptoError::Decryption);
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&raw);
        Ok(key)
    }

    fn hpke_keypair(
        &self,
    ) -> Result<(<Kem as KemTrait>::PrivateKey, <Kem as KemTrait>::PublicKey), CryptoError> {
        let private =
            <Kem as KemTrait>::PrivateKey::from_bytes(&*self.encryption).map_err(|_| CryptoError::InvalidKey)?;
        Ok((private, hpke_public(&self.peer.encryption_key)?))
    }
}

fn hpke_public(key: &[u8; 32]) -> Result<<Kem as KemTrait>::PublicKey, CryptoError> {
    <Kem as KemTrait>::PublicKey::from_bytes(key).map_err(|_| CryptoError::InvalidKey)
}

#[cfg(unix)]
fn write_secret_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_secret_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)
}

// ── AEAD helpers ──────────────────────────────────────────────────────────────

/// `nonce || ciphertext` under a random nonce.
fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = random_bytes::<NONCE_LEN>();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + 16 {
        return Err(CryptoError::TooShort);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    XChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

// ── Signature ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signer: Peer,
    pub signature: [u8; 64],
}

impl Signature {
    fn schema() -> Schema {
        Schema::record([("signer", Peer::schema()), ("signature", Schema::Binary)])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![self.signer.to_value(), Value::Binary(self.signature.to_vec())])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields("signature")?;
        let signer = f.next("signer", Peer::from_value)?;
        let signature: [u8; 64] = f.next("signature", |v| {
            let raw = v.into_binary()?;
            raw.as_slice().try_into().map_err(|_| {
                DecodeError::invalid(format!("signature is {} bytes, expected 64", raw.len()))
            })
        })?;
        Ok(Self { signer, signature })
    }

    /// Hard failure on any mismatch.
    pub fn verify(&self, data: &[u8]) -> Result<(), CryptoError> {
        let key = self.signer.verifying_key()?;
        let signature = ed25519_dalek::Signature::from_bytes(&self.signature);
        key.verify(data, &signature).map_err(|_| {
            tracing::warn!(signer = ?self.signer, "signature verification failed");
            CryptoError::SignatureInvalid
        })
    }
}

// ── Parcel ────────────────────────────────────────────────────────────────────

/// A signed, encrypted bundle addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parcel {
    pub receiver: Peer,
    pub encrypted_symmetric_key: Vec<u8>,
    pub encrypted_bundle: Vec<u8>,
    pub sender_signature: Signature,
}

impl Parcel {
    pub fn sender(&self) -> &Peer {
        &self.sender_signature.signer
    }
}

impl Object for Parcel {
    const TYPE_NAME: &'static str = "tessera.parcel";

    fn schema() -> Schema {
        Schema::record([
            ("receiver", Peer::schema()),
            ("encrypted_symmetric_key", Schema::Binary),
            ("encrypted_bundle", Schema::Binary),
            ("sender_signature", Signature::schema()),
        ])
    }

    fn to_value(&self) -> Value {
        Value::Record(vec![
            self.receiver.to_value(),
            Value::Binary(self.encrypted_symmetric_key.clone()),
            Value::Binary(self.encrypted_bundle.clone()),
            self.sender_signature.to_value(),
        ])
    }

    fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut f = value.into_fields(Self::TYPE_NAME)?;
        Ok(Self {
            receiver: f.next("receiver", Peer::from_value)?,
            encrypted_symmetric_key: f.binary("encrypted_symmetric_key")?,
            encrypted_bundle: f.binary("encrypted_bundle")?,
            sender_signature: f.next("sender_signature", Signature::from_value)?,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("decryption failed: wrong key or tampered ciphertext")]
    Decryption,

    #[error("encryption failed")]
    Encryption,

    #[error("ciphertext too short")]
    TooShort,

    #[error("parcel is not addressed to this identity")]
    NotAddressedToUs,

    #[error("invalid public key")]
    InvalidKey,

    #[error("key file: {0}")]
    KeyFile(String),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
