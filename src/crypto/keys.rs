//! Post-quantum signing keys (CRYSTALS-Dilithium5) and the identities derived
//! from them.
//!
//! An [`Identity`] is the lowercase hex encoding of the BLAKE3 fingerprint of a
//! signing public key. It is what transactions pay to, what votes back and what
//! balances are keyed by.

use std::fmt;

use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    DetachedSignature as SigTrait, PublicKey as SignPkTrait, SecretKey as SignSkTrait,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::Hash;

const DILITHIUM5_PK_BYTES: usize = 2592;
pub(crate) const DILITHIUM5_SIG_BYTES: usize = 4627;

/// Number of hex characters in a well-formed identity.
pub const IDENTITY_HEX_LEN: usize = 64;

// ── Signing (Dilithium5) ──

/// A CRYSTALS-Dilithium5 signing public key (2592 bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPublicKey(pub(crate) Vec<u8>);

/// A CRYSTALS-Dilithium5 signing secret key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningSecretKey(pub(crate) Vec<u8>);

/// A Dilithium5 detached signature (4627 bytes).
///
/// Empty for the genesis block, which is never signed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// An empty signature, used by the unsigned genesis block.
    pub fn empty() -> Self {
        Signature(vec![])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if !bytes.is_empty() && bytes.len() != DILITHIUM5_SIG_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium5 signature: expected {} bytes, got {}",
                DILITHIUM5_SIG_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// A Dilithium5 signing keypair.
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    pub secret: SigningSecretKey,
}

impl SigningKeypair {
    /// Generate a new random Dilithium5 keypair.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium5::keypair();
        SigningKeypair {
            public: SigningPublicKey(pk.as_bytes().to_vec()),
            secret: SigningSecretKey(sk.as_bytes().to_vec()),
        }
    }

    /// Sign a message, producing a detached signature.
    ///
    /// A corrupted secret key yields an empty signature, which never verifies.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sk = match dilithium5::SecretKey::from_bytes(&self.secret.0) {
            Ok(sk) => sk,
            Err(_) => {
                tracing::error!("SigningKeypair::sign called with corrupted secret key");
                return Signature::empty();
            }
        };
        let sig = dilithium5::detached_sign(message, &sk);
        Signature(sig.as_bytes().to_vec())
    }

    /// The identity this keypair signs as.
    pub fn identity(&self) -> Identity {
        Identity::from_public_key(&self.public)
    }
}

impl SigningPublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Verify a detached signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let pk = match dilithium5::PublicKey::from_bytes(&self.0) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        let sig = match dilithium5::DetachedSignature::from_bytes(&signature.0) {
            Ok(s) => s,
            Err(_) => return false,
        };
        dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
    }

    /// BLAKE3 fingerprint of the public key.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain("slotchain.signing.fingerprint", &self.0)
    }

    pub fn is_valid_size(&self) -> bool {
        self.0.len() == DILITHIUM5_PK_BYTES
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Genesis carries no key; anything else must be a full Dilithium5 key.
        if !bytes.is_empty() && bytes.len() != DILITHIUM5_PK_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Dilithium5 public key: expected {} bytes, got {}",
                DILITHIUM5_PK_BYTES,
                bytes.len()
            )));
        }
        Ok(SigningPublicKey(bytes))
    }
}

// ── Identity ──

/// A participant identity: hex-encoded fingerprint of a signing public key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Derive the identity owned by a public key.
    pub fn from_public_key(pk: &SigningPublicKey) -> Self {
        Identity(hex::encode(pk.fingerprint()))
    }

    /// The empty identity, used as the signer of the genesis block.
    pub fn none() -> Self {
        Identity(String::new())
    }

    /// Parse a textual identity, accepting only the canonical lowercase form.
    pub fn parse(s: &str) -> Option<Self> {
        let id = Identity(s.to_string());
        id.is_well_formed().then_some(id)
    }

    /// True when this is 64 lowercase hex characters.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == IDENTITY_HEX_LEN
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// A short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Identity(s.to_string())
    }
}

impl From<String> for Identity {
    fn from(s: String) -> Self {
        Identity(s)
    }
}
