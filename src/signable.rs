//! Signed units and their canonical signature corpora.
//!
//! Every transaction, vote and block carries a [`Unit`]: the claimed signer,
//! the signer's public key, a nanosecond timestamp and a detached signature.
//! The bytes that get signed (the corpus) are built field by field with
//! [`Corpus`], so two nodes always agree on what a signature covers.
//!
//! Integers are written as Go-compatible varints into fixed 16-byte,
//! zero-padded fields: signed values use zig-zag encoding, unsigned values
//! plain LEB128.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Identity, Signature, SigningKeypair, SigningPublicKey};

/// Width of every integer field inside a corpus.
pub const CORPUS_INT_WIDTH: usize = 16;

/// Failures of the cryptographic integrity checks.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SignableError {
    #[error("malformed signer identity {0:?}")]
    MalformedIdentity(String),
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("public key does not belong to signer {0}")]
    IdentityMismatch(Identity),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("self payment")]
    SelfPayment,
    #[error("self voting")]
    SelfVote,
}

/// The signed envelope shared by transactions, votes and blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub signer: Identity,
    pub public_key: SigningPublicKey,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
    pub signature: Signature,
}

impl Unit {
    /// An unsigned envelope for `keypair` stamped at `timestamp`.
    pub fn new(keypair: &SigningKeypair, timestamp: i64) -> Self {
        Unit {
            signer: keypair.identity(),
            public_key: keypair.public.clone(),
            timestamp,
            signature: Signature::empty(),
        }
    }

    /// Corpus prefix common to every signable: signer, then timestamp.
    pub fn write_corpus(&self, corpus: &mut Corpus) {
        corpus.push_bytes(self.signer.as_bytes());
        corpus.push_varint(self.timestamp);
    }
}

/// Something that carries a [`Unit`] and can describe the bytes it signs.
pub trait Signable {
    fn unit(&self) -> &Unit;

    fn unit_mut(&mut self) -> &mut Unit;

    /// The exact, order-sensitive bytes covered by the signature.
    fn corpus(&self) -> Vec<u8>;

    fn signer(&self) -> &Identity {
        &self.unit().signer
    }

    fn timestamp(&self) -> i64 {
        self.unit().timestamp
    }

    fn signature(&self) -> &Signature {
        &self.unit().signature
    }

    /// Sign the current corpus with `keypair`, replacing any previous signature.
    fn sign(&mut self, keypair: &SigningKeypair) {
        let signature = keypair.sign(&self.corpus());
        self.unit_mut().signature = signature;
    }
}

/// Check that a signable was really signed by the identity it claims.
///
/// Pure and side-effect free; safe to call from any task.
pub fn verify<S: Signable + ?Sized>(item: &S) -> Result<(), SignableError> {
    let unit = item.unit();
    if !unit.signer.is_well_formed() {
        return Err(SignableError::MalformedIdentity(unit.signer.to_string()));
    }
    if !unit.public_key.is_valid_size() {
        return Err(SignableError::MalformedPublicKey);
    }
    if Identity::from_public_key(&unit.public_key) != unit.signer {
        return Err(SignableError::IdentityMismatch(unit.signer.clone()));
    }
    if !unit.public_key.verify(&item.corpus(), &unit.signature) {
        return Err(SignableError::InvalidSignature);
    }
    Ok(())
}

// ── Corpus ──

/// Byte builder for signature corpora.
#[derive(Debug, Default)]
pub struct Corpus(Vec<u8>);

impl Corpus {
    pub fn new() -> Self {
        Corpus(Vec::with_capacity(256))
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    /// Zig-zag varint in a fixed-width field.
    pub fn push_varint(&mut self, value: i64) {
        let zigzag = ((value << 1) ^ (value >> 63)) as u64;
        self.push_uvarint(zigzag);
    }

    /// LEB128 varint in a fixed-width field.
    pub fn push_uvarint(&mut self, mut value: u64) {
        let mut field = [0u8; CORPUS_INT_WIDTH];
        let mut i = 0;
        while value >= 0x80 {
            field[i] = (value as u8) | 0x80;
            value >>= 7;
            i += 1;
        }
        field[i] = value as u8;
        self.0.extend_from_slice(&field);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}
