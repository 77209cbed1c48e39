//! Signing keys and peer identities.

pub mod keys;

pub use keys::{Identity, Signature, SigningKeypair, SigningPublicKey};
