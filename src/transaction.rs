//! Value transfers between identities.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Identity, SigningKeypair};
use crate::signable::{self, Corpus, Signable, SignableError, Unit};
use crate::Hash;

/// A signed transfer of `amount` from the unit's signer to `recipient`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub unit: Unit,
    pub recipient: Identity,
    pub amount: u64,
}

impl Transaction {
    /// Build and sign a payment from `keypair` to `recipient`.
    pub fn pay(keypair: &SigningKeypair, recipient: Identity, amount: u64, timestamp: i64) -> Self {
        let mut tx = Transaction {
            unit: Unit::new(keypair, timestamp),
            recipient,
            amount,
        };
        tx.sign(keypair);
        tx
    }

    pub fn sender(&self) -> &Identity {
        &self.unit.signer
    }

    /// Signature check plus the payment's own rule: nobody pays themselves.
    pub fn verify(&self) -> Result<(), SignableError> {
        if self.unit.signer == self.recipient {
            return Err(SignableError::SelfPayment);
        }
        signable::verify(self)
    }

    /// Content identifier, derived from the signature.
    pub fn id(&self) -> Hash {
        crate::hash_domain("slotchain.tx_id", self.unit.signature.as_bytes())
    }
}

impl Signable for Transaction {
    fn unit(&self) -> &Unit {
        &self.unit
    }

    fn unit_mut(&mut self) -> &mut Unit {
        &mut self.unit
    }

    fn corpus(&self) -> Vec<u8> {
        let mut corpus = Corpus::new();
        self.unit.write_corpus(&mut corpus);
        corpus.push_bytes(self.recipient.as_bytes());
        corpus.push_uvarint(self.amount);
        corpus.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_payment_verifies() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let tx = Transaction::pay(&alice, bob.identity(), 7, 1_000);
        assert_eq!(tx.verify(), Ok(()));
        assert_eq!(tx.sender(), &alice.identity());
    }

    #[test]
    fn self_payment_rejected() {
        let alice = SigningKeypair::generate();
        let tx = Transaction::pay(&alice, alice.identity(), 7, 1_000);
        assert_eq!(tx.verify(), Err(SignableError::SelfPayment));
    }

    #[test]
    fn altered_amount_rejected() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let mut tx = Transaction::pay(&alice, bob.identity(), 7, 1_000);
        tx.amount = 700;
        assert_eq!(tx.verify(), Err(SignableError::InvalidSignature));
    }

    #[test]
    fn altered_recipient_rejected() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let mallory = SigningKeypair::generate();
        let mut tx = Transaction::pay(&alice, bob.identity(), 7, 1_000);
        tx.recipient = mallory.identity();
        assert_eq!(tx.verify(), Err(SignableError::InvalidSignature));
    }

    #[test]
    fn corpus_layout() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let tx = Transaction::pay(&alice, bob.identity(), 1, 0);
        let corpus = tx.corpus();
        // signer(64) + ts field(16) + recipient(64) + amount field(16)
        assert_eq!(corpus.len(), 64 + 16 + 64 + 16);
        assert_eq!(&corpus[..64], alice.identity().as_bytes());
        assert_eq!(&corpus[80..144], bob.identity().as_bytes());
        assert_eq!(corpus[144], 1);
    }

    #[test]
    fn ids_differ_per_signature() {
        let alice = SigningKeypair::generate();
        let bob = SigningKeypair::generate();
        let a = Transaction::pay(&alice, bob.identity(), 1, 0);
        let b = Transaction::pay(&alice, bob.identity(), 1, 1);
        assert_ne!(a.id(), b.id());
    }
}
