//! Delegate votes.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Identity, SigningKeypair};
use crate::signable::{self, Corpus, Signable, SignableError, Unit};
use crate::Hash;

/// A signed endorsement of `candidate` by the unit's signer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub unit: Unit,
    pub candidate: Identity,
}

impl Vote {
    pub fn new(keypair: &SigningKeypair, candidate: Identity, timestamp: i64) -> Self {
        let mut vote = Vote {
            unit: Unit::new(keypair, timestamp),
            candidate,
        };
        vote.sign(keypair);
        vote
    }

    pub fn voter(&self) -> &Identity {
        &self.unit.signer
    }

    pub fn verify(&self) -> Result<(), SignableError> {
        if self.unit.signer == self.candidate {
            return Err(SignableError::SelfVote);
        }
        signable::verify(self)
    }

    pub fn id(&self) -> Hash {
        crate::hash_domain("slotchain.vote_id", self.unit.signature.as_bytes())
    }
}

impl Signable for Vote {
    fn unit(&self) -> &Unit {
        &self.unit
    }

    fn unit_mut(&mut self) -> &mut Unit {
        &mut self.unit
    }

    fn corpus(&self) -> Vec<u8> {
        let mut corpus = Corpus::new();
        self.unit.write_corpus(&mut corpus);
        corpus.push_bytes(self.candidate.as_bytes());
        corpus.into_bytes()
    }
}
