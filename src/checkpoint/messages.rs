/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for checkpoint votes and the certificates they aggregate into.

use std::collections::BTreeSet;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    data_types::{CryptoHash, ReplicaID, SequenceNumber},
    signed_messages::{Signed, SignedMessage},
};

/// A replica's vote on the digest of its application state right after executing `seq`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Checkpoint {
    pub seq: SequenceNumber,
    pub state_digest: CryptoHash,
    pub replica: ReplicaID,
}

impl SignedMessage for Checkpoint {
    const KIND: u8 = 4;

    fn signer(&self) -> ReplicaID {
        self.replica
    }
}

/// Proof that a quorum of replicas reached the same `state_digest` after executing up to `seq`.
///
/// The stable checkpoint at sequence number 0 is the [`genesis`](Self::genesis) checkpoint. It
/// carries no votes and is trusted by every replica.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct StableCheckpoint {
    pub seq: SequenceNumber,
    pub state_digest: CryptoHash,
    pub proof: Vec<Signed<Checkpoint>>,
}

impl StableCheckpoint {
    /// Get the stable checkpoint that every replica starts from.
    pub fn genesis() -> Self {
        Self {
            seq: SequenceNumber::init(),
            state_digest: CryptoHash::null(),
            proof: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.seq == SequenceNumber::init()
    }

    /// Get the distinct replicas whose votes in `proof` match this checkpoint.
    pub(crate) fn matching_signers(&self) -> BTreeSet<ReplicaID> {
        self.proof
            .iter()
            .filter(|vote| vote.message.seq == self.seq && vote.message.state_digest == self.state_digest)
            .map(|vote| vote.signer())
            .collect()
    }
}
