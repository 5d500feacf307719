/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages that are exchanged as part of the view-change protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    checkpoint::messages::Checkpoint,
    replication::messages::{PrePrepare, Prepare},
    types::{
        data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
        signed_messages::{Signed, SignedMessage},
    },
};

/// Proof that a request reached the prepared state: the primary's [`PrePrepare`] together with the
/// matching [`Prepare`]s of `2f` distinct backups.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PreparedCertificate {
    pub pre_prepare: Signed<PrePrepare>,
    pub prepares: Vec<Signed<Prepare>>,
}

impl PreparedCertificate {
    pub fn view(&self) -> ViewNumber {
        self.pre_prepare.message.view
    }

    pub fn seq(&self) -> SequenceNumber {
        self.pre_prepare.message.seq
    }

    pub fn digest(&self) -> CryptoHash {
        self.pre_prepare.message.digest
    }
}

/// A replica's request to move to `new_view`, carrying proof of the safe state it can vouch for.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ViewChange {
    pub new_view: ViewNumber,

    /// Sequence number of the replica's last stable checkpoint.
    pub last_stable: SequenceNumber,

    /// The replica's digest of the state at `last_stable`.
    pub last_stable_digest: CryptoHash,

    /// `2f+1` matching checkpoint votes for (`last_stable`, `last_stable_digest`). Empty if
    /// `last_stable` is 0.
    pub checkpoint_proof: Vec<Signed<Checkpoint>>,

    /// For every sequence number above `last_stable` that prepared at the replica, the prepared
    /// certificate from the highest view.
    pub prepared: Vec<PreparedCertificate>,

    pub replica: ReplicaID,
}

impl SignedMessage for ViewChange {
    const KIND: u8 = 5;

    fn signer(&self) -> ReplicaID {
        self.replica
    }
}

/// The new primary's message installing `view`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewView {
    pub view: ViewNumber,

    /// The `2f+1` view changes for `view` that the primary based `pre_prepares` on.
    pub view_changes: Vec<Signed<ViewChange>>,

    /// Pre-prepares for every sequence number between the latest stable checkpoint in `view_changes`
    /// and the highest prepared sequence number in `view_changes`.
    pub pre_prepares: Vec<Signed<PrePrepare>>,

    pub replica: ReplicaID,
}

impl SignedMessage for NewView {
    const KIND: u8 = 6;

    fn signer(&self) -> ReplicaID {
        self.replica
    }
}
