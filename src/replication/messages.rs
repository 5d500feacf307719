/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the messages that are exchanged as part of the three-phase agreement protocol.

use std::time::SystemTime;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    crypto_primitives::hash,
    data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
    signed_messages::SignedMessage,
};

/// A client transaction, as submitted to the replica `origin`.
///
/// Requests are identified by their [`digest`](Request::digest), which covers every field, so the same
/// payload submitted twice (with different timestamps) is ordered twice.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Request {
    /// Nanoseconds since the Unix Epoch at which the request was submitted.
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub origin: ReplicaID,
}

impl Request {
    /// Create a `Request` for `payload` submitted to `origin` now.
    pub fn new(payload: Vec<u8>, origin: ReplicaID) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            timestamp,
            payload,
            origin,
        }
    }

    /// Get the digest that identifies this request.
    pub fn digest(&self) -> CryptoHash {
        hash(&self.message_bytes())
    }
}

impl SignedMessage for Request {
    const KIND: u8 = 0;

    fn signer(&self) -> ReplicaID {
        self.origin
    }
}

/// Issued once by the primary of `view` to bind `digest` to `seq`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: CryptoHash,
    pub replica: ReplicaID,
}

impl SignedMessage for PrePrepare {
    const KIND: u8 = 1;

    fn signer(&self) -> ReplicaID {
        self.replica
    }
}

/// A backup's vote agreeing with the [`PrePrepare`] for (`view`, `seq`).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: CryptoHash,
    pub replica: ReplicaID,
}

impl SignedMessage for Prepare {
    const KIND: u8 = 2;

    fn signer(&self) -> ReplicaID {
        self.replica
    }
}

/// A vote that the request with `digest` is prepared at (`view`, `seq`) and safe to execute.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: CryptoHash,
    pub replica: ReplicaID,
}

impl SignedMessage for Commit {
    const KIND: u8 = 3;

    fn signer(&self) -> ReplicaID {
        self.replica
    }
}
