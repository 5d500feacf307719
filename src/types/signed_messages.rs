/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed messages.
//!
//! Every protocol message travels as a [`Signed`] value: the message itself together with the
//! signature of the replica that created it. The signed bytes are the message's
//! [`message_bytes`](SignedMessage::message_bytes), which prefix the borsh encoding of the message with
//! a one-byte kind tag, so that a signature over one kind of message can never be replayed as a
//! signature over another kind.

use borsh::{BorshDeserialize, BorshSerialize};

use super::data_types::{ReplicaID, SignatureBytes};

/// Data types that can be signed by a replica and sent inside a [`Signed`] wrapper.
pub trait SignedMessage: BorshSerialize + Clone {
    /// Tag that separates the signing domain of this message kind from all others.
    const KIND: u8;

    /// Get the replica that claims to have created this message.
    fn signer(&self) -> ReplicaID;

    /// Get the bytes that are passed as input into the signing function.
    fn message_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![Self::KIND];
        bytes.extend(encode(self));
        bytes
    }
}

/// A message and a signature over its [`message_bytes`](SignedMessage::message_bytes).
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Signed<M> {
    pub message: M,
    pub signature: SignatureBytes,
}

impl<M: SignedMessage> Signed<M> {
    /// Wrap `message` together with a `signature` over it.
    pub fn new(message: M, signature: SignatureBytes) -> Self {
        Self { message, signature }
    }

    /// Get the replica that claims to have created the inner message.
    pub fn signer(&self) -> ReplicaID {
        self.message.signer()
    }

    /// Get the bytes that the signature should be over.
    pub fn message_bytes(&self) -> Vec<u8> {
        self.message.message_bytes()
    }
}

/// Serialize `value` into a fresh byte vector.
///
/// Serializing into a `Vec<u8>` cannot fail, so the io error that borsh's writer interface allows for is
/// never produced.
pub(crate) fn encode<T: BorshSerialize + ?Sized>(value: &T) -> Vec<u8> {
    let mut bytes = Vec::new();
    let _ = value.serialize(&mut bytes);
    bytes
}
