/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Exhaustive enumeration of every message variant exchanged between replicas, and the codec that turns
//! them into the opaque payloads handed to the [`Stack`](crate::stack::Stack).

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{
    checkpoint::messages::Checkpoint,
    replication::messages::{Commit, PrePrepare, Prepare, Request},
    types::{
        data_types::{ReplicaID, SequenceNumber, ViewNumber},
        signed_messages::{encode, Signed},
    },
    view_change::messages::{NewView, ViewChange},
};

/// All message variants used in the replication protocol.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    Request(Signed<Request>),
    PrePrepare(Signed<PrePrepare>),
    Prepare(Signed<Prepare>),
    Commit(Signed<Commit>),
    Checkpoint(Signed<Checkpoint>),
    ViewChange(Signed<ViewChange>),
    NewView(Signed<NewView>),
}

impl Message {
    /// Encode this message into the bytes that are passed to the stack.
    pub fn encode(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decode a message received from the stack.
    pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
        Message::try_from_slice(bytes).map_err(|err| DecodeError(err.to_string()))
    }

    /// Get the replica that claims to have signed the message.
    pub fn signer(&self) -> ReplicaID {
        match self {
            Message::Request(msg) => msg.signer(),
            Message::PrePrepare(msg) => msg.signer(),
            Message::Prepare(msg) => msg.signer(),
            Message::Commit(msg) => msg.signer(),
            Message::Checkpoint(msg) => msg.signer(),
            Message::ViewChange(msg) => msg.signer(),
            Message::NewView(msg) => msg.signer(),
        }
    }

    /// Get the bytes that the message's signature should be over.
    pub fn message_bytes(&self) -> Vec<u8> {
        match self {
            Message::Request(msg) => msg.message_bytes(),
            Message::PrePrepare(msg) => msg.message_bytes(),
            Message::Prepare(msg) => msg.message_bytes(),
            Message::Commit(msg) => msg.message_bytes(),
            Message::Checkpoint(msg) => msg.message_bytes(),
            Message::ViewChange(msg) => msg.message_bytes(),
            Message::NewView(msg) => msg.message_bytes(),
        }
    }

    /// Get the view the message is about, if it is bound to one.
    ///
    /// Requests and checkpoint votes are not bound to a view. For view changes this is the view the
    /// sender wants to move to.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            Message::Request(_) | Message::Checkpoint(_) => None,
            Message::PrePrepare(msg) => Some(msg.message.view),
            Message::Prepare(msg) => Some(msg.message.view),
            Message::Commit(msg) => Some(msg.message.view),
            Message::ViewChange(msg) => Some(msg.message.new_view),
            Message::NewView(msg) => Some(msg.message.view),
        }
    }

    /// Get the sequence number of a three-phase agreement message.
    pub fn seq(&self) -> Option<SequenceNumber> {
        match self {
            Message::PrePrepare(msg) => Some(msg.message.seq),
            Message::Prepare(msg) => Some(msg.message.seq),
            Message::Commit(msg) => Some(msg.message.seq),
            _ => None,
        }
    }

    /// Get the number of bytes the message occupies on the wire.
    pub fn size(&self) -> u64 {
        self.encode().len() as u64
    }

    /// Get the name of the message's variant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => "Request",
            Message::PrePrepare(_) => "PrePrepare",
            Message::Prepare(_) => "Prepare",
            Message::Commit(_) => "Commit",
            Message::Checkpoint(_) => "Checkpoint",
            Message::ViewChange(_) => "ViewChange",
            Message::NewView(_) => "NewView",
        }
    }
}

impl From<Signed<Request>> for Message {
    fn from(value: Signed<Request>) -> Self {
        Message::Request(value)
    }
}

impl From<Signed<PrePrepare>> for Message {
    fn from(value: Signed<PrePrepare>) -> Self {
        Message::PrePrepare(value)
    }
}

impl From<Signed<Prepare>> for Message {
    fn from(value: Signed<Prepare>) -> Self {
        Message::Prepare(value)
    }
}

impl From<Signed<Commit>> for Message {
    fn from(value: Signed<Commit>) -> Self {
        Message::Commit(value)
    }
}

impl From<Signed<Checkpoint>> for Message {
    fn from(value: Signed<Checkpoint>) -> Self {
        Message::Checkpoint(value)
    }
}

impl From<Signed<ViewChange>> for Message {
    fn from(value: Signed<ViewChange>) -> Self {
        Message::ViewChange(value)
    }
}

impl From<Signed<NewView>> for Message {
    fn from(value: Signed<NewView>) -> Self {
        Message::NewView(value)
    }
}

/// The bytes received from the stack are not the encoding of any [`Message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError(pub String);

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "undecodable message: {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::{CryptoHash, SignatureBytes};

    fn prepare() -> Message {
        Message::Prepare(Signed::new(
            Prepare {
                view: ViewNumber::new(3),
                seq: SequenceNumber::new(9),
                digest: CryptoHash::new([5u8; 32]),
                replica: ReplicaID::new(2),
            },
            SignatureBytes::new(vec![1, 2, 3]),
        ))
    }

    #[test]
    fn accessors_expose_the_inner_message() {
        let msg = prepare();
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
        assert_eq!(msg.signer(), ReplicaID::new(2));
        assert_eq!(msg.view(), Some(ViewNumber::new(3)));
        assert_eq!(msg.seq(), Some(SequenceNumber::new(9)));
        assert_eq!(msg.kind(), "Prepare");
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[42, 0, 0]).is_err());

        let mut truncated = prepare().encode();
        truncated.pop();
        assert!(Message::decode(&truncated).is_err());
    }
}
