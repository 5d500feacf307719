/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Wire messages and the buffering of messages that arrive ahead of the replica.
//!
//! The replication core never touches sockets. Outgoing [messages](messages::Message) are
//! [encoded](messages::Message::encode) into opaque byte payloads and handed to the
//! [`Stack`](crate::stack::Stack); incoming payloads are [decoded](messages::Message::decode) and
//! authenticated before they reach any protocol handler.

pub mod messages;

pub(crate) mod buffer;
