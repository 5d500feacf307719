/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffer for three-phase agreement messages that arrive before the replica can process them.
//!
//! ## Window-aware buffering
//!
//! A [`PrePrepare`](crate::replication::messages::PrePrepare), `Prepare` or `Commit` message is
//! processed immediately only if it is for the current view and its sequence number is inside the
//! current watermark window. Otherwise:
//! 1. Messages for an **older view**, or with a sequence number **at or below the low watermark**, are
//!    discarded.
//! 2. Messages for a **future view**, or with a sequence number **above the high watermark**, are
//!    placed in the [`MessageBuffer`] and re-processed once the replica enters that view or a stable
//!    checkpoint advances the window far enough.
//!
//! ## Buffer management
//!
//! The buffer's total size is bounded by the capacity given to [`MessageBuffer::new`]. If storing a new
//! message would exceed the capacity, just enough of the messages furthest in the future (highest view
//! first, then highest sequence number) are removed to make space for it. A new message that would
//! itself be the furthest in the future is dropped instead.

use std::{
    collections::{BTreeMap, VecDeque},
    mem,
};

use crate::types::data_types::{BufferSize, ReplicaID, SequenceNumber, ViewNumber};

use super::messages::Message;

type Position = (ViewNumber, SequenceNumber);

pub(crate) struct MessageBuffer {
    buffer_capacity: BufferSize,
    buffer: BTreeMap<Position, VecDeque<(ReplicaID, Message)>>,
    buffer_size: BufferSize,
}

impl MessageBuffer {
    /// Create an empty message buffer.
    pub(crate) fn new(buffer_capacity: BufferSize) -> Self {
        Self {
            buffer_capacity,
            buffer: BTreeMap::new(),
            buffer_size: BufferSize::new(0),
        }
    }

    /// Try inserting `msg`, received from `sender`, into the buffer.
    ///
    /// Returns whether the message was stored. Messages that are not bound to both a view and a
    /// sequence number are never stored.
    pub(crate) fn insert(&mut self, sender: ReplicaID, msg: Message) -> bool {
        let position = match (msg.view(), msg.seq()) {
            (Some(view), Some(seq)) => (view, seq),
            _ => return false,
        };

        let bytes_requested = mem::size_of::<ReplicaID>() as u64 + msg.size();
        if bytes_requested > self.buffer_capacity.int() {
            return false;
        }
        let new_buffer_size = self.buffer_size.int().checked_add(bytes_requested);
        let buffer_will_be_overloaded =
            new_buffer_size.map_or(true, |size| size > self.buffer_capacity.int());
        let msg_is_furthest = self
            .buffer
            .keys()
            .next_back()
            .map_or(false, |furthest| position >= *furthest);

        if buffer_will_be_overloaded {
            if msg_is_furthest {
                return false;
            }
            self.remove_furthest_msgs(bytes_requested);
        }

        self.buffer
            .entry(position)
            .or_insert_with(VecDeque::new)
            .push_back((sender, msg));
        self.buffer_size += bytes_requested;
        true
    }

    /// Remove and return, in position order, every buffered message for `cur_view` with a sequence
    /// number in (`low_watermark`, `high_watermark`]. Messages that became stale are discarded.
    pub(crate) fn take_ready(
        &mut self,
        cur_view: ViewNumber,
        low_watermark: SequenceNumber,
        high_watermark: SequenceNumber,
    ) -> Vec<(ReplicaID, Message)> {
        self.remove_expired_msgs(cur_view, low_watermark);
        if high_watermark <= low_watermark {
            return Vec::new();
        }

        let ready_positions: Vec<Position> = self
            .buffer
            .range((cur_view, low_watermark.next())..=(cur_view, high_watermark))
            .map(|(position, _)| *position)
            .collect();

        let mut ready = Vec::new();
        for position in ready_positions {
            if let Some(msg_queue) = self.buffer.remove(&position) {
                for (sender, msg) in msg_queue {
                    self.buffer_size -= mem::size_of::<ReplicaID>() as u64 + msg.size();
                    ready.push((sender, msg));
                }
            }
        }
        ready
    }

    /// Remove all messages for views lower than `cur_view`, or with sequence numbers at or below
    /// `low_watermark`.
    pub(crate) fn remove_expired_msgs(&mut self, cur_view: ViewNumber, low_watermark: SequenceNumber) {
        let expired: Vec<Position> = self
            .buffer
            .keys()
            .filter(|(view, seq)| *view < cur_view || *seq <= low_watermark)
            .copied()
            .collect();
        for position in expired {
            if let Some(msg_queue) = self.buffer.remove(&position) {
                let bytes: u64 = msg_queue
                    .iter()
                    .map(|(_, msg)| mem::size_of::<ReplicaID>() as u64 + msg.size())
                    .sum();
                self.buffer_size -= bytes;
            }
        }
    }

    /// Number of messages currently buffered.
    pub(crate) fn len(&self) -> usize {
        self.buffer.values().map(|msg_queue| msg_queue.len()).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.buffer.clear();
        self.buffer_size = BufferSize::new(0);
    }

    /// Given the number of bytes that need to be removed, removes just enough of the messages furthest in
    /// the future to free up (at least) the required number of bytes in the buffer.
    fn remove_furthest_msgs(&mut self, bytes_to_remove: u64) {
        let mut bytes_removed = 0;
        while bytes_removed < bytes_to_remove {
            let mut furthest = match self.buffer.last_entry() {
                Some(entry) => entry,
                None => break,
            };
            if let Some((_, msg)) = furthest.get_mut().pop_back() {
                bytes_removed += mem::size_of::<ReplicaID>() as u64 + msg.size();
            }
            if furthest.get().is_empty() {
                furthest.remove();
            }
        }
        self.buffer_size -= bytes_removed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        replication::messages::Prepare,
        types::{
            data_types::{CryptoHash, SignatureBytes},
            signed_messages::Signed,
        },
    };

    fn prepare(view: u64, seq: u64) -> Message {
        Message::Prepare(Signed::new(
            Prepare {
                view: ViewNumber::new(view),
                seq: SequenceNumber::new(seq),
                digest: CryptoHash::new([1u8; 32]),
                replica: ReplicaID::new(1),
            },
            SignatureBytes::new(vec![0u8; 64]),
        ))
    }

    fn msg_cost() -> u64 {
        mem::size_of::<ReplicaID>() as u64 + prepare(0, 0).size()
    }

    #[test]
    fn ready_messages_are_returned_in_order() {
        let mut buffer = MessageBuffer::new(BufferSize::new(1024 * 1024));
        buffer.insert(ReplicaID::new(1), prepare(1, 12));
        buffer.insert(ReplicaID::new(1), prepare(1, 11));
        buffer.insert(ReplicaID::new(1), prepare(2, 11));

        let ready = buffer.take_ready(ViewNumber::new(1), SequenceNumber::new(0), SequenceNumber::new(11));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1.seq(), Some(SequenceNumber::new(11)));

        let ready = buffer.take_ready(ViewNumber::new(1), SequenceNumber::new(10), SequenceNumber::new(20));
        assert_eq!(ready.len(), 1);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn stale_messages_are_discarded() {
        let mut buffer = MessageBuffer::new(BufferSize::new(1024 * 1024));
        buffer.insert(ReplicaID::new(1), prepare(1, 5));
        buffer.insert(ReplicaID::new(1), prepare(2, 3));
        buffer.insert(ReplicaID::new(1), prepare(2, 9));

        let ready = buffer.take_ready(ViewNumber::new(2), SequenceNumber::new(4), SequenceNumber::new(20));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1.seq(), Some(SequenceNumber::new(9)));
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.buffer_size.int(), 0);
    }

    #[test]
    fn furthest_messages_are_evicted_first() {
        let mut buffer = MessageBuffer::new(BufferSize::new(2 * msg_cost()));
        assert!(buffer.insert(ReplicaID::new(1), prepare(1, 1)));
        assert!(buffer.insert(ReplicaID::new(1), prepare(3, 1)));

        // Furthest in the future of all: dropped.
        assert!(!buffer.insert(ReplicaID::new(1), prepare(4, 1)));

        // Nearer than the furthest: evicts (3, 1).
        assert!(buffer.insert(ReplicaID::new(1), prepare(2, 1)));
        assert_eq!(buffer.len(), 2);
        let ready = buffer.take_ready(ViewNumber::new(3), SequenceNumber::new(0), SequenceNumber::new(10));
        assert!(ready.is_empty());
    }
}
