/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The exclusively-owned state of an active replica, and the context that protocol handlers act through.
//!
//! Every protocol handler receives two mutable references:
//! 1. A [`ProtocolContext`], through which it signs and sends messages, calls into the
//!    [`Stack`], and publishes [events](crate::events).
//! 2. The [`ReplicaState`]: the current view, status, watermarks and execution pointer, together with the
//!    [message log](crate::message_log), [timers](crate::timers) and the out-of-window
//!    [message buffer](crate::networking::buffer).
//!
//! Both are owned by the [`Pbft`](crate::adapter::Pbft) adapter, and are only ever touched from its
//! single processing path.

use std::{sync::mpsc::Sender, time::Duration};

use borsh::BorshSerialize;

use crate::{
    confidentiality::Confidentiality,
    events::Event,
    message_log::MessageLog,
    networking::{buffer::MessageBuffer, messages::Message},
    quorum::QuorumParams,
    stack::{Stack, StackError},
    timers::Timers,
    types::{
        data_types::{BufferSize, ReplicaID, SequenceNumber, ViewNumber},
        signed_messages::{encode, Signed, SignedMessage},
    },
};

/// Whether the replica is taking part in three-phase agreement, or trying to move to a new view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Normal,

    /// The replica has broadcast a view change for `target`, and stopped accepting three-phase
    /// agreement messages for its current view.
    ViewChanging { target: ViewNumber },
}

pub(crate) struct ReplicaState {
    /// The last view this replica installed.
    pub(crate) view: ViewNumber,
    pub(crate) status: Status,

    /// Sequence number of the last stable checkpoint. Never decreases.
    pub(crate) low_watermark: SequenceNumber,

    /// Sequence number of the last request executed (or skipped as a null request).
    pub(crate) last_executed: SequenceNumber,

    pub(crate) log: MessageLog,
    pub(crate) timers: Timers,
    pub(crate) buffer: MessageBuffer,
}

impl ReplicaState {
    pub(crate) fn new(msg_buffer_capacity: BufferSize) -> Self {
        Self {
            view: ViewNumber::init(),
            status: Status::Normal,
            low_watermark: SequenceNumber::init(),
            last_executed: SequenceNumber::init(),
            log: MessageLog::new(),
            timers: Timers::new(),
            buffer: MessageBuffer::new(msg_buffer_capacity),
        }
    }

    pub(crate) fn high_watermark(&self, log_window: u64) -> SequenceNumber {
        self.low_watermark + log_window
    }

    pub(crate) fn is_normal(&self) -> bool {
        self.status == Status::Normal
    }

    /// Release the log, the buffer and every outstanding deadline.
    pub(crate) fn clear(&mut self) {
        self.log.clear();
        self.timers.clear();
        self.buffer.clear();
    }
}

/// Parameters of the protocol that are fixed once the replica knows its membership.
#[derive(Clone, Debug)]
pub(crate) struct ProtocolConfiguration {
    pub(crate) me: ReplicaID,
    pub(crate) params: QuorumParams,
    pub(crate) checkpoint_period: u64,
    pub(crate) log_window: u64,
    pub(crate) request_timeout: Duration,
    pub(crate) view_change_timeout: Duration,
    pub(crate) max_backoff_exponent: u32,
    pub(crate) view_change_alert_threshold: u32,
    pub(crate) confidentiality: Confidentiality,
}

pub(crate) struct ProtocolContext<S: Stack> {
    pub(crate) stack: S,
    pub(crate) config: ProtocolConfiguration,
    pub(crate) event_publisher: Option<Sender<Event>>,
}

impl<S: Stack> ProtocolContext<S> {
    pub(crate) fn me(&self) -> ReplicaID {
        self.config.me
    }

    pub(crate) fn params(&self) -> &QuorumParams {
        &self.config.params
    }

    pub(crate) fn primary(&self, view: ViewNumber) -> ReplicaID {
        self.config.params.primary(view)
    }

    pub(crate) fn is_primary(&self, view: ViewNumber) -> bool {
        self.primary(view) == self.config.me
    }

    /// Sign `message` through the stack.
    pub(crate) fn sign<M: SignedMessage>(&self, message: M) -> Result<Signed<M>, StackError> {
        let signature = self.stack.sign(&message.message_bytes())?;
        Ok(Signed::new(message, signature))
    }

    /// Check the signature on `signed` through the stack.
    pub(crate) fn verify<M: SignedMessage>(&self, signed: &Signed<M>) -> bool {
        self.config.params.contains(signed.signer())
            && self
                .stack
                .verify(signed.signer(), &signed.signature, &signed.message_bytes())
                .is_ok()
    }

    pub(crate) fn broadcast(&mut self, msg: impl Into<Message>) {
        self.stack.broadcast(msg.into().encode())
    }

    /// Send `msg` to `replica`. Send failures are not retried.
    pub(crate) fn unicast(&mut self, msg: impl Into<Message>, replica: ReplicaID) {
        if let Err(err) = self.stack.unicast(msg.into().encode(), replica) {
            log::debug!("failed to send to replica {}: {}", replica, err);
        }
    }

    pub(crate) fn publish(&self, event: Event) {
        event.publish(&self.event_publisher)
    }

    /// Store `value` under `key` through the stack. Failures are logged and not retried.
    pub(crate) fn persist<T: BorshSerialize>(&mut self, key: &[u8], value: &T) {
        if let Err(err) = self.stack.store_state(key, encode(value)) {
            log::warn!("failed to store protocol state under key {:?}: {}", key, err);
        }
    }
}
