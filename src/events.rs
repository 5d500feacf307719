/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that a replica publishes as it makes progress.
//!
//! An event for a given action indicates that the action has been completed. Events are published by
//! the algorithm thread on a channel, and handled on a separate [event bus](crate::event_bus) thread by
//! the [default loggers](crate::logging) and by handlers registered through
//! [`ReplicaSpec`](crate::replica::ReplicaSpec).
//!
//! Two events are alerts that operators should act on:
//! - [`ExecutionDivergenceEvent`]: the replica's execution diverged from a quorum of the cluster, and the
//!   replica has halted.
//! - [`ViewChangeStalledEvent`]: view changes keep failing to install a new view.

use std::{
    sync::mpsc::Sender,
    time::{Duration, SystemTime},
};

use crate::{
    checkpoint::messages::Checkpoint,
    replication::messages::{Commit, PrePrepare, Prepare},
    stack::StackError,
    types::data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
    view_change::messages::{NewView, ViewChange},
};

/// Enumerates all events defined for the replication engine.
pub enum Event {
    // Events that involve receiving or issuing a three-phase agreement message.
    ReceiveRequest(ReceiveRequestEvent),
    PrePrepare(PrePrepareEvent),
    ReceivePrePrepare(ReceivePrePrepareEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),

    // Events that change the committed or executed state.
    CommitLocal(CommitLocalEvent),
    Execute(ExecuteEvent),
    ExecutionFailed(ExecutionFailedEvent),

    // Checkpoint events.
    Checkpoint(CheckpointEvent),
    StableCheckpoint(StableCheckpointEvent),
    FallingBehind(FallingBehindEvent),
    ExecutionDivergence(ExecutionDivergenceEvent),

    // View-change events.
    RequestTimeout(RequestTimeoutEvent),
    Equivocation(EquivocationEvent),
    StartViewChange(StartViewChangeEvent),
    ViewChangeStalled(ViewChangeStalledEvent),
    NewView(NewViewEvent),
    InstallView(InstallViewEvent),
    RejectNewView(RejectNewViewEvent),
}

impl Event {
    /// Publish the event on `event_publisher`, if there is one.
    ///
    /// A disconnected event bus is not an error: the replica keeps running without publishing.
    pub(crate) fn publish(self, event_publisher: &Option<Sender<Event>>) {
        if let Some(event_publisher) = event_publisher {
            let _ = event_publisher.send(self);
        }
    }
}

/// The replica stored a new, valid request.
pub struct ReceiveRequestEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub digest: CryptoHash,
}

/// The replica, as primary, assigned a sequence number to a request and broadcast a `PrePrepare`.
pub struct PrePrepareEvent {
    pub timestamp: SystemTime,
    pub pre_prepare: PrePrepare,
}

/// The replica accepted a `PrePrepare` from the primary.
pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: ReplicaID,
    pub pre_prepare: PrePrepare,
}

/// The replica broadcast a `Prepare`.
pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: Prepare,
}

/// The replica broadcast a `Commit`.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: Commit,
}

/// The request with `digest` became committed-local at (`view`, `seq`).
pub struct CommitLocalEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub digest: CryptoHash,
}

/// The request with `digest` was executed at `seq`. A null `digest` means that a null request was
/// skipped.
pub struct ExecuteEvent {
    pub timestamp: SystemTime,
    pub seq: SequenceNumber,
    pub digest: CryptoHash,
}

/// The stack failed to execute the request with `digest` at `seq`. The execution pointer still moved
/// past `seq`.
pub struct ExecutionFailedEvent {
    pub timestamp: SystemTime,
    pub seq: SequenceNumber,
    pub digest: CryptoHash,
    pub error: StackError,
}

/// The replica broadcast its checkpoint vote.
pub struct CheckpointEvent {
    pub timestamp: SystemTime,
    pub checkpoint: Checkpoint,
}

/// A checkpoint became stable, and the low watermark advanced to `seq`.
pub struct StableCheckpointEvent {
    pub timestamp: SystemTime,
    pub seq: SequenceNumber,
    pub state_digest: CryptoHash,
}

/// The cluster has a stable checkpoint at `stable`, beyond what this replica has executed.
pub struct FallingBehindEvent {
    pub timestamp: SystemTime,
    pub stable: SequenceNumber,
    pub last_executed: SequenceNumber,
}

/// A quorum of the cluster agreed on a state digest at `seq` that differs from this replica's.
pub struct ExecutionDivergenceEvent {
    pub timestamp: SystemTime,
    pub seq: SequenceNumber,
    pub local: CryptoHash,
    pub quorum: CryptoHash,
}

/// A request was not committed in time, so the replica suspects the primary of `view`.
pub struct RequestTimeoutEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub digest: CryptoHash,
}

/// The primary of `view` signed two `PrePrepare`s with different digests for `seq`.
pub struct EquivocationEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seq: SequenceNumber,
    pub primary: ReplicaID,
    pub first: CryptoHash,
    pub second: CryptoHash,
}

/// The replica broadcast a `ViewChange`.
pub struct StartViewChangeEvent {
    pub timestamp: SystemTime,
    pub view_change: ViewChange,
    pub timeout: Duration,
}

/// `attempts` consecutive view changes, the latest towards `target`, have not installed a new view.
pub struct ViewChangeStalledEvent {
    pub timestamp: SystemTime,
    pub target: ViewNumber,
    pub attempts: u32,
}

/// The replica, as the new primary, broadcast a `NewView`.
pub struct NewViewEvent {
    pub timestamp: SystemTime,
    pub new_view: NewView,
}

/// The replica installed `view`, whose primary is `primary`.
pub struct InstallViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub primary: ReplicaID,
}

/// The replica received a `NewView` for `view` from `origin` that it could not validate.
pub struct RejectNewViewEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub origin: ReplicaID,
    pub reason: String,
}
