/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the checkpoint subprotocol.
//!
//! Main type: [`CheckpointManager`].

use std::{collections::BTreeMap, time::SystemTime};

use crate::{
    adapter::PbftError,
    checkpoint::messages::{Checkpoint, StableCheckpoint},
    events::{
        CheckpointEvent, Event, ExecutionDivergenceEvent, FallingBehindEvent, StableCheckpointEvent,
    },
    persistence::paths,
    quorum::{CheckpointCollector, Collector},
    stack::Stack,
    state::{ProtocolContext, ReplicaState},
    types::{
        data_types::{CryptoHash, SequenceNumber},
        signed_messages::Signed,
    },
};

pub(crate) struct CheckpointManager {
    /// The latest checkpoint this replica applied. Starts at the genesis checkpoint.
    stable: StableCheckpoint,

    /// Votes for checkpoints above `stable`, per sequence number.
    collectors: BTreeMap<SequenceNumber, CheckpointCollector>,

    /// This replica's state digest at every checkpoint above `stable` that it has executed up to.
    own_digests: BTreeMap<SequenceNumber, CryptoHash>,

    /// A stable checkpoint for a sequence number this replica has not executed yet.
    pending: Option<StableCheckpoint>,
}

impl CheckpointManager {
    pub(crate) fn new() -> Self {
        Self {
            stable: StableCheckpoint::genesis(),
            collectors: BTreeMap::new(),
            own_digests: BTreeMap::new(),
            pending: None,
        }
    }

    pub(crate) fn stable(&self) -> &StableCheckpoint {
        &self.stable
    }

    /// Resume from a stable checkpoint read back from storage.
    pub(crate) fn restore(&mut self, stable: StableCheckpoint) {
        self.collectors = self.collectors.split_off(&stable.seq.next());
        self.own_digests = self.own_digests.split_off(&stable.seq.next());
        self.stable = stable;
    }

    /// Broadcast this replica's vote for the state digest it computed after executing `seq`.
    ///
    /// Returns whether the low watermark advanced.
    pub(crate) fn record_own<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        seq: SequenceNumber,
        state_digest: CryptoHash,
    ) -> Result<bool, PbftError> {
        if seq <= self.stable.seq {
            return Ok(false);
        }
        self.own_digests.insert(seq, state_digest);

        let vote = ctx.sign(Checkpoint {
            seq,
            state_digest,
            replica: ctx.me(),
        })?;
        ctx.broadcast(vote.clone());
        ctx.publish(Event::Checkpoint(CheckpointEvent {
            timestamp: SystemTime::now(),
            checkpoint: vote.message.clone(),
        }));

        let mut advanced = self.collect(ctx, state, vote)?;

        // The cluster may have stabilized a checkpoint before this replica executed up to it.
        if let Some(pending) = self.pending.take() {
            if pending.seq <= state.last_executed {
                advanced |= self.on_stable(ctx, state, pending)?;
            } else {
                self.pending = Some(pending);
            }
        }
        Ok(advanced)
    }

    /// Collect another replica's checkpoint vote.
    ///
    /// Votes at or below the last stable checkpoint are ignored, so replaying the votes that made a
    /// checkpoint stable does not change anything. Returns whether the low watermark advanced.
    ///
    /// # Preconditions
    ///
    /// The vote is authenticated.
    pub(crate) fn on_checkpoint<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        vote: Signed<Checkpoint>,
    ) -> Result<bool, PbftError> {
        let seq = vote.message.seq;
        if seq <= self.stable.seq {
            return Ok(false);
        }
        if seq.int() % ctx.config.checkpoint_period != 0
            || seq > state.high_watermark(ctx.config.log_window)
        {
            log::debug!("dropping checkpoint vote for {} from {}", seq, vote.signer());
            return Ok(false);
        }
        self.collect(ctx, state, vote)
    }

    fn collect<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        vote: Signed<Checkpoint>,
    ) -> Result<bool, PbftError> {
        let seq = vote.message.seq;
        let params = *ctx.params();
        let collector = self
            .collectors
            .entry(seq)
            .or_insert_with(|| CheckpointCollector::new(&params, seq));
        match collector.collect(vote.signer(), vote) {
            Some(stable) => self.on_stable(ctx, state, stable),
            None => Ok(false),
        }
    }

    /// Act on a checkpoint that is known to be stable, either because this replica collected a quorum of
    /// votes for it, or because it was proven in a valid NewView.
    ///
    /// If this replica has executed up to the checkpoint, the checkpoint is applied: the low watermark
    /// advances to it and the log is garbage collected. Otherwise the checkpoint is kept until the replica
    /// catches up. Returns whether the low watermark advanced.
    ///
    /// # Errors
    ///
    /// [`PbftError::ExecutionDivergence`] if this replica's own state digest at the checkpoint differs from
    /// the quorum's.
    pub(crate) fn on_stable<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        stable: StableCheckpoint,
    ) -> Result<bool, PbftError> {
        if stable.seq <= self.stable.seq {
            return Ok(false);
        }

        if let Some(local) = self.own_digests.get(&stable.seq).copied() {
            if local != stable.state_digest {
                log::error!(
                    "state digest at {} diverged from the quorum's, halting",
                    stable.seq
                );
                ctx.publish(Event::ExecutionDivergence(ExecutionDivergenceEvent {
                    timestamp: SystemTime::now(),
                    seq: stable.seq,
                    local,
                    quorum: stable.state_digest,
                }));
                return Err(PbftError::ExecutionDivergence {
                    seq: stable.seq,
                    local,
                    quorum: stable.state_digest,
                });
            }
        }

        if stable.seq > state.last_executed {
            let newer = self
                .pending
                .as_ref()
                .map_or(true, |pending| pending.seq < stable.seq);
            if newer {
                log::warn!(
                    "checkpoint {} is stable but only {} is executed",
                    stable.seq,
                    state.last_executed
                );
                ctx.publish(Event::FallingBehind(FallingBehindEvent {
                    timestamp: SystemTime::now(),
                    stable: stable.seq,
                    last_executed: state.last_executed,
                }));
                self.pending = Some(stable);
            }
            return Ok(false);
        }

        self.apply(ctx, state, stable);
        Ok(true)
    }

    fn apply<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        stable: StableCheckpoint,
    ) {
        let seq = stable.seq;
        state.low_watermark = state.low_watermark.max(seq);
        state.log.garbage_collect(seq, ctx.config.log_window);

        // Votes at or below the new stable checkpoint, matching or not, are superseded.
        self.collectors = self.collectors.split_off(&seq.next());
        self.own_digests = self.own_digests.split_off(&seq.next());
        if self.pending.as_ref().is_some_and(|pending| pending.seq <= seq) {
            self.pending = None;
        }

        ctx.publish(Event::StableCheckpoint(StableCheckpointEvent {
            timestamp: SystemTime::now(),
            seq,
            state_digest: stable.state_digest,
        }));
        ctx.persist(&paths::STABLE_CHECKPOINT, &stable);
        self.stable = stable;
    }
}
