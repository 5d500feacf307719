/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of three-phase agreement.
//!
//! Main type: [`Replication`].

use std::{
    collections::VecDeque,
    time::{Instant, SystemTime},
};

use crate::{
    adapter::PbftError,
    events::{
        CommitEvent, CommitLocalEvent, EquivocationEvent, Event, ExecuteEvent, ExecutionFailedEvent,
        PrePrepareEvent, PrepareEvent, ReceivePrePrepareEvent, ReceiveRequestEvent,
    },
    logging::first_seven_base64_chars,
    message_log::RequestRecord,
    persistence::paths,
    replication::messages::{Commit, PrePrepare, Prepare, Request},
    stack::Stack,
    state::{ProtocolContext, ReplicaState},
    types::{
        data_types::{CryptoHash, SequenceNumber, ViewNumber},
        signed_messages::Signed,
    },
};

/// A single participant in three-phase agreement.
///
/// # Usage
///
/// The [`Pbft`](crate::adapter::Pbft) adapter calls:
/// 1. [`on_request`](Self::on_request) for every request, whether submitted locally or received.
/// 2. [`on_pre_prepare`](Self::on_pre_prepare), [`on_prepare`](Self::on_prepare) and
///    [`on_commit`](Self::on_commit) for authenticated messages that satisfy the methods'
///    preconditions.
/// 3. [`assign_pending`](Self::assign_pending) whenever the watermark window advances.
/// 4. [`enter_view`](Self::enter_view) once a new view has been installed.
///
/// Every method returns a [`ReplicationOutcome`], which tells the adapter about checkpoints the replica
/// reached while executing, and about primary faults it observed.
pub(crate) struct Replication {
    /// The highest sequence number this replica assigned, or was told to continue from, as primary
    /// of the current view.
    next_sequence: SequenceNumber,

    /// Requests waiting for the primary to assign them a sequence number, oldest first.
    unassigned: VecDeque<CryptoHash>,
}

impl Replication {
    pub(crate) fn new() -> Self {
        Self {
            next_sequence: SequenceNumber::init(),
            unassigned: VecDeque::new(),
        }
    }

    /// Continue assigning sequence numbers after `seq`, which this replica assigned as primary before it
    /// restarted.
    pub(crate) fn restore_assigned(&mut self, seq: SequenceNumber) {
        self.next_sequence = self.next_sequence.max(seq);
    }

    /// Store a new request, and either assign it a sequence number (as primary) or start a deadline for
    /// it to be committed (as backup).
    ///
    /// Requests that are already known, replays of discarded requests, requests that cannot be opened,
    /// and requests that fail [validation](Stack::validate) are dropped.
    pub(crate) fn on_request<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        request: Signed<Request>,
        now: Instant,
    ) -> Result<ReplicationOutcome, PbftError> {
        let digest = request.message.digest();
        if state.log.has_request(&digest) || state.log.is_discarded(&digest, &request.message) {
            return Ok(ReplicationOutcome::default());
        }

        let opened = match ctx.config.confidentiality.open(&request.message.payload) {
            Ok(opened) => opened,
            Err(err) => {
                log::debug!("dropping request {}: {}", first_seven_base64_chars(&digest.bytes()), err);
                return Ok(ReplicationOutcome::default());
            }
        };
        if let Err(err) = ctx.stack.validate(&opened) {
            log::debug!("dropping request {}: {}", first_seven_base64_chars(&digest.bytes()), err);
            return Ok(ReplicationOutcome::default());
        }

        let origin = request.signer();
        state.log.insert_request(
            digest,
            RequestRecord {
                request,
                opened,
                executed_at: None,
            },
        );
        ctx.publish(Event::ReceiveRequest(ReceiveRequestEvent {
            timestamp: SystemTime::now(),
            origin,
            digest,
        }));

        if !state.is_normal() {
            return Ok(ReplicationOutcome::default());
        }
        if ctx.is_primary(state.view) {
            self.unassigned.push_back(digest);
            return self.assign_pending(ctx, state);
        }

        state
            .timers
            .start_request(digest, now, ctx.config.request_timeout);

        // The PrePrepare for this request may have arrived before the request itself.
        match state.log.assigned_seq(state.view, &digest) {
            Some(seq) => self.check_entry(ctx, state, seq),
            None => Ok(ReplicationOutcome::default()),
        }
    }

    /// As primary, assign sequence numbers to waiting requests for as long as the watermark window
    /// allows, and broadcast a `PrePrepare` for each.
    pub(crate) fn assign_pending<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
    ) -> Result<ReplicationOutcome, PbftError> {
        let mut outcome = ReplicationOutcome::default();
        if !state.is_normal() || !ctx.is_primary(state.view) {
            return Ok(outcome);
        }

        self.next_sequence = self.next_sequence.max(state.low_watermark);
        let high_watermark = state.high_watermark(ctx.config.log_window);
        while self.next_sequence < high_watermark {
            let digest = match self.unassigned.pop_front() {
                Some(digest) => digest,
                None => break,
            };
            let assignable = state
                .log
                .request(&digest)
                .is_some_and(|record| record.executed_at.is_none())
                && state.log.assigned_seq(state.view, &digest).is_none();
            if !assignable {
                continue;
            }

            let seq = self.next_sequence.next();
            let pre_prepare = match ctx.sign(PrePrepare {
                view: state.view,
                seq,
                digest,
                replica: ctx.me(),
            }) {
                Ok(pre_prepare) => pre_prepare,
                Err(err) => {
                    self.unassigned.push_front(digest);
                    return Err(err.into());
                }
            };
            self.next_sequence = seq;
            ctx.persist(&paths::LAST_ASSIGNED, &(state.view, seq));
            state.log.entry_mut(seq, state.view).pre_prepare = Some(pre_prepare.clone());
            ctx.broadcast(pre_prepare.clone());
            ctx.publish(Event::PrePrepare(PrePrepareEvent {
                timestamp: SystemTime::now(),
                pre_prepare: pre_prepare.message,
            }));

            outcome.absorb(self.check_entry(ctx, state, seq)?);
        }

        if !self.unassigned.is_empty() {
            log::debug!(
                "{} requests wait for the window above {} to open",
                self.unassigned.len(),
                high_watermark
            );
        }
        Ok(outcome)
    }

    /// Accept the primary's `PrePrepare`, or detect that the primary equivocated.
    ///
    /// # Preconditions
    ///
    /// The message is authenticated, the replica is in the normal status, `pre_prepare.view` is the
    /// current view, and `pre_prepare.seq` is inside the watermark window.
    pub(crate) fn on_pre_prepare<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        pre_prepare: Signed<PrePrepare>,
    ) -> Result<ReplicationOutcome, PbftError> {
        let PrePrepare {
            view, seq, digest, ..
        } = pre_prepare.message;
        let primary = ctx.primary(view);
        if pre_prepare.signer() != primary {
            log::debug!("dropping PrePrepare for {} from non-primary {}", seq, pre_prepare.signer());
            return Ok(ReplicationOutcome::default());
        }
        if digest.is_null() {
            log::debug!("dropping null PrePrepare for {} outside of a NewView", seq);
            return Ok(ReplicationOutcome::default());
        }

        let entry = state.log.entry_mut(seq, view);
        match entry.digest() {
            Some(existing) if existing == digest => return Ok(ReplicationOutcome::default()),
            Some(existing) => {
                log::warn!(
                    "primary {} signed two PrePrepares for view {}, seq {}",
                    primary,
                    view,
                    seq
                );
                ctx.publish(Event::Equivocation(EquivocationEvent {
                    timestamp: SystemTime::now(),
                    view,
                    seq,
                    primary,
                    first: existing,
                    second: digest,
                }));
                return Ok(ReplicationOutcome {
                    checkpoints: Vec::new(),
                    suspicion: Some(Suspicion::Equivocation { view, seq }),
                });
            }
            None => entry.pre_prepare = Some(pre_prepare.clone()),
        }

        ctx.publish(Event::ReceivePrePrepare(ReceivePrePrepareEvent {
            timestamp: SystemTime::now(),
            origin: primary,
            pre_prepare: pre_prepare.message,
        }));
        self.check_entry(ctx, state, seq)
    }

    /// Record a backup's `Prepare`.
    ///
    /// # Preconditions
    ///
    /// Same as [`on_pre_prepare`](Self::on_pre_prepare).
    pub(crate) fn on_prepare<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        prepare: Signed<Prepare>,
    ) -> Result<ReplicationOutcome, PbftError> {
        let (view, seq) = (prepare.message.view, prepare.message.seq);
        if prepare.signer() == ctx.primary(view) {
            return Ok(ReplicationOutcome::default());
        }
        if !state.log.entry_mut(seq, view).add_prepare(prepare) {
            return Ok(ReplicationOutcome::default());
        }
        self.check_entry(ctx, state, seq)
    }

    /// Record a replica's `Commit`.
    ///
    /// # Preconditions
    ///
    /// Same as [`on_pre_prepare`](Self::on_pre_prepare).
    pub(crate) fn on_commit<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        commit: Signed<Commit>,
    ) -> Result<ReplicationOutcome, PbftError> {
        let seq = commit.message.seq;
        if !state.log.entry_mut(seq, commit.message.view).add_commit(commit) {
            return Ok(ReplicationOutcome::default());
        }
        self.check_entry(ctx, state, seq)
    }

    /// Continue the installation of a new view: place the NewView's PrePrepares in the log, and restart
    /// ordering of the requests that are still waiting to be executed.
    ///
    /// `max_seq` is the highest sequence number covered by the NewView. The new primary assigns sequence
    /// numbers after it.
    pub(crate) fn enter_view<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        pre_prepares: Vec<Signed<PrePrepare>>,
        max_seq: SequenceNumber,
        now: Instant,
    ) -> Result<ReplicationOutcome, PbftError> {
        let view = state.view;
        self.unassigned.clear();
        self.next_sequence = max_seq.max(state.low_watermark);
        if ctx.is_primary(view) {
            ctx.persist(&paths::LAST_ASSIGNED, &(view, self.next_sequence));
        }

        let mut reissued = Vec::new();
        for pre_prepare in pre_prepares {
            let seq = pre_prepare.message.seq;
            if seq <= state.low_watermark {
                continue;
            }
            state.log.entry_mut(seq, view).pre_prepare = Some(pre_prepare);
            reissued.push(seq);
        }

        for digest in state.log.unexecuted_requests() {
            if ctx.is_primary(view) {
                if state.log.assigned_seq(view, &digest).is_none() {
                    self.unassigned.push_back(digest);
                }
            } else {
                state
                    .timers
                    .start_request(digest, now, ctx.config.request_timeout);
            }
        }

        let mut outcome = ReplicationOutcome::default();
        for seq in reissued {
            outcome.absorb(self.check_entry(ctx, state, seq)?);
        }
        outcome.absorb(self.assign_pending(ctx, state)?);
        Ok(outcome)
    }

    /// Move the entry at (`seq`, current view) as far along `pre-prepared -> prepared -> committed-local`
    /// as the votes in the log allow, voting along the way, then execute whatever became executable.
    fn check_entry<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        seq: SequenceNumber,
    ) -> Result<ReplicationOutcome, PbftError> {
        let view = state.view;
        let params = *ctx.params();
        let me = ctx.me();

        let (digest, send_prepare) = match state.log.get(seq, view) {
            Some(entry) => match entry.digest() {
                Some(digest) if digest.is_null() || state.log.has_request(&digest) => {
                    (digest, !ctx.is_primary(view) && !entry.sent_prepare)
                }
                // Wait for the PrePrepare, or for the request it refers to.
                _ => return Ok(ReplicationOutcome::default()),
            },
            None => return Ok(ReplicationOutcome::default()),
        };

        // 1. Backups vote for the PrePrepare.
        if send_prepare {
            let prepare = ctx.sign(Prepare {
                view,
                seq,
                digest,
                replica: me,
            })?;
            let entry = state.log.entry_mut(seq, view);
            entry.sent_prepare = true;
            entry.add_prepare(prepare.clone());
            ctx.broadcast(prepare.clone());
            ctx.publish(Event::Prepare(PrepareEvent {
                timestamp: SystemTime::now(),
                prepare: prepare.message,
            }));
        }

        // 2. Once prepared, vote to commit.
        let send_commit = state
            .log
            .get(seq, view)
            .is_some_and(|entry| !entry.sent_commit && entry.is_prepared(&params));
        if send_commit {
            let commit = ctx.sign(Commit {
                view,
                seq,
                digest,
                replica: me,
            })?;
            let entry = state.log.entry_mut(seq, view);
            entry.sent_commit = true;
            entry.add_commit(commit.clone());
            ctx.broadcast(commit.clone());
            ctx.publish(Event::Commit(CommitEvent {
                timestamp: SystemTime::now(),
                commit: commit.message,
            }));
        }

        // 3. Once committed-local, execute.
        let committed = state.log.get(seq, view).is_some_and(|entry| {
            entry.sent_commit && !entry.committed && entry.is_committed_local(&params)
        });
        if !committed {
            return Ok(ReplicationOutcome::default());
        }
        state.log.entry_mut(seq, view).committed = true;
        state.timers.cancel_request(&digest);
        ctx.publish(Event::CommitLocal(CommitLocalEvent {
            timestamp: SystemTime::now(),
            view,
            seq,
            digest,
        }));

        Ok(self.try_execute(ctx, state))
    }

    /// Execute committed requests in sequence order, starting right after the last executed sequence
    /// number, until a sequence number that is not committed-local is reached.
    fn try_execute<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
    ) -> ReplicationOutcome {
        let mut outcome = ReplicationOutcome::default();
        loop {
            let seq = state.last_executed.next();
            let digest = match state.log.committed_digest(seq) {
                Some(digest) => digest,
                None => break,
            };

            let result = if digest.is_null() {
                log::debug!("executing null request at {}", seq);
                ctx.stack.execute_null(seq)
            } else {
                match state.log.request(&digest) {
                    Some(record) if record.executed_at.is_none() => {
                        let result = ctx.stack.execute(seq, &record.opened);
                        state.log.mark_executed(&digest, seq);
                        result
                    }
                    _ if state.log.is_executed(&digest) => {
                        log::debug!("request ordered again at {} was already executed", seq);
                        ctx.stack.execute_null(seq)
                    }
                    _ => break,
                }
            };
            if let Err(error) = result {
                log::warn!("failed to execute request at {}: {}", seq, error);
                ctx.publish(Event::ExecutionFailed(ExecutionFailedEvent {
                    timestamp: SystemTime::now(),
                    seq,
                    digest,
                    error,
                }));
            }

            state.last_executed = seq;
            ctx.persist(&paths::LAST_EXECUTED, &seq);
            ctx.publish(Event::Execute(ExecuteEvent {
                timestamp: SystemTime::now(),
                seq,
                digest,
            }));
            if let Some(checkpoint) = self.exec_done(ctx, seq) {
                outcome.checkpoints.push(checkpoint);
            }
        }
        outcome
    }

    /// Finish the execution of `seq`: every `checkpoint_period` sequence numbers, get the state digest that
    /// the replica should vote on.
    fn exec_done<S: Stack>(
        &self,
        ctx: &mut ProtocolContext<S>,
        seq: SequenceNumber,
    ) -> Option<(SequenceNumber, CryptoHash)> {
        if seq.int() % ctx.config.checkpoint_period != 0 {
            return None;
        }
        match ctx.stack.state_digest(seq) {
            Ok(state_digest) => Some((seq, state_digest)),
            Err(err) => {
                log::warn!("cannot take checkpoint at {}: {}", seq, err);
                None
            }
        }
    }
}

/// What the adapter must follow up on after a call into [`Replication`].
#[derive(Default)]
pub(crate) struct ReplicationOutcome {
    /// Checkpoints reached during execution, with the replica's state digest at each.
    pub(crate) checkpoints: Vec<(SequenceNumber, CryptoHash)>,

    /// Proof that the primary of the current view is faulty.
    pub(crate) suspicion: Option<Suspicion>,
}

impl ReplicationOutcome {
    pub(crate) fn absorb(&mut self, other: ReplicationOutcome) {
        self.checkpoints.extend(other.checkpoints);
        if self.suspicion.is_none() {
            self.suspicion = other.suspicion;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Suspicion {
    Equivocation {
        view: ViewNumber,
        seq: SequenceNumber,
    },
}
