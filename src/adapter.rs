/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The protocol adapter: the single entry point through which requests, messages and ticks reach the
//! replication core.
//!
//! ## Lifecycle
//!
//! A [`Pbft`] value moves through the following states:
//!
//! ```text
//! Uninitialized --initialize()--> Active --close()--> Closed
//!                                   |
//!                                   +--execution divergence--> Halted --close()--> Closed
//! ```
//!
//! 1. **Uninitialized**: the replica does not yet know its own ID or the size of its cluster. Requests
//!    and messages passed to it are queued in arrival order.
//! 2. **Active**: [`initialize`](Pbft::initialize) blocked on [`Stack::await_membership`], checked the
//!    membership against the [`Configuration`], restored the [persisted](crate::persistence) protocol
//!    state, and replayed the queued inputs. Inputs are processed one at a time, to completion.
//! 3. **Halted**: the replica's state digest at a stable checkpoint diverged from the quorum's. All
//!    further inputs are refused with [`PbftError::Halted`].
//! 4. **Closed**: [`close`](Pbft::close) cancelled all deadlines and released the log. All further inputs
//!    are refused with [`PbftError::Closed`].
//!
//! ## Message admission
//!
//! A received message is decoded and authenticated before it touches protocol state. Messages that do
//! not decode, whose signer is not the replica that delivered them, or whose signature does not verify
//! are dropped. Three-phase agreement messages are then routed by view and sequence number:
//! - Older view, or sequence number at or below the low watermark: dropped.
//! - Future view, or sequence number above the high watermark: [buffered](crate::networking::buffer).
//! - Current view while changing views: dropped.
//! - Otherwise: processed.

use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    mem,
    sync::mpsc::Sender,
    time::{Instant, SystemTime},
};

use crate::{
    checkpoint::implementation::CheckpointManager,
    events::{Event, RequestTimeoutEvent},
    logging::first_seven_base64_chars,
    networking::messages::Message,
    persistence::PersistedState,
    quorum::QuorumParams,
    replica::{Configuration, ConfigurationError},
    replication::{
        implementation::{Replication, ReplicationOutcome, Suspicion},
        messages::Request,
    },
    stack::{Stack, StackError},
    state::{ProtocolConfiguration, ProtocolContext, ReplicaState},
    types::data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
    view_change::implementation::{Installed, ViewChangeController},
};

pub use crate::state::Status;

/// An input to the replica, as queued before initialization or by the algorithm thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Input {
    /// A client transaction submitted to this replica.
    Request(Vec<u8>),

    /// A wire-encoded message delivered by the stack on behalf of `sender`.
    Message { raw: Vec<u8>, sender: ReplicaID },
}

impl Input {
    fn size(&self) -> u64 {
        match self {
            Input::Request(payload) => payload.len() as u64,
            Input::Message { raw, .. } => raw.len() as u64,
        }
    }
}

/// Where a [`Pbft`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaStatus {
    Uninitialized,
    Active(Status),
    Halted,
    Closed,
}

/// A PBFT replica driven through explicit calls.
///
/// # Usage
///
/// ```ignore
/// let mut pbft = Pbft::new(stack, configuration, None)?;
/// pbft.initialize()?;
///
/// pbft.request(b"tx1".to_vec())?;
/// pbft.receive(raw, sender)?;
/// pbft.tick(Instant::now())?;
///
/// pbft.close();
/// ```
///
/// [`ReplicaSpec`](crate::replica::ReplicaSpec) runs a `Pbft` on a dedicated thread instead.
pub struct Pbft<S: Stack> {
    configuration: Configuration,
    event_publisher: Option<Sender<Event>>,
    lifecycle: Lifecycle<S>,
}

enum Lifecycle<S: Stack> {
    Uninitialized {
        stack: S,
        pending: VecDeque<Input>,
        pending_size: u64,
    },
    Active(Box<Core<S>>),
    Halted(Box<Core<S>>),
    Closed,
}

impl<S: Stack> Pbft<S> {
    /// Create an uninitialized replica.
    ///
    /// `event_publisher` receives every [event](crate::events) the replica publishes.
    ///
    /// # Errors
    ///
    /// Returns [`PbftError::Configuration`] if `configuration` is not [valid](Configuration::validate).
    pub fn new(
        stack: S,
        configuration: Configuration,
        event_publisher: Option<Sender<Event>>,
    ) -> Result<Self, PbftError> {
        configuration.validate()?;
        Ok(Self {
            configuration,
            event_publisher,
            lifecycle: Lifecycle::Uninitialized {
                stack,
                pending: VecDeque::new(),
                pending_size: 0,
            },
        })
    }

    /// Block until the stack reports the replica's membership, then start processing inputs, beginning
    /// with the ones queued so far.
    ///
    /// If the stack holds [protocol state](crate::persistence) stored before a restart, the replica
    /// resumes from the stored view, stable checkpoint and execution position.
    ///
    /// Calling `initialize` on an active replica does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`PbftError::Configuration`] if the reported membership does not match the configured
    /// cluster, and [`PbftError::Stack`] if the stored protocol state cannot be read. The replica then
    /// stays uninitialized, keeping its queued inputs.
    pub fn initialize(&mut self) -> Result<(), PbftError> {
        let (mut stack, pending) = match mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
            Lifecycle::Uninitialized { stack, pending, .. } => (stack, pending),
            other => {
                let result = match other {
                    Lifecycle::Halted(_) => Err(PbftError::Halted),
                    Lifecycle::Closed => Err(PbftError::Closed),
                    _ => Ok(()),
                };
                self.lifecycle = other;
                return result;
            }
        };

        let membership = stack.await_membership();
        let checked = if membership.replicas != self.configuration.replica_count {
            Err(ConfigurationError::MembershipMismatch {
                configured: self.configuration.replica_count,
                reported: membership.replicas,
            })
        } else if membership.me.int() >= membership.replicas {
            Err(ConfigurationError::UnknownSelf {
                me: membership.me,
                replicas: membership.replicas,
            })
        } else {
            QuorumParams::new(
                self.configuration.replica_count,
                self.configuration.fault_tolerance,
            )
        };
        let params = match checked {
            Ok(params) => params,
            Err(err) => {
                let pending_size = pending.iter().map(Input::size).sum();
                self.lifecycle = Lifecycle::Uninitialized {
                    stack,
                    pending,
                    pending_size,
                };
                return Err(err.into());
            }
        };

        let persisted = match PersistedState::read(&stack) {
            Ok(persisted) => persisted,
            Err(err) => {
                let pending_size = pending.iter().map(Input::size).sum();
                self.lifecycle = Lifecycle::Uninitialized {
                    stack,
                    pending,
                    pending_size,
                };
                return Err(err.into());
            }
        };

        let config = ProtocolConfiguration {
            me: membership.me,
            params,
            checkpoint_period: self.configuration.checkpoint_period,
            log_window: self.configuration.log_window,
            request_timeout: self.configuration.request_timeout,
            view_change_timeout: self.configuration.view_change_timeout,
            max_backoff_exponent: self.configuration.max_backoff_exponent,
            view_change_alert_threshold: self.configuration.view_change_alert_threshold,
            confidentiality: self.configuration.confidentiality.clone(),
        };
        log::info!(
            "replica {} active in a cluster of {} tolerating {} faults, encrypted payloads: {}",
            membership.me,
            params.n(),
            params.f(),
            config.confidentiality.is_encrypted()
        );
        let mut core = Core {
            ctx: ProtocolContext {
                stack,
                config,
                event_publisher: self.event_publisher.clone(),
            },
            state: ReplicaState::new(self.configuration.msg_buffer_capacity),
            replication: Replication::new(),
            checkpoints: CheckpointManager::new(),
            view_change: ViewChangeController::new(),
            last_request_timestamp: 0,
        };
        if !persisted.is_empty() {
            core.restore(persisted);
        }
        self.lifecycle = Lifecycle::Active(Box::new(core));

        for input in pending {
            if let Err(err) = self.handle(input) {
                if err.is_fatal() {
                    return Err(err);
                }
                log::debug!("queued input failed: {}", err);
            }
        }
        Ok(())
    }

    /// Process an [`Input`].
    pub fn handle(&mut self, input: Input) -> Result<(), PbftError> {
        match input {
            Input::Request(payload) => self.request(payload),
            Input::Message { raw, sender } => self.receive(raw, sender),
        }
    }

    /// Submit a client transaction.
    ///
    /// The transaction is wrapped in a [`Request`] signed by this replica and broadcast, so that every
    /// replica starts a deadline for it and the primary orders it.
    pub fn request(&mut self, payload: Vec<u8>) -> Result<(), PbftError> {
        let result = match &mut self.lifecycle {
            Lifecycle::Active(core) => core.request(payload, Instant::now()),
            _ => return self.defer(Input::Request(payload)),
        };
        self.settle(result)
    }

    /// Process a wire-encoded message that the stack received from `sender`.
    pub fn receive(&mut self, raw: Vec<u8>, sender: ReplicaID) -> Result<(), PbftError> {
        let result = match &mut self.lifecycle {
            Lifecycle::Active(core) => core.receive(raw, sender, Instant::now()),
            _ => return self.defer(Input::Message { raw, sender }),
        };
        self.settle(result)
    }

    /// Fire every deadline that expired at or before `now`.
    pub fn tick(&mut self, now: Instant) -> Result<(), PbftError> {
        let result = match &mut self.lifecycle {
            Lifecycle::Uninitialized { .. } => return Ok(()),
            Lifecycle::Active(core) => core.tick(now),
            Lifecycle::Halted(_) => return Err(PbftError::Halted),
            Lifecycle::Closed => return Err(PbftError::Closed),
        };
        self.settle(result)
    }

    /// Cancel every deadline and release the log. Closing a closed replica does nothing.
    pub fn close(&mut self) {
        match mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
            Lifecycle::Active(mut core) | Lifecycle::Halted(mut core) => {
                core.state.clear();
                log::info!("replica {} closed", core.ctx.me());
            }
            Lifecycle::Uninitialized { .. } | Lifecycle::Closed => (),
        }
    }

    pub fn status(&self) -> ReplicaStatus {
        match &self.lifecycle {
            Lifecycle::Uninitialized { .. } => ReplicaStatus::Uninitialized,
            Lifecycle::Active(core) => ReplicaStatus::Active(core.state.status),
            Lifecycle::Halted(_) => ReplicaStatus::Halted,
            Lifecycle::Closed => ReplicaStatus::Closed,
        }
    }

    /// Get the last view this replica installed.
    pub fn view(&self) -> Option<ViewNumber> {
        self.core().map(|core| core.state.view)
    }

    /// Get the sequence number of the last stable checkpoint.
    pub fn low_watermark(&self) -> Option<SequenceNumber> {
        self.core().map(|core| core.state.low_watermark)
    }

    /// Get the sequence number of the last executed request.
    pub fn last_executed(&self) -> Option<SequenceNumber> {
        self.core().map(|core| core.state.last_executed)
    }

    /// Get the stack the replica calls into.
    pub fn stack(&self) -> Option<&S> {
        match &self.lifecycle {
            Lifecycle::Uninitialized { stack, .. } => Some(stack),
            Lifecycle::Active(core) | Lifecycle::Halted(core) => Some(&core.ctx.stack),
            Lifecycle::Closed => None,
        }
    }

    fn core(&self) -> Option<&Core<S>> {
        match &self.lifecycle {
            Lifecycle::Active(core) | Lifecycle::Halted(core) => Some(core),
            Lifecycle::Uninitialized { .. } | Lifecycle::Closed => None,
        }
    }

    /// Queue `input` if the replica is uninitialized, or refuse it if the replica is halted or closed.
    fn defer(&mut self, input: Input) -> Result<(), PbftError> {
        match &mut self.lifecycle {
            Lifecycle::Uninitialized {
                pending,
                pending_size,
                ..
            } => {
                let size = input.size();
                if *pending_size + size > self.configuration.msg_buffer_capacity.int() {
                    log::debug!("dropping input received before initialization: queue is full");
                } else {
                    *pending_size += size;
                    pending.push_back(input);
                }
                Ok(())
            }
            Lifecycle::Active(_) => self.handle(input),
            Lifecycle::Halted(_) => Err(PbftError::Halted),
            Lifecycle::Closed => Err(PbftError::Closed),
        }
    }

    /// Halt the replica if `result` is a fatal error.
    fn settle(&mut self, result: Result<(), PbftError>) -> Result<(), PbftError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.lifecycle = match mem::replace(&mut self.lifecycle, Lifecycle::Closed) {
                    Lifecycle::Active(core) => {
                        log::error!("replica {} halted: {}", core.ctx.me(), err);
                        Lifecycle::Halted(core)
                    }
                    other => other,
                };
            }
        }
        result
    }
}

/// The parts of an active replica, owned exclusively by its single processing path.
struct Core<S: Stack> {
    ctx: ProtocolContext<S>,
    state: ReplicaState,
    replication: Replication,
    checkpoints: CheckpointManager,
    view_change: ViewChangeController,

    /// Timestamp of the last request submitted to this replica. Timestamps of later requests are
    /// strictly greater.
    last_request_timestamp: u64,
}

impl<S: Stack> Core<S> {
    /// Resume from protocol state stored before a restart.
    fn restore(&mut self, persisted: PersistedState) {
        if let Some(view) = persisted.view {
            self.state.view = view;
        }
        if let Some(stable) = persisted.stable {
            self.state.low_watermark = stable.seq;
            self.state.last_executed = self.state.last_executed.max(stable.seq);
            self.checkpoints.restore(stable);
        }
        if let Some(last_executed) = persisted.last_executed {
            self.state.last_executed = self.state.last_executed.max(last_executed);
        }
        if let Some((view, seq)) = persisted.last_assigned {
            if view == self.state.view {
                self.replication.restore_assigned(seq);
            }
        }
        log::info!(
            "replica {} restored view {}, low watermark {}, last executed {}",
            self.ctx.me(),
            self.state.view,
            self.state.low_watermark,
            self.state.last_executed
        );
    }

    fn request(&mut self, payload: Vec<u8>, now: Instant) -> Result<(), PbftError> {
        let mut request = Request::new(payload, self.ctx.me());
        request.timestamp = request.timestamp.max(self.last_request_timestamp + 1);
        self.last_request_timestamp = request.timestamp;
        let request = self.ctx.sign(request)?;
        self.ctx.broadcast(request.clone());
        let outcome = self
            .replication
            .on_request(&mut self.ctx, &mut self.state, request, now)?;
        self.absorb(outcome, now)
    }

    fn receive(&mut self, raw: Vec<u8>, sender: ReplicaID, now: Instant) -> Result<(), PbftError> {
        let msg = match Message::decode(&raw) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("dropping undecodable message from {}: {}", sender, err);
                return Ok(());
            }
        };
        if msg.signer() != sender || sender == self.ctx.me() || !self.ctx.params().contains(sender) {
            log::debug!("dropping {} signed by {} from {}", msg.kind(), msg.signer(), sender);
            return Ok(());
        }
        if !self.authenticate(&msg) {
            log::debug!("dropping {} from {}: bad signature", msg.kind(), sender);
            return Ok(());
        }
        self.dispatch(sender, msg, now)
    }

    fn authenticate(&self, msg: &Message) -> bool {
        match msg {
            Message::Request(request) => self.ctx.verify(request),
            Message::PrePrepare(pre_prepare) => self.ctx.verify(pre_prepare),
            Message::Prepare(prepare) => self.ctx.verify(prepare),
            Message::Commit(commit) => self.ctx.verify(commit),
            Message::Checkpoint(checkpoint) => self.ctx.verify(checkpoint),
            Message::ViewChange(view_change) => self.ctx.verify(view_change),
            Message::NewView(new_view) => self.ctx.verify(new_view),
        }
    }

    /// # Preconditions
    ///
    /// `msg` is authenticated.
    fn dispatch(&mut self, sender: ReplicaID, msg: Message, now: Instant) -> Result<(), PbftError> {
        match msg {
            Message::Request(request) => {
                let outcome =
                    self.replication
                        .on_request(&mut self.ctx, &mut self.state, request, now)?;
                self.absorb(outcome, now)
            }
            Message::PrePrepare(_) | Message::Prepare(_) | Message::Commit(_) => {
                self.on_agreement(sender, msg, now)
            }
            Message::Checkpoint(vote) => {
                if self
                    .checkpoints
                    .on_checkpoint(&mut self.ctx, &mut self.state, vote)?
                {
                    self.after_stable(now)?;
                }
                Ok(())
            }
            Message::ViewChange(view_change) => {
                let installed = self.view_change.on_view_change(
                    &mut self.ctx,
                    &mut self.state,
                    self.checkpoints.stable(),
                    view_change,
                    now,
                )?;
                self.after_install(installed, now)
            }
            Message::NewView(new_view) => {
                let installed =
                    self.view_change
                        .on_new_view(&mut self.ctx, &mut self.state, new_view)?;
                self.after_install(installed, now)
            }
        }
    }

    /// Route an authenticated PrePrepare, Prepare or Commit by its view and sequence number.
    fn on_agreement(&mut self, sender: ReplicaID, msg: Message, now: Instant) -> Result<(), PbftError> {
        let (view, seq) = match (msg.view(), msg.seq()) {
            (Some(view), Some(seq)) => (view, seq),
            _ => return Ok(()),
        };
        let log_window = self.ctx.config.log_window;

        if view < self.state.view || seq <= self.state.low_watermark {
            log::debug!("dropping stale {} for view {}, seq {}", msg.kind(), view, seq);
            return Ok(());
        }
        if view > self.state.view || seq > self.state.high_watermark(log_window) {
            let kind = msg.kind();
            if !self.state.buffer.insert(sender, msg) {
                log::debug!("message buffer is full, dropping {} for view {}, seq {}", kind, view, seq);
            }
            return Ok(());
        }
        if !self.state.is_normal() {
            log::debug!("dropping {} for view {} while changing views", msg.kind(), view);
            return Ok(());
        }

        let outcome = match msg {
            Message::PrePrepare(pre_prepare) => {
                self.replication
                    .on_pre_prepare(&mut self.ctx, &mut self.state, pre_prepare)?
            }
            Message::Prepare(prepare) => {
                self.replication
                    .on_prepare(&mut self.ctx, &mut self.state, prepare)?
            }
            Message::Commit(commit) => {
                self.replication
                    .on_commit(&mut self.ctx, &mut self.state, commit)?
            }
            _ => return Ok(()),
        };
        self.absorb(outcome, now)
    }

    fn tick(&mut self, now: Instant) -> Result<(), PbftError> {
        let target = match self.state.status {
            Status::Normal => {
                let expired = self.state.timers.expired_requests(now);
                if expired.is_empty() {
                    return Ok(());
                }
                for digest in &expired {
                    self.on_request_timeout(*digest);
                }
                self.state.view + 1
            }
            Status::ViewChanging { target } => {
                if !self.state.timers.view_change_expired(now) {
                    return Ok(());
                }
                log::warn!("view change to {} timed out", target);
                target + 1
            }
        };
        let installed = self.view_change.start_view_change(
            &mut self.ctx,
            &mut self.state,
            self.checkpoints.stable(),
            target,
            now,
        )?;
        self.after_install(installed, now)
    }

    fn on_request_timeout(&mut self, digest: CryptoHash) {
        log::warn!(
            "request {} did not commit in view {}",
            first_seven_base64_chars(&digest.bytes()),
            self.state.view
        );
        self.ctx.publish(Event::RequestTimeout(RequestTimeoutEvent {
            timestamp: SystemTime::now(),
            view: self.state.view,
            digest,
        }));
    }

    /// Follow up on a [`ReplicationOutcome`]: vote on the checkpoints reached, and start a view change if
    /// the primary was caught misbehaving.
    fn absorb(&mut self, outcome: ReplicationOutcome, now: Instant) -> Result<(), PbftError> {
        let mut advanced = false;
        for (seq, state_digest) in outcome.checkpoints {
            advanced |= self
                .checkpoints
                .record_own(&mut self.ctx, &mut self.state, seq, state_digest)?;
        }
        if advanced {
            self.after_stable(now)?;
        }

        if let Some(Suspicion::Equivocation { view, .. }) = outcome.suspicion {
            let installed = self.view_change.start_view_change(
                &mut self.ctx,
                &mut self.state,
                self.checkpoints.stable(),
                view + 1,
                now,
            )?;
            self.after_install(installed, now)?;
        }
        Ok(())
    }

    /// The watermark window advanced: assign sequence numbers that just became available, and process
    /// buffered messages that moved inside the window.
    fn after_stable(&mut self, now: Instant) -> Result<(), PbftError> {
        let outcome = self
            .replication
            .assign_pending(&mut self.ctx, &mut self.state)?;
        self.absorb(outcome, now)?;
        self.drain_buffer(now)
    }

    /// A new view was installed: adopt the stable checkpoint it proves, re-run three-phase agreement for
    /// the PrePrepares it carries, and process buffered messages for it.
    fn after_install(&mut self, installed: Option<Installed>, now: Instant) -> Result<(), PbftError> {
        let installed = match installed {
            Some(installed) => installed,
            None => return Ok(()),
        };
        if let Some(stable) = installed.stable {
            self.checkpoints
                .on_stable(&mut self.ctx, &mut self.state, stable)?;
        }
        let outcome = self.replication.enter_view(
            &mut self.ctx,
            &mut self.state,
            installed.pre_prepares,
            installed.max_seq,
            now,
        )?;
        self.absorb(outcome, now)?;
        self.drain_buffer(now)
    }

    fn drain_buffer(&mut self, now: Instant) -> Result<(), PbftError> {
        if !self.state.is_normal() {
            return Ok(());
        }
        let high_watermark = self.state.high_watermark(self.ctx.config.log_window);
        let ready = self
            .state
            .buffer
            .take_ready(self.state.view, self.state.low_watermark, high_watermark);
        for (sender, msg) in ready {
            self.on_agreement(sender, msg, now)?;
        }
        Ok(())
    }
}

/// Enumerates the ways a call into [`Pbft`] can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PbftError {
    /// The replica was closed.
    Closed,

    /// The replica halted after its execution diverged from the cluster's.
    Halted,

    /// The replica's state digest at stable checkpoint `seq` is `local`, while a quorum agreed on
    /// `quorum`.
    ExecutionDivergence {
        seq: SequenceNumber,
        local: CryptoHash,
        quorum: CryptoHash,
    },

    Configuration(ConfigurationError),

    Stack(StackError),
}

impl PbftError {
    /// Check whether the error leaves the replica unable to continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PbftError::ExecutionDivergence { .. })
    }
}

impl From<ConfigurationError> for PbftError {
    fn from(value: ConfigurationError) -> Self {
        PbftError::Configuration(value)
    }
}

impl From<StackError> for PbftError {
    fn from(value: StackError) -> Self {
        PbftError::Stack(value)
    }
}

impl Display for PbftError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PbftError::Closed => write!(f, "replica is closed"),
            PbftError::Halted => write!(f, "replica halted after an execution divergence"),
            PbftError::ExecutionDivergence { seq, local, quorum } => write!(
                f,
                "state digest at {} is {}, but a quorum agreed on {}",
                seq,
                first_seven_base64_chars(&local.bytes()),
                first_seven_base64_chars(&quorum.bytes())
            ),
            PbftError::Configuration(err) => write!(f, "configuration error: {}", err),
            PbftError::Stack(err) => write!(f, "stack error: {}", err),
        }
    }
}
