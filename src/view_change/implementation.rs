/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-driven implementation of the view-change subprotocol.
//!
//! Main type: [`ViewChangeController`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    time::{Instant, SystemTime},
};

use crate::{
    adapter::PbftError,
    checkpoint::messages::StableCheckpoint,
    events::{
        Event, InstallViewEvent, NewViewEvent, RejectNewViewEvent, StartViewChangeEvent,
        ViewChangeStalledEvent,
    },
    persistence::paths,
    quorum::ViewChangeCollectors,
    replication::messages::PrePrepare,
    stack::Stack,
    state::{ProtocolContext, ReplicaState, Status},
    types::{
        data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
        signed_messages::Signed,
    },
    view_change::messages::{NewView, PreparedCertificate, ViewChange},
};

/// Drives a replica from suspecting the primary of its view to installing a new view.
///
/// # Usage
///
/// The [`Pbft`](crate::adapter::Pbft) adapter calls:
/// 1. [`start_view_change`](Self::start_view_change) when a request deadline or the view-change deadline
///    expires, or when the primary is caught equivocating.
/// 2. [`on_view_change`](Self::on_view_change) and [`on_new_view`](Self::on_new_view) for authenticated
///    messages.
///
/// Each method returns [`Installed`] if it caused the replica to install a new view. The adapter then
/// adopts the stable checkpoint proven by the NewView and hands the NewView's PrePrepares to
/// [`Replication::enter_view`](crate::replication::implementation::Replication::enter_view).
pub(crate) struct ViewChangeController {
    /// Valid view changes received for views above the current view.
    collectors: ViewChangeCollectors,

    /// The view change this replica broadcast for its current target.
    own: Option<Signed<ViewChange>>,

    /// The NewView that installed the current view.
    last_new_view: Option<Signed<NewView>>,
}

impl ViewChangeController {
    pub(crate) fn new() -> Self {
        Self {
            collectors: ViewChangeCollectors::new(),
            own: None,
            last_new_view: None,
        }
    }

    /// Stop participating in the current view, and broadcast a view change for `target`.
    ///
    /// Does nothing if the replica is already in `target` or a higher view, or already moving to one.
    pub(crate) fn start_view_change<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        stable: &StableCheckpoint,
        target: ViewNumber,
        now: Instant,
    ) -> Result<Option<Installed>, PbftError> {
        if target <= current_target(state) {
            return Ok(None);
        }

        // 1. Vouch for the last stable checkpoint and for everything prepared above it.
        let view_change = ctx.sign(ViewChange {
            new_view: target,
            last_stable: stable.seq,
            last_stable_digest: stable.state_digest,
            checkpoint_proof: stable.proof.clone(),
            prepared: state.log.prepared_certificates(stable.seq, ctx.params()),
            replica: ctx.me(),
        })?;

        // 2. Stop taking part in the current view.
        state.status = Status::ViewChanging { target };
        state.timers.clear_requests();

        // 3. Broadcast the view change, and wait for a NewView.
        ctx.broadcast(view_change.clone());
        self.own = Some(view_change.clone());
        let timeout = state.timers.arm_view_change(
            now,
            ctx.config.view_change_timeout,
            ctx.config.max_backoff_exponent,
        );
        log::info!("starting view change to {}, waiting {:?}", target, timeout);
        ctx.publish(Event::StartViewChange(StartViewChangeEvent {
            timestamp: SystemTime::now(),
            view_change: view_change.message.clone(),
            timeout,
        }));

        let attempts = state.timers.attempt();
        if attempts >= ctx.config.view_change_alert_threshold {
            log::warn!("{} consecutive view changes without a new view", attempts);
            ctx.publish(Event::ViewChangeStalled(ViewChangeStalledEvent {
                timestamp: SystemTime::now(),
                target,
                attempts,
            }));
        }

        self.collectors.collect(ctx.params(), view_change);
        self.try_new_view(ctx, state, target)
    }

    /// Collect another replica's view change.
    ///
    /// A replica that receives valid view changes for views above its own target from `f+1` distinct
    /// replicas joins the smallest of those views, even if its own deadlines have not expired.
    ///
    /// # Preconditions
    ///
    /// The message is authenticated.
    pub(crate) fn on_view_change<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        stable: &StableCheckpoint,
        view_change: Signed<ViewChange>,
        now: Instant,
    ) -> Result<Option<Installed>, PbftError> {
        let new_view = view_change.message.new_view;
        let sender = view_change.signer();

        if new_view <= state.view {
            // The sender missed the NewView for the view this replica is primary of.
            if state.is_normal() && ctx.is_primary(state.view) {
                if let Some(last_new_view) = &self.last_new_view {
                    ctx.unicast(last_new_view.clone(), sender);
                }
            }
            return Ok(None);
        }

        if let Err(err) = validate_view_change(ctx, &view_change.message) {
            log::debug!("dropping view change to {} from {}: {}", new_view, sender, err);
            return Ok(None);
        }
        if !self.collectors.collect(ctx.params(), view_change) {
            log::debug!("dropping view change to {} from {}: superseded", new_view, sender);
            return Ok(None);
        }

        if let Some(join) = self.join_target(ctx, state) {
            log::info!("joining the view change to {}", join);
            return self.start_view_change(ctx, state, stable, join, now);
        }

        match state.status {
            Status::ViewChanging { target } if target == new_view => {
                self.try_new_view(ctx, state, target)
            }
            _ => Ok(None),
        }
    }

    /// Validate a NewView from the primary of a higher view, and install the view if it is valid.
    ///
    /// A NewView that does not validate is reported, and this replica re-broadcasts its own view change
    /// so that the view change can still complete.
    ///
    /// # Preconditions
    ///
    /// The message is authenticated.
    pub(crate) fn on_new_view<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        new_view: Signed<NewView>,
    ) -> Result<Option<Installed>, PbftError> {
        let view = new_view.message.view;
        let origin = new_view.signer();
        if view <= state.view || origin != ctx.primary(view) {
            return Ok(None);
        }

        match validate_new_view(ctx, &new_view.message) {
            Ok(plan) => Ok(Some(self.install(ctx, state, new_view, plan))),
            Err(err) => {
                log::warn!("rejecting NewView for {} from {}: {}", view, origin, err);
                ctx.publish(Event::RejectNewView(RejectNewViewEvent {
                    timestamp: SystemTime::now(),
                    view,
                    origin,
                    reason: err.to_string(),
                }));
                if !state.is_normal() {
                    if let Some(own) = &self.own {
                        ctx.broadcast(own.clone());
                    }
                }
                Ok(None)
            }
        }
    }

    /// Get the smallest view above the replica's current target, if view changes for views above the
    /// target were received from `f+1` distinct replicas.
    fn join_target<S: Stack>(
        &self,
        ctx: &ProtocolContext<S>,
        state: &ReplicaState,
    ) -> Option<ViewNumber> {
        self.collectors
            .join_target(current_target(state), ctx.params().weak())
    }

    /// As the primary of `target`, broadcast a NewView and install `target` once `2f+1` view changes for
    /// it have been collected.
    fn try_new_view<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        target: ViewNumber,
    ) -> Result<Option<Installed>, PbftError> {
        if !ctx.is_primary(target) || state.status != (Status::ViewChanging { target }) {
            return Ok(None);
        }
        let view_changes = match self.collectors.certificate(target) {
            Some(view_changes) => view_changes,
            None => return Ok(None),
        };

        let plan = NewViewPlan::compute(&view_changes);
        let mut pre_prepares = Vec::with_capacity(plan.digests.len());
        for (seq, digest) in &plan.digests {
            pre_prepares.push(ctx.sign(PrePrepare {
                view: target,
                seq: *seq,
                digest: *digest,
                replica: ctx.me(),
            })?);
        }
        let new_view = ctx.sign(NewView {
            view: target,
            view_changes,
            pre_prepares,
            replica: ctx.me(),
        })?;

        ctx.broadcast(new_view.clone());
        ctx.publish(Event::NewView(NewViewEvent {
            timestamp: SystemTime::now(),
            new_view: new_view.message.clone(),
        }));
        Ok(Some(self.install(ctx, state, new_view, plan)))
    }

    fn install<S: Stack>(
        &mut self,
        ctx: &mut ProtocolContext<S>,
        state: &mut ReplicaState,
        new_view: Signed<NewView>,
        plan: NewViewPlan,
    ) -> Installed {
        let view = new_view.message.view;
        state.view = view;
        state.status = Status::Normal;
        state.timers.view_change_completed();

        self.collectors.discard_up_to(view);
        self.own = None;
        let pre_prepares = new_view.message.pre_prepares.clone();
        self.last_new_view = Some(new_view);

        let primary = ctx.primary(view);
        log::info!("installed view {} with primary {}", view, primary);
        ctx.publish(Event::InstallView(InstallViewEvent {
            timestamp: SystemTime::now(),
            view,
            primary,
        }));
        ctx.persist(&paths::VIEW, &view);
        ctx.stack.notify_view_change(view);

        Installed {
            stable: (!plan.stable.is_genesis()).then_some(plan.stable),
            pre_prepares,
            max_seq: plan.max_seq,
        }
    }
}

/// Get the view the replica is in, or is moving to.
fn current_target(state: &ReplicaState) -> ViewNumber {
    match state.status {
        Status::Normal => state.view,
        Status::ViewChanging { target } => target,
    }
}

/// The result of installing a new view, which the adapter must follow up on.
pub(crate) struct Installed {
    /// The latest stable checkpoint proven by the NewView's view changes, unless it is the genesis
    /// checkpoint.
    pub(crate) stable: Option<StableCheckpoint>,

    /// The PrePrepares of the new primary for the sequence numbers carried over from earlier views.
    pub(crate) pre_prepares: Vec<Signed<PrePrepare>>,

    /// The highest sequence number carried over. The new primary assigns sequence numbers above it.
    pub(crate) max_seq: SequenceNumber,
}

/// What a NewView must contain, given the view changes it is based on.
///
/// Let `min_s` be the highest `last_stable` of the view changes and `max_s` the highest sequence number of
/// a prepared certificate in them (or `min_s`, if that is higher). For every sequence number in
/// (`min_s`, `max_s`], the NewView must pre-prepare the digest of the prepared certificate from the
/// highest view, or the null digest if no view change carries a certificate for it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct NewViewPlan {
    pub(crate) stable: StableCheckpoint,
    pub(crate) max_seq: SequenceNumber,
    pub(crate) digests: Vec<(SequenceNumber, CryptoHash)>,
}

impl NewViewPlan {
    pub(crate) fn compute(view_changes: &[Signed<ViewChange>]) -> Self {
        let stable = view_changes
            .iter()
            .max_by_key(|view_change| view_change.message.last_stable)
            .filter(|view_change| view_change.message.last_stable > SequenceNumber::init())
            .map_or_else(StableCheckpoint::genesis, |view_change| StableCheckpoint {
                seq: view_change.message.last_stable,
                state_digest: view_change.message.last_stable_digest,
                proof: view_change.message.checkpoint_proof.clone(),
            });
        let min_seq = stable.seq;

        let mut highest: BTreeMap<SequenceNumber, &PreparedCertificate> = BTreeMap::new();
        for certificate in view_changes
            .iter()
            .flat_map(|view_change| view_change.message.prepared.iter())
            .filter(|certificate| certificate.seq() > min_seq)
        {
            let replace = highest
                .get(&certificate.seq())
                .map_or(true, |current| certificate.view() > current.view());
            if replace {
                highest.insert(certificate.seq(), certificate);
            }
        }

        let max_seq = highest.keys().next_back().copied().unwrap_or(min_seq).max(min_seq);
        let mut digests = Vec::new();
        let mut seq = min_seq.next();
        while seq <= max_seq {
            let digest = highest
                .get(&seq)
                .map_or_else(CryptoHash::null, |certificate| certificate.digest());
            digests.push((seq, digest));
            seq = seq.next();
        }

        Self {
            stable,
            max_seq,
            digests,
        }
    }
}

/// Reasons for a view change or a NewView to be invalid.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProofError {
    CheckpointProof {
        seq: SequenceNumber,
    },
    CertificateOutOfRange {
        seq: SequenceNumber,
    },
    CertificateView {
        seq: SequenceNumber,
        view: ViewNumber,
    },
    DuplicateCertificate {
        seq: SequenceNumber,
    },
    PrePrepare {
        seq: SequenceNumber,
    },
    Prepares {
        seq: SequenceNumber,
    },
    ViewChangeView {
        replica: ReplicaID,
    },
    DuplicateViewChange {
        replica: ReplicaID,
    },
    ViewChangeSignature {
        replica: ReplicaID,
    },
    InvalidViewChange {
        replica: ReplicaID,
        reason: Box<ProofError>,
    },
    TooFewViewChanges {
        count: usize,
    },
    PrePreparesMismatch,
}

impl Display for ProofError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProofError::CheckpointProof { seq } => {
                write!(f, "checkpoint proof for {} has too few valid matching votes", seq)
            }
            ProofError::CertificateOutOfRange { seq } => {
                write!(f, "prepared certificate for {} is outside the checkpoint window", seq)
            }
            ProofError::CertificateView { seq, view } => {
                write!(f, "prepared certificate for {} is from view {}", seq, view)
            }
            ProofError::DuplicateCertificate { seq } => {
                write!(f, "more than one prepared certificate for {}", seq)
            }
            ProofError::PrePrepare { seq } => {
                write!(f, "prepared certificate for {} has an invalid PrePrepare", seq)
            }
            ProofError::Prepares { seq } => {
                write!(f, "prepared certificate for {} has too few valid matching Prepares", seq)
            }
            ProofError::ViewChangeView { replica } => {
                write!(f, "view change from {} is for a different view", replica)
            }
            ProofError::DuplicateViewChange { replica } => {
                write!(f, "more than one view change from {}", replica)
            }
            ProofError::ViewChangeSignature { replica } => {
                write!(f, "view change from {} has an invalid signature", replica)
            }
            ProofError::InvalidViewChange { replica, reason } => {
                write!(f, "view change from {} is invalid: {}", replica, reason)
            }
            ProofError::TooFewViewChanges { count } => {
                write!(f, "only {} valid view changes", count)
            }
            ProofError::PrePreparesMismatch => write!(
                f,
                "PrePrepares differ from the ones the view changes determine"
            ),
        }
    }
}

/// Check the checkpoint proof and the prepared certificates carried by `view_change`.
///
/// The signature on `view_change` itself is not checked.
pub(crate) fn validate_view_change<S: Stack>(
    ctx: &ProtocolContext<S>,
    view_change: &ViewChange,
) -> Result<(), ProofError> {
    let params = ctx.params();

    // 1. The checkpoint proof holds 2f+1 valid votes from distinct replicas for the claimed checkpoint.
    if view_change.last_stable > SequenceNumber::init() {
        let voters: BTreeSet<ReplicaID> = view_change
            .checkpoint_proof
            .iter()
            .filter(|vote| {
                vote.message.seq == view_change.last_stable
                    && vote.message.state_digest == view_change.last_stable_digest
                    && ctx.verify(vote)
            })
            .map(|vote| vote.signer())
            .collect();
        if voters.len() < params.stable_checkpoint() {
            return Err(ProofError::CheckpointProof {
                seq: view_change.last_stable,
            });
        }
    }

    // 2. Every prepared certificate is inside the window above the checkpoint, from an earlier view, and
    //    backed by the primary of its view and 2f distinct backups.
    let high_watermark = view_change.last_stable + ctx.config.log_window;
    let mut seen = BTreeSet::new();
    for certificate in &view_change.prepared {
        let (seq, view, digest) = (certificate.seq(), certificate.view(), certificate.digest());
        if seq <= view_change.last_stable || seq > high_watermark {
            return Err(ProofError::CertificateOutOfRange { seq });
        }
        if view >= view_change.new_view {
            return Err(ProofError::CertificateView { seq, view });
        }
        if !seen.insert(seq) {
            return Err(ProofError::DuplicateCertificate { seq });
        }

        let primary = ctx.primary(view);
        if certificate.pre_prepare.signer() != primary || !ctx.verify(&certificate.pre_prepare) {
            return Err(ProofError::PrePrepare { seq });
        }
        let backups: BTreeSet<ReplicaID> = certificate
            .prepares
            .iter()
            .filter(|prepare| {
                prepare.message.view == view
                    && prepare.message.seq == seq
                    && prepare.message.digest == digest
                    && prepare.signer() != primary
                    && ctx.verify(prepare)
            })
            .map(|prepare| prepare.signer())
            .collect();
        if backups.len() < params.prepared() {
            return Err(ProofError::Prepares { seq });
        }
    }
    Ok(())
}

/// Check that `new_view` is backed by `2f+1` valid view changes for its view, and that its PrePrepares are
/// exactly the ones those view changes determine.
fn validate_new_view<S: Stack>(
    ctx: &ProtocolContext<S>,
    new_view: &NewView,
) -> Result<NewViewPlan, ProofError> {
    let mut senders = BTreeSet::new();
    for view_change in &new_view.view_changes {
        let replica = view_change.signer();
        if view_change.message.new_view != new_view.view {
            return Err(ProofError::ViewChangeView { replica });
        }
        if !senders.insert(replica) {
            return Err(ProofError::DuplicateViewChange { replica });
        }
        if !ctx.verify(view_change) {
            return Err(ProofError::ViewChangeSignature { replica });
        }
        validate_view_change(ctx, &view_change.message).map_err(|reason| {
            ProofError::InvalidViewChange {
                replica,
                reason: Box::new(reason),
            }
        })?;
    }
    if senders.len() < ctx.params().view_change() {
        return Err(ProofError::TooFewViewChanges {
            count: senders.len(),
        });
    }

    let plan = NewViewPlan::compute(&new_view.view_changes);
    if new_view.pre_prepares.len() != plan.digests.len() {
        return Err(ProofError::PrePreparesMismatch);
    }
    for (pre_prepare, (seq, digest)) in new_view.pre_prepares.iter().zip(&plan.digests) {
        let expected = PrePrepare {
            view: new_view.view,
            seq: *seq,
            digest: *digest,
            replica: new_view.replica,
        };
        if pre_prepare.message != expected || !ctx.verify(pre_prepare) {
            return Err(ProofError::PrePreparesMismatch);
        }
    }
    Ok(plan)
}
