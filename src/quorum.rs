/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Quorum arithmetic and the collectors that turn matching votes into certificates.
//!
//! In a cluster of `N = 3f+1` replicas, any two sets of `2f+1` replicas intersect in at least `f+1`
//! replicas, and therefore in at least one non-faulty replica. Every certificate in the protocol is
//! sized so that it relies on this intersection:
//!
//! | Certificate       | Votes required                                             |
//! |-------------------|------------------------------------------------------------|
//! | Prepared          | PrePrepare + `2f` matching Prepares from distinct backups  |
//! | Committed-local   | Prepared + `2f+1` matching Commits, including our own      |
//! | Stable checkpoint | `2f+1` matching Checkpoint votes                           |
//! | View change       | `2f+1` ViewChange messages for the same view               |
//! | Join-in           | `f+1` ViewChange messages for higher views                 |

use std::collections::BTreeMap;

use crate::{
    checkpoint::messages::{Checkpoint, StableCheckpoint},
    replica::ConfigurationError,
    types::{
        data_types::{ReplicaID, SequenceNumber, ViewNumber},
        signed_messages::Signed,
    },
    view_change::messages::ViewChange,
};

/// Size of the cluster and the number of Byzantine replicas it tolerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuorumParams {
    n: u64,
    f: u64,
}

impl QuorumParams {
    /// Create `QuorumParams` for a cluster of `n` replicas tolerating `f` faults.
    ///
    /// # Errors
    ///
    /// Returns an error unless `n == 3f + 1`.
    pub fn new(n: u64, f: u64) -> Result<Self, ConfigurationError> {
        if f.checked_mul(3).and_then(|three_f| three_f.checked_add(1)) != Some(n) {
            return Err(ConfigurationError::ClusterSize { replicas: n, faults: f });
        }
        Ok(Self { n, f })
    }

    pub const fn n(&self) -> u64 {
        self.n
    }

    pub const fn f(&self) -> u64 {
        self.f
    }

    /// Matching Prepares (excluding the primary) needed on top of a PrePrepare for a request to
    /// be prepared.
    pub const fn prepared(&self) -> usize {
        (2 * self.f) as usize
    }

    /// Matching Commits needed for a prepared request to be committed-local.
    pub const fn committed(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// Matching Checkpoint votes needed for a checkpoint to become stable.
    pub const fn stable_checkpoint(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// ViewChange messages for the same view needed for its primary to install it.
    pub const fn view_change(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// ViewChange messages for higher views that make a replica join a view change.
    pub const fn weak(&self) -> usize {
        (self.f + 1) as usize
    }

    /// Get the primary of `view`.
    pub const fn primary(&self, view: ViewNumber) -> ReplicaID {
        ReplicaID::new(view.int() % self.n)
    }

    /// Check whether `replica` is a member of the cluster.
    pub const fn contains(&self, replica: ReplicaID) -> bool {
        replica.int() < self.n
    }
}

/// Types that progressively combine matching votes to form certificates.
pub(crate) trait Collector {
    /// The vote type that this `Collector` takes in as input.
    type Vote;

    /// The certificate type that this `Collector` returns as output.
    type Certificate;

    /// Collect a `vote` signed by `signer`, returning a certificate if a quorum of matching votes has
    /// been collected.
    ///
    /// Only the first vote of every signer counts. Later votes from the same signer are ignored.
    ///
    /// # Preconditions
    ///
    /// The signature on `vote` has been verified to be from `signer`.
    fn collect(&mut self, signer: ReplicaID, vote: Self::Vote) -> Option<Self::Certificate>;
}

/// Collects [`Checkpoint`] votes for a single sequence number.
pub(crate) struct CheckpointCollector {
    quorum: usize,
    seq: SequenceNumber,
    votes: BTreeMap<ReplicaID, Signed<Checkpoint>>,
}

impl CheckpointCollector {
    pub(crate) fn new(params: &QuorumParams, seq: SequenceNumber) -> Self {
        Self {
            quorum: params.stable_checkpoint(),
            seq,
            votes: BTreeMap::new(),
        }
    }
}

impl Collector for CheckpointCollector {
    type Vote = Signed<Checkpoint>;
    type Certificate = StableCheckpoint;

    fn collect(&mut self, signer: ReplicaID, vote: Self::Vote) -> Option<Self::Certificate> {
        if vote.message.seq != self.seq || vote.signer() != signer {
            return None;
        }
        let state_digest = vote.message.state_digest;
        self.votes.entry(signer).or_insert(vote);

        let proof: Vec<Signed<Checkpoint>> = self
            .votes
            .values()
            .filter(|vote| vote.message.state_digest == state_digest)
            .cloned()
            .collect();
        if proof.len() >= self.quorum {
            Some(StableCheckpoint {
                seq: self.seq,
                state_digest,
                proof,
            })
        } else {
            None
        }
    }
}

/// Collects [`ViewChange`] messages for a single target view.
pub(crate) struct ViewChangeCollector {
    quorum: usize,
    view: ViewNumber,
    view_changes: BTreeMap<ReplicaID, Signed<ViewChange>>,
}

impl ViewChangeCollector {
    pub(crate) fn new(params: &QuorumParams, view: ViewNumber) -> Self {
        Self {
            quorum: params.view_change(),
            view,
            view_changes: BTreeMap::new(),
        }
    }

    /// Get the collected view changes if there is a quorum of them.
    pub(crate) fn certificate(&self) -> Option<Vec<Signed<ViewChange>>> {
        if self.view_changes.len() >= self.quorum {
            Some(self.view_changes.values().cloned().collect())
        } else {
            None
        }
    }
}

impl Collector for ViewChangeCollector {
    type Vote = Signed<ViewChange>;
    type Certificate = Vec<Signed<ViewChange>>;

    fn collect(&mut self, signer: ReplicaID, vote: Self::Vote) -> Option<Self::Certificate> {
        if vote.message.new_view != self.view || vote.signer() != signer {
            return None;
        }
        self.view_changes.entry(signer).or_insert(vote);
        self.certificate()
    }
}

/// The view changes a replica holds for views above its own, one [`ViewChangeCollector`] per view.
///
/// Only the highest view change of every sender is kept: a sender that moves on to a higher view
/// leaves the collector of the lower view, and a view change for a lower view than the one its sender
/// is already counted for is ignored. Every sender is therefore counted in at most one collector, and
/// there are never more collectors than replicas.
#[derive(Default)]
pub(crate) struct ViewChangeCollectors {
    collectors: BTreeMap<ViewNumber, ViewChangeCollector>,
    latest: BTreeMap<ReplicaID, ViewNumber>,
}

impl ViewChangeCollectors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Collect `view_change`. Returns false if its sender is already counted for a higher view.
    ///
    /// # Preconditions
    ///
    /// The message is authenticated and valid.
    pub(crate) fn collect(&mut self, params: &QuorumParams, view_change: Signed<ViewChange>) -> bool {
        let view = view_change.message.new_view;
        let sender = view_change.signer();
        match self.latest.get(&sender).copied() {
            Some(previous) if previous > view => return false,
            Some(previous) if previous < view => {
                if let Some(collector) = self.collectors.get_mut(&previous) {
                    collector.view_changes.remove(&sender);
                    if collector.view_changes.is_empty() {
                        self.collectors.remove(&previous);
                    }
                }
            }
            _ => (),
        }
        self.latest.insert(sender, view);
        self.collectors
            .entry(view)
            .or_insert_with(|| ViewChangeCollector::new(params, view))
            .collect(sender, view_change);
        true
    }

    /// Get the view changes collected for `view` if there is a quorum of them.
    pub(crate) fn certificate(&self, view: ViewNumber) -> Option<Vec<Signed<ViewChange>>> {
        self.collectors
            .get(&view)
            .and_then(ViewChangeCollector::certificate)
    }

    /// Get the smallest view above `above` if view changes for views above `above` were collected from
    /// at least `weak` distinct replicas.
    pub(crate) fn join_target(&self, above: ViewNumber, weak: usize) -> Option<ViewNumber> {
        let mut senders = 0;
        let mut smallest = None;
        for (view, collector) in self.collectors.range(above + 1..) {
            smallest.get_or_insert(*view);
            senders += collector.view_changes.len();
        }
        if senders >= weak {
            smallest
        } else {
            None
        }
    }

    /// Forget every view change for `view` or a lower view.
    pub(crate) fn discard_up_to(&mut self, view: ViewNumber) {
        self.collectors = self.collectors.split_off(&(view + 1));
        self.latest.retain(|_, latest| *latest > view);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.collectors.len()
    }
}
