/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-(sequence number, view) record of protocol messages, and the store of requests they refer to.
//!
//! ## Entries
//!
//! A [`LogEntry`] is created when the first message for its (sequence number, view) position is
//! observed, mutated as Prepares and Commits arrive, and destroyed by
//! [`garbage_collect`](MessageLog::garbage_collect) once a stable checkpoint covers it. Entries are
//! keyed sequence-number-major, so that all views of one sequence number are adjacent and garbage
//! collection is a single split of the map.
//!
//! Votes are recorded per signer: the first Prepare and the first Commit of every replica for a
//! position are kept, and later ones are ignored. Votes may arrive before the PrePrepare they agree
//! with; they are kept and only count once a PrePrepare with the same digest is present.
//!
//! ## Requests
//!
//! Requests are stored by digest until they have been executed and a stable checkpoint covers their
//! execution. The log then keeps the digest of every discarded request executed within one log window
//! below the stable checkpoint, so that a replayed copy is not ordered a second time. Once a digest
//! ages out of that window, the request's timestamp becomes a floor for its origin: requests from the
//! origin at or below the floor are treated as replays.

use std::collections::{BTreeMap, HashMap};

use crate::{
    quorum::QuorumParams,
    replication::messages::{Commit, PrePrepare, Prepare, Request},
    types::{
        data_types::{CryptoHash, ReplicaID, SequenceNumber, ViewNumber},
        signed_messages::Signed,
    },
    view_change::messages::PreparedCertificate,
};

/// Everything this replica knows about one (sequence number, view) position.
#[derive(Clone, Default)]
pub(crate) struct LogEntry {
    pub(crate) pre_prepare: Option<Signed<PrePrepare>>,
    pub(crate) prepares: BTreeMap<ReplicaID, Signed<Prepare>>,
    pub(crate) commits: BTreeMap<ReplicaID, Signed<Commit>>,
    pub(crate) sent_prepare: bool,
    pub(crate) sent_commit: bool,
    pub(crate) committed: bool,
}

impl LogEntry {
    /// Get the digest bound by the entry's PrePrepare.
    pub(crate) fn digest(&self) -> Option<CryptoHash> {
        self.pre_prepare.as_ref().map(|pp| pp.message.digest)
    }

    /// Record `prepare` unless its signer has already voted.
    pub(crate) fn add_prepare(&mut self, prepare: Signed<Prepare>) -> bool {
        let signer = prepare.signer();
        if self.prepares.contains_key(&signer) {
            return false;
        }
        self.prepares.insert(signer, prepare);
        true
    }

    /// Record `commit` unless its signer has already voted.
    pub(crate) fn add_commit(&mut self, commit: Signed<Commit>) -> bool {
        let signer = commit.signer();
        if self.commits.contains_key(&signer) {
            return false;
        }
        self.commits.insert(signer, commit);
        true
    }

    /// Get the Prepares that match the PrePrepare, excluding any Prepare from the primary.
    pub(crate) fn matching_prepares(&self) -> Vec<&Signed<Prepare>> {
        match &self.pre_prepare {
            Some(pp) => self
                .prepares
                .values()
                .filter(|prepare| {
                    prepare.message.digest == pp.message.digest && prepare.signer() != pp.signer()
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Count the Commits that match the PrePrepare.
    pub(crate) fn matching_commits(&self) -> usize {
        match self.digest() {
            Some(digest) => self
                .commits
                .values()
                .filter(|commit| commit.message.digest == digest)
                .count(),
            None => 0,
        }
    }

    /// Check whether the entry holds a PrePrepare and `2f` matching Prepares from distinct backups.
    pub(crate) fn is_prepared(&self, params: &QuorumParams) -> bool {
        self.pre_prepare.is_some() && self.matching_prepares().len() >= params.prepared()
    }

    /// Check whether the entry is prepared and holds `2f+1` matching Commits.
    pub(crate) fn is_committed_local(&self, params: &QuorumParams) -> bool {
        self.is_prepared(params) && self.matching_commits() >= params.committed()
    }

    /// Package the entry's PrePrepare and matching Prepares into a [`PreparedCertificate`], if the
    /// entry is prepared.
    pub(crate) fn prepared_certificate(&self, params: &QuorumParams) -> Option<PreparedCertificate> {
        if !self.is_prepared(params) {
            return None;
        }
        let pre_prepare = self.pre_prepare.clone()?;
        let prepares = self
            .matching_prepares()
            .into_iter()
            .take(params.prepared())
            .cloned()
            .collect();
        Some(PreparedCertificate {
            pre_prepare,
            prepares,
        })
    }
}

/// A request, together with the form of its payload that is handed to the stack.
#[derive(Clone)]
pub(crate) struct RequestRecord {
    pub(crate) request: Signed<Request>,

    /// The payload after being opened by the replica's
    /// [confidentiality mode](crate::confidentiality::Confidentiality).
    pub(crate) opened: Vec<u8>,

    pub(crate) executed_at: Option<SequenceNumber>,
}

/// What the log remembers about a request after discarding it.
#[derive(Clone, Copy)]
struct DiscardedRequest {
    executed_at: SequenceNumber,
    origin: ReplicaID,
    timestamp: u64,
}

#[derive(Default)]
pub(crate) struct MessageLog {
    entries: BTreeMap<(SequenceNumber, ViewNumber), LogEntry>,
    requests: HashMap<CryptoHash, RequestRecord>,
    discarded: HashMap<CryptoHash, DiscardedRequest>,
    timestamp_floors: HashMap<ReplicaID, u64>,
}

impl MessageLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, seq: SequenceNumber, view: ViewNumber) -> Option<&LogEntry> {
        self.entries.get(&(seq, view))
    }

    /// Get the entry at (`seq`, `view`), creating an empty one if there is none.
    pub(crate) fn entry_mut(&mut self, seq: SequenceNumber, view: ViewNumber) -> &mut LogEntry {
        self.entries.entry((seq, view)).or_default()
    }

    /// Get the digest that committed-local at `seq` in any view.
    pub(crate) fn committed_digest(&self, seq: SequenceNumber) -> Option<CryptoHash> {
        self.entries
            .range((seq, ViewNumber::init())..=(seq, ViewNumber::new(u64::MAX)))
            .rev()
            .find(|(_, entry)| entry.committed)
            .and_then(|(_, entry)| entry.digest())
    }

    /// Get the sequence number that `digest` is pre-prepared at in `view`.
    pub(crate) fn assigned_seq(&self, view: ViewNumber, digest: &CryptoHash) -> Option<SequenceNumber> {
        self.entries
            .iter()
            .find(|((_, entry_view), entry)| {
                *entry_view == view && entry.digest().as_ref() == Some(digest)
            })
            .map(|((seq, _), _)| *seq)
    }

    /// For every sequence number above `above` that prepared in some view, get the prepared certificate
    /// from the highest such view.
    pub(crate) fn prepared_certificates(
        &self,
        above: SequenceNumber,
        params: &QuorumParams,
    ) -> Vec<PreparedCertificate> {
        let mut highest: BTreeMap<SequenceNumber, PreparedCertificate> = BTreeMap::new();
        for ((seq, _), entry) in self.entries.range((above.next(), ViewNumber::init())..) {
            if let Some(certificate) = entry.prepared_certificate(params) {
                // Entries of the same sequence number are visited in increasing view order.
                highest.insert(*seq, certificate);
            }
        }
        highest.into_values().collect()
    }

    /// Store `record`. Returns false if a request with the same digest is already stored, or the request is
    /// a replay of one that was already executed and discarded.
    pub(crate) fn insert_request(&mut self, digest: CryptoHash, record: RequestRecord) -> bool {
        if self.requests.contains_key(&digest) || self.is_discarded(&digest, &record.request.message) {
            return false;
        }
        self.requests.insert(digest, record);
        true
    }

    pub(crate) fn request(&self, digest: &CryptoHash) -> Option<&RequestRecord> {
        self.requests.get(digest)
    }

    pub(crate) fn has_request(&self, digest: &CryptoHash) -> bool {
        self.requests.contains_key(digest)
    }

    /// Check whether `request`, with digest `digest`, was already executed and discarded.
    pub(crate) fn is_discarded(&self, digest: &CryptoHash, request: &Request) -> bool {
        self.discarded.contains_key(digest)
            || self
                .timestamp_floors
                .get(&request.origin)
                .is_some_and(|floor| request.timestamp <= *floor)
    }

    /// Check whether the request with `digest` was executed, whether or not it is still stored.
    pub(crate) fn is_executed(&self, digest: &CryptoHash) -> bool {
        self.discarded.contains_key(digest)
            || self
                .requests
                .get(digest)
                .is_some_and(|record| record.executed_at.is_some())
    }

    pub(crate) fn mark_executed(&mut self, digest: &CryptoHash, seq: SequenceNumber) {
        if let Some(record) = self.requests.get_mut(digest) {
            record.executed_at = Some(seq);
        }
    }

    /// Get the digests of the stored requests that have not been executed, oldest first.
    pub(crate) fn unexecuted_requests(&self) -> Vec<CryptoHash> {
        let mut unexecuted: Vec<(&CryptoHash, &RequestRecord)> = self
            .requests
            .iter()
            .filter(|(_, record)| record.executed_at.is_none())
            .collect();
        unexecuted.sort_by_key(|(digest, record)| (record.request.message.timestamp, **digest));
        unexecuted.into_iter().map(|(digest, _)| *digest).collect()
    }

    /// Discard every entry at or below `stable`, and every request executed at or below `stable`.
    ///
    /// The digests of discarded requests are remembered until they were executed more than `log_window`
    /// sequence numbers below `stable`.
    pub(crate) fn garbage_collect(&mut self, stable: SequenceNumber, log_window: u64) {
        self.entries = self.entries.split_off(&(stable.next(), ViewNumber::init()));

        let covered: Vec<CryptoHash> = self
            .requests
            .iter()
            .filter(|(_, record)| record.executed_at.is_some_and(|seq| seq <= stable))
            .map(|(digest, _)| *digest)
            .collect();
        for digest in covered {
            if let Some(record) = self.requests.remove(&digest) {
                if let Some(executed_at) = record.executed_at {
                    let request = record.request.message;
                    self.discarded.insert(
                        digest,
                        DiscardedRequest {
                            executed_at,
                            origin: request.origin,
                            timestamp: request.timestamp,
                        },
                    );
                }
            }
        }

        let horizon = SequenceNumber::new(stable.int().saturating_sub(log_window));
        let floors = &mut self.timestamp_floors;
        self.discarded.retain(|_, discarded| {
            if discarded.executed_at > horizon {
                return true;
            }
            let floor = floors.entry(discarded.origin).or_insert(0);
            *floor = (*floor).max(discarded.timestamp);
            false
        });
    }

    /// Number of (sequence number, view) entries in the log.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.requests.clear();
        self.discarded.clear();
        self.timestamp_floors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::SignatureBytes;

    fn signed<M>(message: M) -> Signed<M> {
        Signed {
            message,
            signature: SignatureBytes::new(Vec::new()),
        }
    }

    fn pre_prepare(view: u64, seq: u64, digest: u8) -> Signed<PrePrepare> {
        signed(PrePrepare {
            view: ViewNumber::new(view),
            seq: SequenceNumber::new(seq),
            digest: CryptoHash::new([digest; 32]),
            replica: ReplicaID::new(view % 4),
        })
    }

    fn prepare(view: u64, seq: u64, digest: u8, replica: u64) -> Signed<Prepare> {
        signed(Prepare {
            view: ViewNumber::new(view),
            seq: SequenceNumber::new(seq),
            digest: CryptoHash::new([digest; 32]),
            replica: ReplicaID::new(replica),
        })
    }

    fn commit(view: u64, seq: u64, digest: u8, replica: u64) -> Signed<Commit> {
        signed(Commit {
            view: ViewNumber::new(view),
            seq: SequenceNumber::new(seq),
            digest: CryptoHash::new([digest; 32]),
            replica: ReplicaID::new(replica),
        })
    }

    fn record(payload: &[u8], timestamp: u64) -> RequestRecord {
        RequestRecord {
            request: signed(Request {
                timestamp,
                payload: payload.to_vec(),
                origin: ReplicaID::new(1),
            }),
            opened: payload.to_vec(),
            executed_at: None,
        }
    }

    #[test]
    fn prepared_requires_two_f_matching_backup_prepares() {
        let params = QuorumParams::new(4, 1).unwrap();
        let mut entry = LogEntry::default();

        // Votes that arrive before the PrePrepare are kept.
        entry.add_prepare(prepare(0, 1, 1, 1));
        assert!(!entry.is_prepared(&params));

        entry.pre_prepare = Some(pre_prepare(0, 1, 1));
        // The primary's own Prepare does not count.
        entry.add_prepare(prepare(0, 1, 1, 0));
        // Neither does a Prepare for another digest.
        entry.add_prepare(prepare(0, 1, 2, 2));
        assert!(!entry.is_prepared(&params));

        entry.add_prepare(prepare(0, 1, 1, 3));
        assert!(entry.is_prepared(&params));
        assert_eq!(entry.prepared_certificate(&params).unwrap().prepares.len(), 2);
    }

    #[test]
    fn committed_local_requires_two_f_plus_one_matching_commits() {
        let params = QuorumParams::new(4, 1).unwrap();
        let mut entry = LogEntry::default();
        entry.pre_prepare = Some(pre_prepare(0, 1, 1));
        entry.add_prepare(prepare(0, 1, 1, 1));
        entry.add_prepare(prepare(0, 1, 1, 2));

        entry.add_commit(commit(0, 1, 1, 0));
        entry.add_commit(commit(0, 1, 1, 1));
        assert!(!entry.add_commit(commit(0, 1, 1, 1)));
        assert!(!entry.is_committed_local(&params));

        entry.add_commit(commit(0, 1, 1, 3));
        assert!(entry.is_committed_local(&params));
    }

    #[test]
    fn prepared_certificates_come_from_the_highest_view() {
        let params = QuorumParams::new(4, 1).unwrap();
        let mut log = MessageLog::new();
        for (view, digest) in [(0, 1), (1, 2)] {
            let entry = log.entry_mut(SequenceNumber::new(3), ViewNumber::new(view));
            entry.pre_prepare = Some(pre_prepare(view, 3, digest));
            entry.add_prepare(prepare(view, 3, digest, 2));
            entry.add_prepare(prepare(view, 3, digest, 3));
        }
        // Not prepared: only a PrePrepare.
        log.entry_mut(SequenceNumber::new(4), ViewNumber::new(1)).pre_prepare =
            Some(pre_prepare(1, 4, 9));

        let certificates = log.prepared_certificates(SequenceNumber::new(0), &params);
        assert_eq!(certificates.len(), 1);
        assert_eq!(certificates[0].view(), ViewNumber::new(1));
        assert_eq!(certificates[0].digest(), CryptoHash::new([2u8; 32]));

        assert!(log
            .prepared_certificates(SequenceNumber::new(3), &params)
            .is_empty());
    }

    #[test]
    fn garbage_collection_discards_covered_entries_and_requests() {
        let mut log = MessageLog::new();
        for seq in 1..=4 {
            log.entry_mut(SequenceNumber::new(seq), ViewNumber::new(0)).pre_prepare =
                Some(pre_prepare(0, seq, seq as u8));
        }
        let executed = record(b"tx1", 10);
        let executed_digest = executed.request.message.digest();
        let pending = record(b"tx2", 5);
        let pending_digest = pending.request.message.digest();
        assert!(log.insert_request(executed_digest, executed.clone()));
        assert!(!log.insert_request(executed_digest, executed.clone()));
        assert!(log.insert_request(pending_digest, pending));
        log.mark_executed(&executed_digest, SequenceNumber::new(2));

        log.garbage_collect(SequenceNumber::new(2), 4);

        assert_eq!(log.len(), 2);
        assert!(log.get(SequenceNumber::new(2), ViewNumber::new(0)).is_none());
        assert!(log.get(SequenceNumber::new(3), ViewNumber::new(0)).is_some());
        assert!(!log.has_request(&executed_digest));
        assert!(log.has_request(&pending_digest));
        assert_eq!(log.unexecuted_requests(), vec![pending_digest]);

        // A replay of the discarded request is not accepted again.
        assert!(log.is_executed(&executed_digest));
        assert!(!log.insert_request(executed_digest, executed));
    }

    #[test]
    fn discarded_requests_are_remembered_by_digest() {
        let mut log = MessageLog::new();
        let first = record(b"tx1", 10);
        let first_digest = first.request.message.digest();
        log.insert_request(first_digest, first.clone());
        log.mark_executed(&first_digest, SequenceNumber::new(2));
        log.garbage_collect(SequenceNumber::new(2), 4);

        // A distinct request from the same origin with an older timestamp is still accepted.
        let older = record(b"tx3", 1);
        let older_digest = older.request.message.digest();
        assert!(log.insert_request(older_digest, older));
        log.mark_executed(&older_digest, SequenceNumber::new(3));

        // Digests executed within one log window below the stable checkpoint are kept.
        log.garbage_collect(SequenceNumber::new(4), 4);
        assert!(log.is_executed(&first_digest));
        assert!(log.is_executed(&older_digest));
        assert!(!log.insert_request(first_digest, first.clone()));

        // Older ones are forgotten, and their timestamps turn into a floor for the origin.
        log.garbage_collect(SequenceNumber::new(8), 4);
        assert!(!log.is_executed(&first_digest));
        assert!(!log.is_executed(&older_digest));
        assert!(!log.insert_request(first_digest, first));
        assert!(!log.insert_request(record(b"tx4", 10).request.message.digest(), record(b"tx4", 10)));
        let newer = record(b"tx4", 11);
        assert!(log.insert_request(newer.request.message.digest(), newer));
    }
}
