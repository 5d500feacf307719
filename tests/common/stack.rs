use std::{
    collections::{HashMap, VecDeque},
    sync::{mpsc::Receiver, Arc, Mutex},
};

use pbft_rs::{
    stack::{Membership, Stack, StackError},
    types::{
        crypto_primitives::{hash, Ed25519Authenticator, Keypair},
        data_types::{CryptoHash, ReplicaID, SequenceNumber, SignatureBytes, ViewNumber},
    },
};

/// A message sent by `from` to `to`, waiting in the [`Outbox`] to be delivered.
#[derive(Clone, Debug)]
pub(crate) struct Envelope {
    pub(crate) from: ReplicaID,
    pub(crate) to: ReplicaID,
    pub(crate) payload: Vec<u8>,
}

/// The shared "wire" of a test cluster. Every replica's stack pushes the messages it sends here, and the
/// test decides when, and whether, to deliver them.
pub(crate) type Outbox = Arc<Mutex<VecDeque<Envelope>>>;

/// Requests executed by a replica, in execution order.
pub(crate) type ExecutionLog = Arc<Mutex<Vec<(SequenceNumber, Vec<u8>)>>>;

/// Generate one authenticator per replica, each knowing the public keys of all `n` replicas.
pub(crate) fn authenticators(n: u64) -> Vec<Ed25519Authenticator> {
    let keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate()).collect();
    let public_keys: HashMap<ReplicaID, _> = keypairs
        .iter()
        .enumerate()
        .map(|(i, keypair)| (ReplicaID::new(i as u64), keypair.public()))
        .collect();
    keypairs
        .into_iter()
        .map(|keypair| Ed25519Authenticator::new(keypair, public_keys.clone()))
        .collect()
}

/// An in-memory implementation of [`Stack`] whose state machine appends every executed payload to a
/// list, and whose state digest is the hash of that list.
pub(crate) struct MockStack {
    me: ReplicaID,
    replicas: u64,
    reported_replicas: u64,
    authenticator: Ed25519Authenticator,
    outbox: Outbox,
    executed: ExecutionLog,
    views: Arc<Mutex<Vec<ViewNumber>>>,
    store: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
    membership_gate: Option<Receiver<()>>,
    corrupt_state_digest: bool,
}

impl MockStack {
    pub(crate) fn new(
        me: ReplicaID,
        replicas: u64,
        authenticator: Ed25519Authenticator,
        outbox: Outbox,
    ) -> Self {
        Self {
            me,
            replicas,
            reported_replicas: replicas,
            authenticator,
            outbox,
            executed: Arc::new(Mutex::new(Vec::new())),
            views: Arc::new(Mutex::new(Vec::new())),
            store: Arc::new(Mutex::new(HashMap::new())),
            membership_gate: None,
            corrupt_state_digest: false,
        }
    }

    /// Report a cluster of `replicas` replicas from `await_membership`, regardless of the real size.
    pub(crate) fn reporting_replicas(mut self, replicas: u64) -> Self {
        self.reported_replicas = replicas;
        self
    }

    /// Block `await_membership` until `gate` receives a message or disconnects.
    pub(crate) fn with_membership_gate(mut self, gate: Receiver<()>) -> Self {
        self.membership_gate = Some(gate);
        self
    }

    /// Report a state digest that no other replica will agree with.
    pub(crate) fn corrupting_state_digest(mut self) -> Self {
        self.corrupt_state_digest = true;
        self
    }

    /// Get a stack for the same replica after a restart: its wire, application state and stored
    /// protocol state carry over.
    pub(crate) fn reopen(&self) -> Self {
        Self {
            me: self.me,
            replicas: self.replicas,
            reported_replicas: self.reported_replicas,
            authenticator: self.authenticator.clone(),
            outbox: self.outbox.clone(),
            executed: self.executed.clone(),
            views: self.views.clone(),
            store: self.store.clone(),
            membership_gate: None,
            corrupt_state_digest: self.corrupt_state_digest,
        }
    }

    /// Overwrite the value stored under `key`, as a corrupted disk would.
    pub(crate) fn overwrite_state(&self, key: &[u8], value: Vec<u8>) {
        self.store.lock().unwrap().insert(key.to_vec(), value);
    }

    pub(crate) fn execution_log(&self) -> ExecutionLog {
        self.executed.clone()
    }

    pub(crate) fn executed(&self) -> Vec<(SequenceNumber, Vec<u8>)> {
        self.executed.lock().unwrap().clone()
    }

    pub(crate) fn installed_views(&self) -> Vec<ViewNumber> {
        self.views.lock().unwrap().clone()
    }

    fn push(&self, to: ReplicaID, payload: Vec<u8>) {
        self.outbox.lock().unwrap().push_back(Envelope {
            from: self.me,
            to,
            payload,
        })
    }
}

impl Stack for MockStack {
    type Handle = ReplicaID;

    fn broadcast(&mut self, payload: Vec<u8>) {
        for replica in (0..self.replicas).map(ReplicaID::new) {
            if replica != self.me {
                self.push(replica, payload.clone());
            }
        }
    }

    fn send(&mut self, payload: Vec<u8>, handle: &ReplicaID) -> Result<(), StackError> {
        self.push(*handle, payload);
        Ok(())
    }

    fn resolve_replica_handle(&self, replica: ReplicaID) -> Result<ReplicaID, StackError> {
        if replica.int() < self.replicas {
            Ok(replica)
        } else {
            Err(StackError::UnknownReplica(replica))
        }
    }

    fn sign(&self, payload: &[u8]) -> Result<SignatureBytes, StackError> {
        Ok(self.authenticator.sign(payload))
    }

    fn verify(
        &self,
        replica: ReplicaID,
        signature: &SignatureBytes,
        payload: &[u8],
    ) -> Result<(), StackError> {
        self.authenticator.verify(replica, signature, payload)
    }

    fn validate(&self, raw_request: &[u8]) -> Result<(), StackError> {
        if raw_request.starts_with(b"invalid") {
            Err(StackError::InvalidRequest(String::from("rejected by the test stack")))
        } else {
            Ok(())
        }
    }

    fn execute(&mut self, seq: SequenceNumber, raw_request: &[u8]) -> Result<(), StackError> {
        self.executed
            .lock()
            .unwrap()
            .push((seq, raw_request.to_vec()));
        Ok(())
    }

    fn state_digest(&mut self, _seq: SequenceNumber) -> Result<CryptoHash, StackError> {
        if self.corrupt_state_digest {
            return Ok(hash(b"corrupt"));
        }
        let executed = self.executed.lock().unwrap();
        let mut bytes = Vec::new();
        for (seq, payload) in executed.iter() {
            bytes.extend(seq.int().to_le_bytes());
            bytes.extend(payload);
        }
        Ok(hash(&bytes))
    }

    fn store_state(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StackError> {
        self.store.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    fn read_state(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StackError> {
        Ok(self.store.lock().unwrap().get(key).cloned())
    }

    fn notify_view_change(&mut self, view: ViewNumber) {
        self.views.lock().unwrap().push(view)
    }

    fn await_membership(&mut self) -> Membership {
        if let Some(gate) = self.membership_gate.take() {
            let _ = gate.recv();
        }
        Membership {
            me: self.me,
            replicas: self.reported_replicas,
        }
    }
}
