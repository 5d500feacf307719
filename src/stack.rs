/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definitions for the surrounding stack that the replication core calls into.
//!
//! The replication core does not send bytes over the network, hold signing keys, or execute
//! transactions itself. It delegates all of these to a library user-provided implementation of
//! [`Stack`]:
//! - **Transport**: [`broadcast`](Stack::broadcast), [`unicast`](Stack::unicast),
//!   [`send`](Stack::send) and [`resolve_replica_handle`](Stack::resolve_replica_handle).
//! - **Authentication**: [`sign`](Stack::sign) and [`verify`](Stack::verify).
//! - **Execution**: [`validate`](Stack::validate), [`execute`](Stack::execute),
//!   [`execute_null`](Stack::execute_null) and [`state_digest`](Stack::state_digest).
//! - **Persistence**: [`store_state`](Stack::store_state) and [`read_state`](Stack::read_state).
//! - **Membership**: [`await_membership`](Stack::await_membership) and
//!   [`notify_view_change`](Stack::notify_view_change).
//!
//! ## Execution
//!
//! Every committed sequence number is handed to the stack exactly once, in strictly increasing
//! sequence order starting at 1, on the replica's single processing path: a request through
//! [`execute`](Stack::execute), and a sequence number that carries no request (the null request a new
//! view fills gaps with, or a request the cluster ordered a second time) through
//! [`execute_null`](Stack::execute_null). The core does not process any other input until the call
//! returns, so implementations are free to block until the transaction has been applied and committed
//! to the ledger.
//!
//! ## Persistence
//!
//! The core writes the protocol variables it needs to resume after a restart (the installed view, the
//! stable checkpoint, the execution pointer) through [`store_state`](Stack::store_state) whenever they
//! change, and reads them back in [`Pbft::initialize`](crate::adapter::Pbft::initialize). The keys are
//! listed in [`persistence::paths`](crate::persistence::paths).

use std::fmt::{self, Display, Formatter};

use crate::types::data_types::{CryptoHash, ReplicaID, SequenceNumber, SignatureBytes, ViewNumber};

pub trait Stack: Send {
    /// Address of a single replica in the transport layer.
    type Handle;

    /// Best-effort send of `payload` to every replica in the cluster except this one.
    fn broadcast(&mut self, payload: Vec<u8>);

    /// Best-effort send of `payload` to the peer addressed by `handle`.
    fn send(&mut self, payload: Vec<u8>, handle: &Self::Handle) -> Result<(), StackError>;

    /// Resolve the transport-layer address of `replica`.
    fn resolve_replica_handle(&self, replica: ReplicaID) -> Result<Self::Handle, StackError>;

    /// Best-effort send of `payload` to `replica`.
    fn unicast(&mut self, payload: Vec<u8>, replica: ReplicaID) -> Result<(), StackError> {
        let handle = self.resolve_replica_handle(replica)?;
        self.send(payload, &handle)
    }

    /// Sign `payload` with this replica's credentials.
    fn sign(&self, payload: &[u8]) -> Result<SignatureBytes, StackError>;

    /// Check that `signature` is a signature over `payload` created by `replica`.
    fn verify(
        &self,
        replica: ReplicaID,
        signature: &SignatureBytes,
        payload: &[u8],
    ) -> Result<(), StackError>;

    /// Syntactically check an opaque transaction before it is ordered.
    fn validate(&self, raw_request: &[u8]) -> Result<(), StackError>;

    /// Apply the transaction `raw_request` at position `seq` of the total order.
    fn execute(&mut self, seq: SequenceNumber, raw_request: &[u8]) -> Result<(), StackError>;

    /// Advance the total order past `seq` without applying a transaction.
    ///
    /// The default implementation hands an empty transaction to [`execute`](Self::execute).
    fn execute_null(&mut self, seq: SequenceNumber) -> Result<(), StackError> {
        self.execute(seq, &[])
    }

    /// Get the digest of the application state right after executing `seq`.
    fn state_digest(&mut self, seq: SequenceNumber) -> Result<CryptoHash, StackError>;

    /// Durably store `value` under `key`, replacing the previous value.
    fn store_state(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), StackError>;

    /// Read the value last stored under `key`, if any.
    fn read_state(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StackError>;

    /// Inform the stack that this replica has installed `view`.
    fn notify_view_change(&mut self, view: ViewNumber);

    /// Block until this replica knows its own ID and the size of the cluster.
    fn await_membership(&mut self) -> Membership;
}

/// This replica's identity within the cluster, as reported by [`Stack::await_membership`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Membership {
    /// This replica's ID.
    pub me: ReplicaID,

    /// Number of replicas in the cluster.
    pub replicas: u64,
}

/// Enumerates the different ways a call into the [`Stack`] can fail.
///
/// None of these errors is fatal to the replication core. Send failures are ignored (the protocol
/// retransmits through timeouts), authentication and validation failures cause the offending message
/// to be dropped, execution failures are reported through an
/// [`ExecutionFailed`](crate::events::ExecutionFailedEvent) event, and failures to store state are
/// logged. Failing to read state back makes [`Pbft::initialize`](crate::adapter::Pbft::initialize)
/// fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// The stack does not know the replica with this ID.
    UnknownReplica(ReplicaID),

    /// The transport layer could not deliver a message.
    Transport(String),

    /// A signature could not be created, or failed verification.
    Authentication(String),

    /// A transaction failed syntactic validation.
    InvalidRequest(String),

    /// A transaction failed while being executed, or the state digest could not be computed.
    Execution(String),

    /// Protocol state could not be stored or read back.
    Storage(String),
}

impl Display for StackError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StackError::UnknownReplica(replica) => write!(f, "unknown replica {}", replica),
            StackError::Transport(reason) => write!(f, "transport error: {}", reason),
            StackError::Authentication(reason) => write!(f, "authentication error: {}", reason),
            StackError::InvalidRequest(reason) => write!(f, "invalid request: {}", reason),
            StackError::Execution(reason) => write!(f, "execution error: {}", reason),
            StackError::Storage(reason) => write!(f, "storage error: {}", reason),
        }
    }
}
