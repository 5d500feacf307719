/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of Practical Byzantine Fault Tolerance (PBFT) state machine replication.
//!
//! A cluster of `N = 3f+1` replicas agrees on a single total order of client transactions, and every
//! non-faulty replica executes them in that order, as long as at most `f` replicas are Byzantine.
//!
//! The crate is organized around four protocol components:
//! 1. [Three-phase agreement](replication), which orders requests within a view.
//! 2. [Checkpoints](checkpoint), which let replicas garbage collect their logs.
//! 3. [View changes](view_change), which replace a faulty primary.
//! 4. The [protocol adapter](adapter), which authenticates and routes inputs to the other three.
//!
//! Transport, signing and execution are provided by the library user through the [`Stack`](stack::Stack)
//! trait. A replica can be driven directly through [`Pbft`](adapter::Pbft), or run on its own threads
//! through [`ReplicaSpec`](replica::ReplicaSpec).

pub mod adapter;

pub(crate) mod algorithm;

pub mod checkpoint;

pub mod confidentiality;

pub mod credential_pool;

pub(crate) mod event_bus;

pub mod events;

pub(crate) mod logging;

pub(crate) mod message_log;

pub mod networking;

pub mod persistence;

pub mod quorum;

pub mod replica;

pub mod replication;

pub mod stack;

pub(crate) mod state;

pub(crate) mod timers;

pub mod types;

pub mod view_change;
