/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Checkpoints: periodic, quorum-certified state digests that let replicas garbage collect their logs.
//!
//! Every `checkpoint_period` (`K`) executed sequence numbers, a replica asks the
//! [`Stack`](crate::stack::Stack) for the digest of its application state and broadcasts a
//! [`Checkpoint`](messages::Checkpoint) vote for it. Once `2f+1` replicas voted for the same
//! (sequence number, digest), the checkpoint is **stable**:
//! 1. The low watermark advances to the checkpoint's sequence number, opening the window for new
//!    PrePrepares.
//! 2. Log entries and executed requests at or below the checkpoint are discarded.
//! 3. Votes at or below the checkpoint, matching or not, are discarded.
//!
//! If a quorum agrees on a digest that differs from this replica's own, the replica's execution has
//! diverged from the cluster. This is fatal: the replica halts and reports an
//! [`ExecutionDivergence`](crate::events::ExecutionDivergenceEvent). The replica does not attempt to
//! resynchronize its state.

pub mod messages;

pub(crate) mod implementation;
