/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Three-phase agreement: the subprotocol that orders requests within a view.
//!
//! ## Per-position states
//!
//! Every (sequence number, view) position moves through the following states:
//!
//! ```text
//! absent -> pre-prepared -> prepared -> committed-local -> executed
//! ```
//!
//! 1. **absent -> pre-prepared**: the primary of the view assigns the next sequence number in the
//!    watermark window to a request and broadcasts a [`PrePrepare`](messages::PrePrepare). The primary's
//!    `PrePrepare` stands in for its own vote. A request and its `PrePrepare` may arrive in either order;
//!    backups only vote once they know both.
//! 2. **pre-prepared -> prepared**: backups broadcast a [`Prepare`](messages::Prepare). A position is
//!    prepared once `2f` matching Prepares from distinct backups have been collected.
//! 3. **prepared -> committed-local**: every replica broadcasts a [`Commit`](messages::Commit) once the
//!    position is prepared. A position is committed-local once `2f+1` matching Commits, including the
//!    replica's own, have been collected.
//! 4. **committed-local -> executed**: the request is executed once every lower sequence number has been
//!    executed. Execution is strictly in sequence order.
//!
//! ## Equivocation
//!
//! If the primary signs two `PrePrepare`s with different digests for the same (sequence number, view),
//! the replica treats the pair as proof that the primary is faulty and starts a view change. Neither
//! digest is executed at that position in that view.

pub mod messages;

pub(crate) mod implementation;
