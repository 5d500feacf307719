/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! View changes: the subprotocol that replaces a faulty or slow primary.
//!
//! The primary of view `v` is replica `v mod N`.
//!
//! ## Starting a view change
//!
//! A replica moves from view `v` towards view `v+1` when:
//! 1. The deadline of a request it knows about expires before the request commits.
//! 2. It catches the primary signing two PrePrepares with different digests for the same position.
//! 3. It receives valid view changes for views above its own from `f+1` distinct replicas (join-in).
//!
//! It then stops accepting three-phase agreement messages for `v` and broadcasts a
//! [`ViewChange`](messages::ViewChange) carrying its last stable checkpoint (with proof) and a prepared
//! certificate for every sequence number above that checkpoint that prepared in some view. If no new
//! view is installed before the view-change deadline, the replica moves on to the next view, doubling
//! the deadline every time.
//!
//! ## Installing the new view
//!
//! Once the primary of the new view has `2f+1` valid view changes for it, it computes the PrePrepares
//! the new view must start with: for every sequence number between the latest stable checkpoint and
//! the highest prepared sequence number in the view changes, the digest prepared in the highest view,
//! or the null digest if none prepared. It broadcasts these in a [`NewView`](messages::NewView).
//!
//! Backups recompute the same PrePrepares from the view changes in the NewView, and install the view
//! only if they match exactly.

pub mod messages;

pub(crate) mod implementation;
