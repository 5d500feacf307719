/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Protocol state that survives a restart of the replica.
//!
//! A replica stores the handful of variables it needs to rejoin the cluster without re-executing or
//! re-ordering anything through [`Stack::store_state`], each as a **Borsh-serialized value** under
//! one of the one-byte keys in [`paths`]:
//!
//! |Key|Value|Written when|
//! |---|---|---|
//! |[`VIEW`](paths::VIEW)|[`ViewNumber`]|a new view is installed|
//! |[`STABLE_CHECKPOINT`](paths::STABLE_CHECKPOINT)|[`StableCheckpoint`]|a checkpoint becomes stable|
//! |[`LAST_EXECUTED`](paths::LAST_EXECUTED)|[`SequenceNumber`]|a request is executed|
//! |[`LAST_ASSIGNED`](paths::LAST_ASSIGNED)|`(ViewNumber, SequenceNumber)`|the primary assigns a sequence number|
//!
//! The values are read back once, by [`Pbft::initialize`](crate::adapter::Pbft::initialize). A key
//! that was never written leaves the corresponding variable at its starting value.

use borsh::BorshDeserialize;

use crate::{
    checkpoint::messages::StableCheckpoint,
    stack::{Stack, StackError},
    types::data_types::{SequenceNumber, ViewNumber},
};

/// Keys under which protocol state is stored.
pub mod paths {
    pub const VIEW: [u8; 1] = [0];
    pub const STABLE_CHECKPOINT: [u8; 1] = [1];
    pub const LAST_EXECUTED: [u8; 1] = [2];
    pub const LAST_ASSIGNED: [u8; 1] = [3];
}

/// Protocol state read back from the stack on initialization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct PersistedState {
    pub(crate) view: Option<ViewNumber>,
    pub(crate) stable: Option<StableCheckpoint>,
    pub(crate) last_executed: Option<SequenceNumber>,
    pub(crate) last_assigned: Option<(ViewNumber, SequenceNumber)>,
}

impl PersistedState {
    pub(crate) fn read<S: Stack>(stack: &S) -> Result<Self, StackError> {
        Ok(Self {
            view: read(stack, &paths::VIEW)?,
            stable: read(stack, &paths::STABLE_CHECKPOINT)?,
            last_executed: read(stack, &paths::LAST_EXECUTED)?,
            last_assigned: read(stack, &paths::LAST_ASSIGNED)?,
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn read<S: Stack, T: BorshDeserialize>(stack: &S, key: &[u8]) -> Result<Option<T>, StackError> {
    match stack.read_state(key)? {
        Some(bytes) => T::deserialize(&mut bytes.as_slice())
            .map(Some)
            .map_err(|err| StackError::Storage(format!("cannot decode value under key {:?}: {}", key, err))),
        None => Ok(None),
    }
}
