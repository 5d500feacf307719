/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::replica::Configuration).
//!
//! The replication engine logs using the [log](https://docs.rs/log/latest/log/) crate. To get these
//! messages printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet
//! is how a [CommitLocal](crate::events::CommitLocalEvent) is printed:
//!
//! ```text
//! CommitLocal, 1701329264, 0, 1, fNGCJyk
//! ```
//!
//! In the snippet, the third and fourth values are the view and the sequence number, and the fifth value
//! is the first seven characters of the Base64 encoding of the request digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const RECEIVE_REQUEST: &str = "ReceiveRequest";
pub const PRE_PREPARE: &str = "PrePrepare";
pub const RECEIVE_PRE_PREPARE: &str = "ReceivePrePrepare";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";

pub const COMMIT_LOCAL: &str = "CommitLocal";
pub const EXECUTE: &str = "Execute";
pub const EXECUTION_FAILED: &str = "ExecutionFailed";

pub const CHECKPOINT: &str = "Checkpoint";
pub const STABLE_CHECKPOINT: &str = "StableCheckpoint";
pub const FALLING_BEHIND: &str = "FallingBehind";
pub const EXECUTION_DIVERGENCE: &str = "ExecutionDivergence";

pub const REQUEST_TIMEOUT: &str = "RequestTimeout";
pub const EQUIVOCATION: &str = "Equivocation";
pub const START_VIEW_CHANGE: &str = "StartViewChange";
pub const VIEW_CHANGE_STALLED: &str = "ViewChangeStalled";
pub const NEW_VIEW: &str = "NewView";
pub const INSTALL_VIEW: &str = "InstallView";
pub const REJECT_NEW_VIEW: &str = "RejectNewView";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReceiveRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_request_event: &ReceiveRequestEvent| {
            log::info!(
                "{}, {}, {}, {}",
                RECEIVE_REQUEST,
                secs_since_unix_epoch(receive_request_event.timestamp),
                receive_request_event.origin,
                first_seven_base64_chars(&receive_request_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |pre_prepare_event: &PrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PRE_PREPARE,
                secs_since_unix_epoch(pre_prepare_event.timestamp),
                pre_prepare_event.pre_prepare.view,
                pre_prepare_event.pre_prepare.seq,
                first_seven_base64_chars(&pre_prepare_event.pre_prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_pre_prepare_event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PRE_PREPARE,
                secs_since_unix_epoch(receive_pre_prepare_event.timestamp),
                receive_pre_prepare_event.origin,
                receive_pre_prepare_event.pre_prepare.view,
                receive_pre_prepare_event.pre_prepare.seq,
                first_seven_base64_chars(&receive_pre_prepare_event.pre_prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepare_event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(prepare_event.timestamp),
                prepare_event.prepare.view,
                prepare_event.prepare.seq,
                first_seven_base64_chars(&prepare_event.prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.commit.view,
                commit_event.commit.seq,
                first_seven_base64_chars(&commit_event.commit.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitLocalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_local_event: &CommitLocalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_LOCAL,
                secs_since_unix_epoch(commit_local_event.timestamp),
                commit_local_event.view,
                commit_local_event.seq,
                first_seven_base64_chars(&commit_local_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExecuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execute_event: &ExecuteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                EXECUTE,
                secs_since_unix_epoch(execute_event.timestamp),
                execute_event.seq,
                first_seven_base64_chars(&execute_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExecutionFailedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execution_failed_event: &ExecutionFailedEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                EXECUTION_FAILED,
                secs_since_unix_epoch(execution_failed_event.timestamp),
                execution_failed_event.seq,
                first_seven_base64_chars(&execution_failed_event.digest.bytes()),
                execution_failed_event.error
            )
        };
        Box::new(logger)
    }
}

impl Logger for CheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |checkpoint_event: &CheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                CHECKPOINT,
                secs_since_unix_epoch(checkpoint_event.timestamp),
                checkpoint_event.checkpoint.seq,
                first_seven_base64_chars(&checkpoint_event.checkpoint.state_digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StableCheckpointEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |stable_checkpoint_event: &StableCheckpointEvent| {
            log::info!(
                "{}, {}, {}, {}",
                STABLE_CHECKPOINT,
                secs_since_unix_epoch(stable_checkpoint_event.timestamp),
                stable_checkpoint_event.seq,
                first_seven_base64_chars(&stable_checkpoint_event.state_digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for FallingBehindEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |falling_behind_event: &FallingBehindEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                FALLING_BEHIND,
                secs_since_unix_epoch(falling_behind_event.timestamp),
                falling_behind_event.stable,
                falling_behind_event.last_executed
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExecutionDivergenceEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execution_divergence_event: &ExecutionDivergenceEvent| {
            log::error!(
                "{}, {}, {}, {}, {}",
                EXECUTION_DIVERGENCE,
                secs_since_unix_epoch(execution_divergence_event.timestamp),
                execution_divergence_event.seq,
                first_seven_base64_chars(&execution_divergence_event.local.bytes()),
                first_seven_base64_chars(&execution_divergence_event.quorum.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for RequestTimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |request_timeout_event: &RequestTimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}",
                REQUEST_TIMEOUT,
                secs_since_unix_epoch(request_timeout_event.timestamp),
                request_timeout_event.view,
                first_seven_base64_chars(&request_timeout_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for EquivocationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |equivocation_event: &EquivocationEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}, {}, {}",
                EQUIVOCATION,
                secs_since_unix_epoch(equivocation_event.timestamp),
                equivocation_event.primary,
                equivocation_event.view,
                equivocation_event.seq,
                first_seven_base64_chars(&equivocation_event.first.bytes()),
                first_seven_base64_chars(&equivocation_event.second.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for StartViewChangeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |start_view_change_event: &StartViewChangeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                START_VIEW_CHANGE,
                secs_since_unix_epoch(start_view_change_event.timestamp),
                start_view_change_event.view_change.new_view,
                start_view_change_event.view_change.last_stable,
                start_view_change_event.view_change.prepared.len(),
                start_view_change_event.timeout.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewChangeStalledEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_change_stalled_event: &ViewChangeStalledEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                VIEW_CHANGE_STALLED,
                secs_since_unix_epoch(view_change_stalled_event.timestamp),
                view_change_stalled_event.target,
                view_change_stalled_event.attempts
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_view_event: &NewViewEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_VIEW,
                secs_since_unix_epoch(new_view_event.timestamp),
                new_view_event.new_view.view,
                new_view_event.new_view.view_changes.len(),
                new_view_event.new_view.pre_prepares.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for InstallViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |install_view_event: &InstallViewEvent| {
            log::info!(
                "{}, {}, {}, {}",
                INSTALL_VIEW,
                secs_since_unix_epoch(install_view_event.timestamp),
                install_view_event.view,
                install_view_event.primary
            )
        };
        Box::new(logger)
    }
}

impl Logger for RejectNewViewEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |reject_new_view_event: &RejectNewViewEvent| {
            log::warn!(
                "{}, {}, {}, {}, {}",
                REJECT_NEW_VIEW,
                secs_since_unix_epoch(reject_new_view_event.timestamp),
                reject_new_view_event.origin,
                reject_new_view_event.view,
                reject_new_view_event.reason
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
pub(crate) fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
