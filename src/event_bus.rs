/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) published by the algorithm thread and
//! fires the handlers registered for them.
//!
//! Handlers for an event type are fired in registration order: the [default logger](crate::logging)
//! first (if `log_events` is enabled), then the handler registered through
//! [`ReplicaSpec`](crate::replica::ReplicaSpec).

use std::{
    sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{events::*, logging::Logger};

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
pub(crate) struct EventHandlers {
    pub(crate) receive_request_handlers: Vec<HandlerPtr<ReceiveRequestEvent>>,
    pub(crate) pre_prepare_handlers: Vec<HandlerPtr<PrePrepareEvent>>,
    pub(crate) receive_pre_prepare_handlers: Vec<HandlerPtr<ReceivePrePrepareEvent>>,
    pub(crate) prepare_handlers: Vec<HandlerPtr<PrepareEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) commit_local_handlers: Vec<HandlerPtr<CommitLocalEvent>>,
    pub(crate) execute_handlers: Vec<HandlerPtr<ExecuteEvent>>,
    pub(crate) execution_failed_handlers: Vec<HandlerPtr<ExecutionFailedEvent>>,
    pub(crate) checkpoint_handlers: Vec<HandlerPtr<CheckpointEvent>>,
    pub(crate) stable_checkpoint_handlers: Vec<HandlerPtr<StableCheckpointEvent>>,
    pub(crate) falling_behind_handlers: Vec<HandlerPtr<FallingBehindEvent>>,
    pub(crate) execution_divergence_handlers: Vec<HandlerPtr<ExecutionDivergenceEvent>>,
    pub(crate) request_timeout_handlers: Vec<HandlerPtr<RequestTimeoutEvent>>,
    pub(crate) equivocation_handlers: Vec<HandlerPtr<EquivocationEvent>>,
    pub(crate) start_view_change_handlers: Vec<HandlerPtr<StartViewChangeEvent>>,
    pub(crate) view_change_stalled_handlers: Vec<HandlerPtr<ViewChangeStalledEvent>>,
    pub(crate) new_view_handlers: Vec<HandlerPtr<NewViewEvent>>,
    pub(crate) install_view_handlers: Vec<HandlerPtr<InstallViewEvent>>,
    pub(crate) reject_new_view_handlers: Vec<HandlerPtr<RejectNewViewEvent>>,
}

impl EventHandlers {
    /// Create a set of event handlers that contains the default logger of every event type if
    /// `log_events` is true, and no handlers otherwise.
    pub(crate) fn new(log_events: bool) -> Self {
        let mut handlers = Self::default();
        if log_events {
            handlers.receive_request_handlers.push(ReceiveRequestEvent::get_logger());
            handlers.pre_prepare_handlers.push(PrePrepareEvent::get_logger());
            handlers.receive_pre_prepare_handlers.push(ReceivePrePrepareEvent::get_logger());
            handlers.prepare_handlers.push(PrepareEvent::get_logger());
            handlers.commit_handlers.push(CommitEvent::get_logger());
            handlers.commit_local_handlers.push(CommitLocalEvent::get_logger());
            handlers.execute_handlers.push(ExecuteEvent::get_logger());
            handlers.execution_failed_handlers.push(ExecutionFailedEvent::get_logger());
            handlers.checkpoint_handlers.push(CheckpointEvent::get_logger());
            handlers.stable_checkpoint_handlers.push(StableCheckpointEvent::get_logger());
            handlers.falling_behind_handlers.push(FallingBehindEvent::get_logger());
            handlers.execution_divergence_handlers.push(ExecutionDivergenceEvent::get_logger());
            handlers.request_timeout_handlers.push(RequestTimeoutEvent::get_logger());
            handlers.equivocation_handlers.push(EquivocationEvent::get_logger());
            handlers.start_view_change_handlers.push(StartViewChangeEvent::get_logger());
            handlers.view_change_stalled_handlers.push(ViewChangeStalledEvent::get_logger());
            handlers.new_view_handlers.push(NewViewEvent::get_logger());
            handlers.install_view_handlers.push(InstallViewEvent::get_logger());
            handlers.reject_new_view_handlers.push(RejectNewViewEvent::get_logger());
        }
        handlers
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.receive_request_handlers.is_empty()
            && self.pre_prepare_handlers.is_empty()
            && self.receive_pre_prepare_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.commit_local_handlers.is_empty()
            && self.execute_handlers.is_empty()
            && self.execution_failed_handlers.is_empty()
            && self.checkpoint_handlers.is_empty()
            && self.stable_checkpoint_handlers.is_empty()
            && self.falling_behind_handlers.is_empty()
            && self.execution_divergence_handlers.is_empty()
            && self.request_timeout_handlers.is_empty()
            && self.equivocation_handlers.is_empty()
            && self.start_view_change_handlers.is_empty()
            && self.view_change_stalled_handlers.is_empty()
            && self.new_view_handlers.is_empty()
            && self.install_view_handlers.is_empty()
            && self.reject_new_view_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReceiveRequest(receive_request_event) => self
                .receive_request_handlers
                .iter()
                .for_each(|handler| handler(&receive_request_event)),

            Event::PrePrepare(pre_prepare_event) => self
                .pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&pre_prepare_event)),

            Event::ReceivePrePrepare(receive_pre_prepare_event) => self
                .receive_pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_pre_prepare_event)),

            Event::Prepare(prepare_event) => self
                .prepare_handlers
                .iter()
                .for_each(|handler| handler(&prepare_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::CommitLocal(commit_local_event) => self
                .commit_local_handlers
                .iter()
                .for_each(|handler| handler(&commit_local_event)),

            Event::Execute(execute_event) => self
                .execute_handlers
                .iter()
                .for_each(|handler| handler(&execute_event)),

            Event::ExecutionFailed(execution_failed_event) => self
                .execution_failed_handlers
                .iter()
                .for_each(|handler| handler(&execution_failed_event)),

            Event::Checkpoint(checkpoint_event) => self
                .checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&checkpoint_event)),

            Event::StableCheckpoint(stable_checkpoint_event) => self
                .stable_checkpoint_handlers
                .iter()
                .for_each(|handler| handler(&stable_checkpoint_event)),

            Event::FallingBehind(falling_behind_event) => self
                .falling_behind_handlers
                .iter()
                .for_each(|handler| handler(&falling_behind_event)),

            Event::ExecutionDivergence(execution_divergence_event) => self
                .execution_divergence_handlers
                .iter()
                .for_each(|handler| handler(&execution_divergence_event)),

            Event::RequestTimeout(request_timeout_event) => self
                .request_timeout_handlers
                .iter()
                .for_each(|handler| handler(&request_timeout_event)),

            Event::Equivocation(equivocation_event) => self
                .equivocation_handlers
                .iter()
                .for_each(|handler| handler(&equivocation_event)),

            Event::StartViewChange(start_view_change_event) => self
                .start_view_change_handlers
                .iter()
                .for_each(|handler| handler(&start_view_change_event)),

            Event::ViewChangeStalled(view_change_stalled_event) => self
                .view_change_stalled_handlers
                .iter()
                .for_each(|handler| handler(&view_change_stalled_event)),

            Event::NewView(new_view_event) => self
                .new_view_handlers
                .iter()
                .for_each(|handler| handler(&new_view_event)),

            Event::InstallView(install_view_event) => self
                .install_view_handlers
                .iter()
                .for_each(|handler| handler(&install_view_event)),

            Event::RejectNewView(reject_new_view_event) => self
                .reject_new_view_handlers
                .iter()
                .for_each(|handler| handler(&reject_new_view_event)),
        }
    }
}

/// Append `handler`, if the user registered one, to `handlers`.
pub(crate) fn register<T>(handlers: &mut Vec<HandlerPtr<T>>, handler: Option<HandlerPtr<T>>) {
    if let Some(handler) = handler {
        handlers.push(handler)
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(POLL_INTERVAL) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // The algorithm thread has exited. Wait for the shutdown signal.
            Err(RecvTimeoutError::Disconnected) => {
                let _ = shutdown_signal.recv();
                return;
            }
        }
    })
}
