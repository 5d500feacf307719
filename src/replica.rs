/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to configure, build and run a replica on its own threads.
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which keeps the replica alive, and through which requests and messages are
//!   handed to it.
//!
//! ## Starting a replica
//!
//! Here is an example that demonstrates how to build and start running a replica using the builder pattern:
//!
//! ```ignore
//! let replica =
//!     ReplicaSpec::builder()
//!     .stack(stack)
//!     .configuration(configuration)
//!     .on_execute(execute_handler)
//!     .on_install_view(install_view_handler)
//!     .build()
//!     .start()?;
//!
//! replica.submit(b"tx1".to_vec())?;
//! ```
//!
//! ### Required setters
//!
//! - `.stack(...)`
//! - `.configuration(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from [crate::events]:
//! - `.on_receive_request(...)`
//! - `.on_pre_prepare(...)`
//! - `.on_receive_pre_prepare(...)`
//! - `.on_prepare(...)`
//! - `.on_commit(...)`
//! - `.on_commit_local(...)`
//! - `.on_execute(...)`
//! - `.on_execution_failed(...)`
//! - `.on_checkpoint(...)`
//! - `.on_stable_checkpoint(...)`
//! - `.on_falling_behind(...)`
//! - `.on_execution_divergence(...)`
//! - `.on_request_timeout(...)`
//! - `.on_equivocation(...)`
//! - `.on_start_view_change(...)`
//! - `.on_view_change_stalled(...)`
//! - `.on_new_view(...)`
//! - `.on_install_view(...)`
//! - `.on_reject_new_view(...)`
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .replica_count(4)
//!     .fault_tolerance(1)
//!     .checkpoint_period(128)
//!     .log_window(256)
//!     .request_timeout(Duration::from_secs(2))
//!     .view_change_timeout(Duration::from_secs(4))
//!     .log_events(true)
//!     .build()
//! ```

use std::{
    fmt::{self, Display, Formatter},
    sync::mpsc::{self, Sender},
    thread::JoinHandle,
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    adapter::{Input, Pbft, PbftError},
    algorithm::Algorithm,
    confidentiality::Confidentiality,
    event_bus::*,
    events::*,
    quorum::QuorumParams,
    stack::Stack,
    types::data_types::{BufferSize, ReplicaID},
};

/// Stores the user-defined parameters of the protocol, that is:
/// 1. The number of replicas in the cluster, `N`, and the number of Byzantine replicas it tolerates, `f`.
///    `N` must equal `3f+1`.
/// 2. The checkpoint period `K`: the replica votes on its state digest every `K` executed sequence
///    numbers.
/// 3. The log window `L`: the primary assigns sequence numbers up to `L` above the last stable
///    checkpoint. `L` must be a positive multiple of `K`.
/// 4. The request timeout, after which a backup suspects the primary of a request that has not
///    committed.
/// 5. The base view-change timeout, and the maximum exponent of its backoff.
/// 6. The number of consecutive failed view changes after which a
///    [`ViewChangeStalled`](crate::events::ViewChangeStalledEvent) alert is published.
/// 7. The capacity of the buffer for messages that arrive ahead of the replica.
/// 8. The interval at which the algorithm thread checks for expired deadlines.
/// 9. The [confidentiality mode](Confidentiality) of request payloads.
/// 10. The "Log Events" flag: if set to "true" then every event is logged.
///
/// ## Log Events
///
/// pbft_rs logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.replica_count(...)`
    - `.fault_tolerance(...)`
    - `.checkpoint_period(...)`
    - `.log_window(...)`
    - `.request_timeout(...)`
    - `.view_change_timeout(...)`
    - `.log_events(...)`

    Optional:
    - `.max_backoff_exponent(...)`
    - `.view_change_alert_threshold(...)`
    - `.msg_buffer_capacity(...)`
    - `.tick_interval(...)`
    - `.confidentiality(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the number of replicas in the cluster. Required."))]
    pub replica_count: u64,
    #[builder(setter(doc = "Set the number of Byzantine replicas the cluster tolerates. Required."))]
    pub fault_tolerance: u64,
    #[builder(setter(doc = "Set the number of sequence numbers between checkpoints. Required."))]
    pub checkpoint_period: u64,
    #[builder(setter(doc = "Set the size of the watermark window. Must be a multiple of the checkpoint period. Required."))]
    pub log_window: u64,
    #[builder(setter(doc = "Set the time a backup waits for a request to commit before suspecting the primary. Required."))]
    pub request_timeout: Duration,
    #[builder(setter(doc = "Set the time a replica waits for a new view before moving on to the next one. Required."))]
    pub view_change_timeout: Duration,
    #[builder(default = 6, setter(doc = "Set the maximum exponent of the view-change timeout backoff. Defaults to 6."))]
    pub max_backoff_exponent: u32,
    #[builder(default = 3, setter(doc = "Set the number of consecutive failed view changes that raise an alert. Defaults to 3."))]
    pub view_change_alert_threshold: u32,
    #[builder(default = BufferSize::new(1024 * 1024), setter(doc = "Set the maximum number of bytes stored in the replica's message buffer. Defaults to 1 MiB."))]
    pub msg_buffer_capacity: BufferSize,
    #[builder(default = Duration::from_millis(10), setter(doc = "Set the interval at which expired deadlines are checked for. Defaults to 10ms."))]
    pub tick_interval: Duration,
    #[builder(default, setter(doc = "Set the confidentiality mode of request payloads. Defaults to plain payloads."))]
    pub confidentiality: Confidentiality,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Configuration {
    /// Check that the parameters describe a workable cluster.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::ClusterSize`] unless `replica_count == 3 * fault_tolerance + 1`.
    /// - [`ConfigurationError::CheckpointPeriod`] if `checkpoint_period` is 0.
    /// - [`ConfigurationError::LogWindow`] unless `log_window` is a positive multiple of
    ///   `checkpoint_period`.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        QuorumParams::new(self.replica_count, self.fault_tolerance)?;
        if self.checkpoint_period == 0 {
            return Err(ConfigurationError::CheckpointPeriod);
        }
        if self.log_window == 0 || self.log_window % self.checkpoint_period != 0 {
            return Err(ConfigurationError::LogWindow {
                log_window: self.log_window,
                checkpoint_period: self.checkpoint_period,
            });
        }
        Ok(())
    }
}

/// Enumerates the ways a [`Configuration`], or the membership reported by the
/// [`Stack`], can be unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    ClusterSize { replicas: u64, faults: u64 },
    CheckpointPeriod,
    LogWindow { log_window: u64, checkpoint_period: u64 },
    MembershipMismatch { configured: u64, reported: u64 },
    UnknownSelf { me: ReplicaID, replicas: u64 },
}

impl Display for ConfigurationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::ClusterSize { replicas, faults } => write!(
                f,
                "{} replicas cannot tolerate {} faults, the cluster must have 3f+1 replicas",
                replicas, faults
            ),
            ConfigurationError::CheckpointPeriod => write!(f, "checkpoint period must be positive"),
            ConfigurationError::LogWindow {
                log_window,
                checkpoint_period,
            } => write!(
                f,
                "log window {} is not a positive multiple of the checkpoint period {}",
                log_window, checkpoint_period
            ),
            ConfigurationError::MembershipMismatch {
                configured,
                reported,
            } => write!(
                f,
                "configured for {} replicas, but the stack reports {}",
                configured, reported
            ),
            ConfigurationError::UnknownSelf { me, replicas } => write!(
                f,
                "replica {} is not a member of a cluster of {}",
                me, replicas
            ),
        }
    }
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.stack(...)`
    - `.configuration(...)`

    Optional: the `.on_*(...)` setters, which register event handlers.
"))]
pub struct ReplicaSpec<S: Stack + 'static> {
    #[builder(setter(doc = "Set the implementation of the surrounding stack. The argument must implement the [Stack](crate::stack::Stack) trait. Required."))]
    stack: S,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the parameters of the protocol. Required."))]
    configuration: Configuration,

    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveRequestEvent>),
    doc = "Register a handler closure to be invoked after a request is stored. Optional."))]
    on_receive_request: Option<HandlerPtr<ReceiveRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrePrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica, as primary, assigns a sequence number to a request. Optional."))]
    on_pre_prepare: Option<HandlerPtr<PrePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePrePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePrePrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica accepts the primary's PrePrepare. Optional."))]
    on_receive_pre_prepare: Option<HandlerPtr<ReceivePrePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a Prepare. Optional."))]
    on_prepare: Option<HandlerPtr<PrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a Commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitLocalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitLocalEvent>),
    doc = "Register a handler closure to be invoked after a request becomes committed-local. Optional."))]
    on_commit_local: Option<HandlerPtr<CommitLocalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExecuteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecuteEvent>),
    doc = "Register a handler closure to be invoked after a sequence number is executed. Optional."))]
    on_execute: Option<HandlerPtr<ExecuteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExecutionFailedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecutionFailedEvent>),
    doc = "Register a handler closure to be invoked after the stack fails to execute a request. Optional."))]
    on_execution_failed: Option<HandlerPtr<ExecutionFailedEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CheckpointEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a checkpoint vote. Optional."))]
    on_checkpoint: Option<HandlerPtr<CheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StableCheckpointEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StableCheckpointEvent>),
    doc = "Register a handler closure to be invoked after a checkpoint becomes stable. Optional."))]
    on_stable_checkpoint: Option<HandlerPtr<StableCheckpointEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&FallingBehindEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<FallingBehindEvent>),
    doc = "Register a handler closure to be invoked after a checkpoint becomes stable above the last executed sequence number. Optional."))]
    on_falling_behind: Option<HandlerPtr<FallingBehindEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExecutionDivergenceEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecutionDivergenceEvent>),
    doc = "Register a handler closure to be invoked after the replica's state digest diverges from the quorum's. Optional."))]
    on_execution_divergence: Option<HandlerPtr<ExecutionDivergenceEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RequestTimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RequestTimeoutEvent>),
    doc = "Register a handler closure to be invoked after a request does not commit in time. Optional."))]
    on_request_timeout: Option<HandlerPtr<RequestTimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&EquivocationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<EquivocationEvent>),
    doc = "Register a handler closure to be invoked after the primary is caught equivocating. Optional."))]
    on_equivocation: Option<HandlerPtr<EquivocationEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartViewChangeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartViewChangeEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a view change. Optional."))]
    on_start_view_change: Option<HandlerPtr<StartViewChangeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewChangeStalledEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewChangeStalledEvent>),
    doc = "Register a handler closure to be invoked after consecutive view changes fail to install a new view. Optional."))]
    on_view_change_stalled: Option<HandlerPtr<ViewChangeStalledEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewViewEvent>),
    doc = "Register a handler closure to be invoked after the replica, as new primary, broadcasts a NewView. Optional."))]
    on_new_view: Option<HandlerPtr<NewViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&InstallViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<InstallViewEvent>),
    doc = "Register a handler closure to be invoked after the replica installs a new view. Optional."))]
    on_install_view: Option<HandlerPtr<InstallViewEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&RejectNewViewEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<RejectNewViewEvent>),
    doc = "Register a handler closure to be invoked after the replica rejects an invalid NewView. Optional."))]
    on_reject_new_view: Option<HandlerPtr<RejectNewViewEvent>>,
}

impl<S: Stack + 'static> ReplicaSpec<S> {
    /// Starts all threads and channels associated with running a replica, and returns the handles to them
    /// in a [Replica] struct.
    ///
    /// # Errors
    ///
    /// Returns [`PbftError::Configuration`] if the configuration is not [valid](Configuration::validate).
    pub fn start(self) -> Result<Replica, PbftError> {
        let mut handlers = EventHandlers::new(self.configuration.log_events);
        register(&mut handlers.receive_request_handlers, self.on_receive_request);
        register(&mut handlers.pre_prepare_handlers, self.on_pre_prepare);
        register(&mut handlers.receive_pre_prepare_handlers, self.on_receive_pre_prepare);
        register(&mut handlers.prepare_handlers, self.on_prepare);
        register(&mut handlers.commit_handlers, self.on_commit);
        register(&mut handlers.commit_local_handlers, self.on_commit_local);
        register(&mut handlers.execute_handlers, self.on_execute);
        register(&mut handlers.execution_failed_handlers, self.on_execution_failed);
        register(&mut handlers.checkpoint_handlers, self.on_checkpoint);
        register(&mut handlers.stable_checkpoint_handlers, self.on_stable_checkpoint);
        register(&mut handlers.falling_behind_handlers, self.on_falling_behind);
        register(&mut handlers.execution_divergence_handlers, self.on_execution_divergence);
        register(&mut handlers.request_timeout_handlers, self.on_request_timeout);
        register(&mut handlers.equivocation_handlers, self.on_equivocation);
        register(&mut handlers.start_view_change_handlers, self.on_start_view_change);
        register(&mut handlers.view_change_stalled_handlers, self.on_view_change_stalled);
        register(&mut handlers.new_view_handlers, self.on_new_view);
        register(&mut handlers.install_view_handlers, self.on_install_view);
        register(&mut handlers.reject_new_view_handlers, self.on_reject_new_view);

        let (event_publisher, event_subscriber) = if !handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let tick_interval = self.configuration.tick_interval;
        let pbft = Pbft::new(self.stack, self.configuration, event_publisher)?;

        let (inputs, input_receiver) = mpsc::channel();
        let (algorithm_shutdown, algorithm_shutdown_receiver) = mpsc::channel();
        let algorithm = Algorithm::new(
            pbft,
            input_receiver,
            algorithm_shutdown_receiver,
            tick_interval,
        )
        .start();

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus =
                    start_event_bus(handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus), Some(event_bus_shutdown))
            }
            None => (None, None),
        };

        Ok(Replica {
            inputs,
            algorithm: Some(algorithm),
            algorithm_shutdown,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A handle to the background threads of a replica. When this value is dropped, all background threads are
/// gracefully shut down.
pub struct Replica {
    inputs: Sender<Input>,
    algorithm: Option<JoinHandle<()>>,
    algorithm_shutdown: Sender<()>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Replica {
    /// Submit a client transaction to the replica.
    pub fn submit(&self, payload: Vec<u8>) -> Result<(), PbftError> {
        self.inputs
            .send(Input::Request(payload))
            .map_err(|_| PbftError::Closed)
    }

    /// Hand a wire-encoded message that the stack received from `sender` to the replica.
    pub fn deliver(&self, raw: Vec<u8>, sender: ReplicaID) -> Result<(), PbftError> {
        self.inputs
            .send(Input::Message { raw, sender })
            .map_err(|_| PbftError::Closed)
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        // The algorithm thread may already have exited, so failing to signal it is not an error.
        if let Some(shutdown) = &self.event_bus_shutdown {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            let _ = event_bus.join();
        }

        let _ = self.algorithm_shutdown.send(());
        if let Some(algorithm) = self.algorithm.take() {
            let _ = algorithm.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configuration(checkpoint_period: u64, log_window: u64) -> Configuration {
        Configuration::builder()
            .replica_count(4)
            .fault_tolerance(1)
            .checkpoint_period(checkpoint_period)
            .log_window(log_window)
            .request_timeout(Duration::from_secs(1))
            .view_change_timeout(Duration::from_secs(2))
            .log_events(false)
            .build()
    }

    #[test]
    fn valid_configuration_passes() {
        let configuration = configuration(2, 4);
        assert_eq!(configuration.validate(), Ok(()));
        assert_eq!(configuration.max_backoff_exponent, 6);
        assert_eq!(configuration.confidentiality, Confidentiality::Plain);
    }

    #[test]
    fn log_window_must_be_a_multiple_of_checkpoint_period() {
        assert_eq!(
            configuration(2, 5).validate(),
            Err(ConfigurationError::LogWindow {
                log_window: 5,
                checkpoint_period: 2
            })
        );
        assert_eq!(
            configuration(0, 4).validate(),
            Err(ConfigurationError::CheckpointPeriod)
        );
    }

    #[test]
    fn cluster_must_have_three_f_plus_one_replicas() {
        let mut configuration = configuration(2, 4);
        configuration.replica_count = 5;
        assert_eq!(
            configuration.validate(),
            Err(ConfigurationError::ClusterSize {
                replicas: 5,
                faults: 1
            })
        );
    }
}
