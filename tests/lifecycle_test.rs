use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Instant,
};

use log::LevelFilter;
use pbft_rs::{
    adapter::{Pbft, PbftError, ReplicaStatus, Status},
    events::Event,
    persistence::paths,
    replica::ConfigurationError,
    stack::StackError,
    types::data_types::{ReplicaID, SequenceNumber, ViewNumber},
};

mod common;

use crate::common::{
    cluster::{configuration, Cluster},
    logging::setup_logger,
    stack::{authenticators, MockStack},
};

fn lone_stack() -> MockStack {
    let authenticator = authenticators(4).remove(0);
    MockStack::new(
        ReplicaID::new(0),
        4,
        authenticator,
        Arc::new(Mutex::new(VecDeque::new())),
    )
}

#[test]
fn invalid_configuration_is_rejected() {
    setup_logger(LevelFilter::Trace);

    let result = Pbft::new(lone_stack(), configuration(4, 1, 2, 3), None);
    assert!(matches!(
        result,
        Err(PbftError::Configuration(ConfigurationError::LogWindow {
            log_window: 3,
            checkpoint_period: 2
        }))
    ));

    let result = Pbft::new(lone_stack(), configuration(3, 1, 2, 4), None);
    assert!(matches!(
        result,
        Err(PbftError::Configuration(ConfigurationError::ClusterSize {
            replicas: 3,
            faults: 1
        }))
    ));
}

#[test]
fn membership_mismatch_keeps_the_replica_uninitialized() {
    setup_logger(LevelFilter::Trace);

    let mut pbft = Pbft::new(lone_stack().reporting_replicas(7), configuration(4, 1, 2, 4), None).unwrap();
    pbft.request(b"tx1".to_vec()).unwrap();

    assert_eq!(
        pbft.initialize(),
        Err(PbftError::Configuration(
            ConfigurationError::MembershipMismatch {
                configured: 4,
                reported: 7
            }
        ))
    );
    assert_eq!(pbft.status(), ReplicaStatus::Uninitialized);
    assert_eq!(pbft.view(), None);
    assert!(pbft.stack().is_some());
}

#[test]
fn inputs_before_initialization_are_replayed_in_order() {
    setup_logger(LevelFilter::Trace);

    // 1. Submit two requests to replica 0 before any replica is initialized.
    let mut cluster = Cluster::build(configuration(4, 1, 2, 4), |_, stack| stack);
    cluster.replica(0).request(b"tx1".to_vec()).unwrap();
    cluster.replica(0).request(b"tx2".to_vec()).unwrap();
    assert_eq!(cluster.replica(0).status(), ReplicaStatus::Uninitialized);
    assert_eq!(cluster.replica(0).tick(Instant::now()), Ok(()));

    // 2. Initialize every replica. Replica 0 replays its requests, in submission order.
    cluster.initialize_all();
    cluster.deliver_all();
    for replica in 0..4 {
        assert_eq!(
            cluster.executed(replica),
            vec![
                (SequenceNumber::new(1), b"tx1".to_vec()),
                (SequenceNumber::new(2), b"tx2".to_vec())
            ]
        );
    }
}

#[test]
fn messages_before_initialization_are_replayed() {
    setup_logger(LevelFilter::Trace);

    // 1. Replica 3 learns its membership late. Everything sent to it in the meantime is queued.
    let mut cluster = Cluster::build(configuration(4, 1, 2, 4), |_, stack| stack);
    for replica in 0..3 {
        cluster.initialize(replica);
    }
    cluster.replica(0).request(b"tx1".to_vec()).unwrap();
    cluster.deliver_all();
    for replica in 0..3 {
        assert_eq!(cluster.executed(replica).len(), 1);
    }
    assert!(cluster.executed(3).is_empty());

    // 2. Once initialized, replica 3 processes the queued messages and catches up.
    cluster.initialize(3);
    cluster.deliver_all();
    assert_eq!(
        cluster.executed(3),
        vec![(SequenceNumber::new(1), b"tx1".to_vec())]
    );
    assert_eq!(
        cluster.replica(3).status(),
        ReplicaStatus::Active(Status::Normal)
    );
}

#[test]
fn closed_replica_refuses_every_input() {
    setup_logger(LevelFilter::Trace);

    let mut cluster = Cluster::new(configuration(4, 1, 2, 4));
    cluster.replica(0).request(b"tx1".to_vec()).unwrap();
    cluster.replica(0).close();

    assert_eq!(cluster.replica(0).status(), ReplicaStatus::Closed);
    assert_eq!(
        cluster.replica(0).request(b"tx2".to_vec()),
        Err(PbftError::Closed)
    );
    assert_eq!(
        cluster.replica(0).receive(Vec::new(), ReplicaID::new(1)),
        Err(PbftError::Closed)
    );
    assert_eq!(
        cluster.replica(0).tick(Instant::now()),
        Err(PbftError::Closed)
    );
    assert_eq!(cluster.replica(0).initialize(), Err(PbftError::Closed));
    assert_eq!(cluster.replica(0).view(), None);
    assert_eq!(cluster.replica(0).last_executed(), None);

    // Closing twice is harmless.
    cluster.replica(0).close();
    assert_eq!(cluster.replica(0).status(), ReplicaStatus::Closed);
}

#[test]
fn restarted_primary_resumes_where_it_stopped() {
    setup_logger(LevelFilter::Trace);

    // 1. Execute three requests, so that the checkpoint at 2 is stable and 3 is executed past it.
    let mut cluster = Cluster::new(configuration(4, 1, 2, 4));
    for i in 1..=3 {
        cluster
            .replica(0)
            .request(format!("tx{}", i).into_bytes())
            .unwrap();
    }
    cluster.deliver_all();
    let before = cluster.executed(0);
    assert_eq!(before.len(), 3);

    // 2. Restart the primary. It comes back with the same watermark and execution position, and does
    // not execute anything again.
    log::debug!("Restarting replica 0.");
    cluster.restart(0);
    assert_eq!(
        cluster.replica(0).status(),
        ReplicaStatus::Active(Status::Normal)
    );
    assert_eq!(cluster.replica(0).view(), Some(ViewNumber::init()));
    assert_eq!(cluster.replica(0).low_watermark(), Some(SequenceNumber::new(2)));
    assert_eq!(cluster.replica(0).last_executed(), Some(SequenceNumber::new(3)));
    assert_eq!(cluster.executed(0), before);

    // 3. The next request is assigned after the last sequence number the primary used before it
    // restarted, and every replica executes it once.
    cluster.replica(0).request(b"tx4".to_vec()).unwrap();
    cluster.deliver_all();
    for replica in 0..4 {
        let executed = cluster.executed(replica);
        assert_eq!(executed.len(), 4);
        assert_eq!(executed[3], (SequenceNumber::new(4), b"tx4".to_vec()));
        assert_eq!(
            cluster.replica(replica).low_watermark(),
            Some(SequenceNumber::new(4))
        );
    }
    assert!(!cluster
        .events(1)
        .iter()
        .any(|event| matches!(event, Event::Equivocation(_))));
}

#[test]
fn restarted_backup_stays_in_the_view_it_installed() {
    setup_logger(LevelFilter::Trace);

    // 1. The primary of view 0 crashes, and the others move to view 1.
    let mut cluster = Cluster::new(configuration(4, 1, 2, 4));
    cluster.crash(0);
    cluster.replica(1).request(b"tx1".to_vec()).unwrap();
    cluster.deliver_all();
    cluster.expire_deadlines();
    for replica in 1..4 {
        assert_eq!(cluster.replica(replica).view(), Some(ViewNumber::new(1)));
    }

    // 2. Replica 3 restarts straight into view 1.
    cluster.restart(3);
    assert_eq!(cluster.replica(3).view(), Some(ViewNumber::new(1)));
    assert_eq!(cluster.replica(3).last_executed(), Some(SequenceNumber::new(1)));

    // 3. It takes part in view 1 as before.
    cluster.replica(2).request(b"tx2".to_vec()).unwrap();
    cluster.deliver_all();
    assert_eq!(
        cluster.executed(3),
        vec![
            (SequenceNumber::new(1), b"tx1".to_vec()),
            (SequenceNumber::new(2), b"tx2".to_vec())
        ]
    );
}

#[test]
fn unreadable_stored_state_keeps_the_replica_uninitialized() {
    setup_logger(LevelFilter::Trace);

    let stack = lone_stack();
    stack.overwrite_state(&paths::VIEW, vec![1]);
    let mut pbft = Pbft::new(stack, configuration(4, 1, 2, 4), None).unwrap();
    pbft.request(b"tx1".to_vec()).unwrap();

    assert!(matches!(
        pbft.initialize(),
        Err(PbftError::Stack(StackError::Storage(_)))
    ));
    assert_eq!(pbft.status(), ReplicaStatus::Uninitialized);
    assert!(pbft.stack().is_some());
}
