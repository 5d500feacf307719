use std::time::Duration;

use log::LevelFilter;
use pbft_rs::{
    adapter::{ReplicaStatus, Status},
    events::Event,
    networking::messages::Message,
    types::data_types::{SequenceNumber, ViewNumber},
};

mod common;

use crate::common::{
    cluster::{configuration, Cluster},
    logging::setup_logger,
};

#[test]
fn silent_primary_is_replaced() {
    setup_logger(LevelFilter::Trace);

    // 1. The primary of view 0 crashes before a request is submitted.
    let mut cluster = Cluster::new(configuration(4, 1, 2, 4));
    cluster.crash(0);

    // 2. Submit tx1 to replica 1. Every live backup starts a deadline for it, and nothing commits.
    log::debug!("Submitting tx1 to replica 1.");
    cluster.replica(1).request(b"tx1".to_vec()).unwrap();
    cluster.deliver_all();
    for replica in 1..4 {
        assert!(cluster.executed(replica).is_empty());
    }

    // 3. The deadlines expire, the backups move to view 1, and replica 1 becomes its primary.
    cluster.expire_deadlines();
    for replica in 1..4 {
        assert_eq!(cluster.replica(replica).view(), Some(ViewNumber::new(1)));
        assert_eq!(
            cluster.replica(replica).status(),
            ReplicaStatus::Active(Status::Normal)
        );
        let events = cluster.events(replica);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::RequestTimeout(timeout) if timeout.view == ViewNumber::init())));
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::InstallView(install) if install.view == ViewNumber::new(1))));
        assert_eq!(
            cluster.replica(replica).stack().unwrap().installed_views(),
            vec![ViewNumber::new(1)]
        );
    }

    // 4. The new primary re-proposes tx1, and it executes at sequence number 1.
    for replica in 1..4 {
        assert_eq!(
            cluster.executed(replica),
            vec![(SequenceNumber::new(1), b"tx1".to_vec())]
        );
    }

    // 5. Execution continues without gaps in the new view.
    cluster.replica(2).request(b"tx2".to_vec()).unwrap();
    cluster.deliver_all();
    for replica in 1..4 {
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
fn prepared_request_survives_the_view_change() {
    setup_logger(LevelFilter::Trace);

    // 1. Every Commit of view 0 is lost, so tx1 prepares everywhere but commits nowhere.
    let mut cluster = Cluster::new(configuration(4, 1, 2, 4));
    cluster.set_drop_filter(|_, message| {
        matches!(message, Message::Commit(commit) if commit.message.view == ViewNumber::init())
    });
    cluster.replica(0).request(b"tx1".to_vec()).unwrap();
    cluster.deliver_all();
    for replica in 0..4 {
        assert!(cluster.executed(replica).is_empty());
    }

    // 2. The backups time out and carry their prepared certificates for sequence number 1 into their
    // view changes. Replica 0 joins in once it sees f+1 of them.
    cluster.expire_deadlines();

    // 3. The new view re-issues tx1 at the same sequence number, and every replica executes it once.
    for replica in 0..4 {
        assert_eq!(cluster.replica(replica).view(), Some(ViewNumber::new(1)));
        assert_eq!(
            cluster.executed(replica),
            vec![(SequenceNumber::new(1), b"tx1".to_vec())]
        );
    }
    let new_view = cluster
        .events(1)
        .into_iter()
        .find_map(|event| match event {
            Event::NewView(new_view) => Some(new_view.new_view),
            _ => None,
        })
        .unwrap();
    assert_eq!(new_view.pre_prepares.len(), 1);
    assert_eq!(new_view.pre_prepares[0].message.seq, SequenceNumber::new(1));
    assert!(!new_view.pre_prepares[0].message.digest.is_null());
}

#[test]
fn view_change_moves_on_when_the_next_primary_is_also_faulty() {
    setup_logger(LevelFilter::Trace);

    // 1. The primary of view 0 withholds its PrePrepares, and the primary of view 1 has crashed.
    let mut cluster = Cluster::new(configuration(4, 1, 2, 4));
    cluster.set_drop_filter(|_, message| {
        matches!(message, Message::PrePrepare(pre_prepare) if pre_prepare.message.view == ViewNumber::init())
    });
    cluster.crash(1);
    cluster.replica(2).request(b"tx1".to_vec()).unwrap();
    cluster.deliver_all();

    // 2. The first view change stalls, because replica 1 never sends a NewView.
    cluster.expire_deadlines();
    for replica in [0, 2, 3] {
        assert_eq!(
            cluster.replica(replica).status(),
            ReplicaStatus::Active(Status::ViewChanging {
                target: ViewNumber::new(1)
            })
        );
    }

    // 3. The view-change deadline expires, and the replicas move on to view 2 with a doubled deadline.
    cluster.expire_deadlines();
    let timeouts: Vec<_> = cluster
        .events(2)
        .into_iter()
        .filter_map(|event| match event {
            Event::StartViewChange(start) => Some((start.view_change.new_view, start.timeout)),
            _ => None,
        })
        .collect();
    assert_eq!(
        timeouts,
        vec![
            (ViewNumber::new(1), Duration::from_secs(1)),
            (ViewNumber::new(2), Duration::from_secs(2))
        ]
    );

    // 4. Replica 2 is the primary of view 2, and orders tx1.
    for replica in [0, 2, 3] {
        assert_eq!(cluster.replica(replica).view(), Some(ViewNumber::new(2)));
        assert_eq!(
            cluster.executed(replica),
            vec![(SequenceNumber::new(1), b"tx1".to_vec())]
        );
    }
}

#[test]
fn stale_view_change_is_answered_with_the_new_view() {
    setup_logger(LevelFilter::Trace);

    // 1. Replica 3 is cut off while the Commits of view 0 are lost, so the others move to view 1
    // without it.
    let mut cluster = Cluster::new(configuration(4, 1, 2, 4));
    cluster.set_drop_filter(|envelope, message| {
        envelope.to.int() == 3
            || envelope.from.int() == 3
            || matches!(message, Message::Commit(commit) if commit.message.view == ViewNumber::init())
    });
    cluster.replica(0).request(b"tx1".to_vec()).unwrap();
    cluster.deliver_all();
    cluster.expire_deadlines();
    for replica in 0..3 {
        assert_eq!(cluster.replica(replica).view(), Some(ViewNumber::new(1)));
    }
    assert_eq!(cluster.replica(3).view(), Some(ViewNumber::init()));

    // 2. Replica 3 reconnects and submits a request. The primary of view 1 orders it, but replica 3
    // buffers the PrePrepare because it is still in view 0.
    cluster.clear_drop_filter();
    cluster.replica(3).request(b"tx2".to_vec()).unwrap();
    cluster.deliver_all();
    assert_eq!(cluster.replica(3).view(), Some(ViewNumber::init()));

    // 3. Replica 3 times out and broadcasts a view change for view 1. The primary of view 1 answers with
    // the NewView it already sent, and replica 3 installs it.
    cluster.expire_deadlines();
    assert_eq!(cluster.replica(3).view(), Some(ViewNumber::new(1)));
    assert_eq!(
        cluster.replica(3).status(),
        ReplicaStatus::Active(Status::Normal)
    );
    assert!(cluster
        .events(3)
        .iter()
        .any(|event| matches!(event, Event::InstallView(install) if install.view == ViewNumber::new(1))));
}

#[test]
fn null_request_keeps_execution_gapless() {
    setup_logger(LevelFilter::Trace);

    // 1. The PrePrepare for sequence number 1 and every Commit of view 0 are lost. tx2 prepares at
    // sequence number 2, while sequence number 1 prepares nowhere.
    let mut cluster = Cluster::new(configuration(4, 1, 4, 8));
    cluster.set_drop_filter(|_, message| match message {
        Message::PrePrepare(pre_prepare) => {
            pre_prepare.message.view == ViewNumber::init() && pre_prepare.message.seq == SequenceNumber::new(1)
        }
        Message::Commit(commit) => commit.message.view == ViewNumber::init(),
        _ => false,
    });
    log::debug!("Submitting tx1 and tx2 to replica 0.");
    cluster.replica(0).request(b"tx1".to_vec()).unwrap();
    cluster.replica(0).request(b"tx2".to_vec()).unwrap();
    cluster.deliver_all();
    for replica in 0..4 {
        assert!(cluster.executed(replica).is_empty());
    }

    // 2. The backups time out. The NewView fills sequence number 1 with a null request and re-issues
    // tx2 at sequence number 2, and the new primary orders tx1 after them.
    cluster.expire_deadlines();
    let new_view = cluster
        .events(1)
        .into_iter()
        .find_map(|event| match event {
            Event::NewView(new_view) => Some(new_view.new_view),
            _ => None,
        })
        .unwrap();
    assert_eq!(new_view.pre_prepares.len(), 2);
    assert!(new_view.pre_prepares[0].message.digest.is_null());
    assert!(!new_view.pre_prepares[1].message.digest.is_null());

    // 3. Every replica hands the stack every sequence number, in order, the null one included.
    for replica in 0..4 {
        assert_eq!(cluster.replica(replica).view(), Some(ViewNumber::new(1)));
        assert_eq!(
            cluster.executed(replica),
            vec![
                (SequenceNumber::new(1), Vec::new()),
                (SequenceNumber::new(2), b"tx2".to_vec()),
                (SequenceNumber::new(3), b"tx1".to_vec())
            ]
        );
        assert_eq!(cluster.replica(replica).last_executed(), Some(SequenceNumber::new(3)));
    }
}
