use std::{
    collections::{HashSet, VecDeque},
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use pbft_rs::{
    adapter::{Pbft, PbftError},
    events::Event,
    networking::messages::Message,
    replica::Configuration,
    types::{
        crypto_primitives::Ed25519Authenticator,
        data_types::{ReplicaID, SequenceNumber},
    },
};

use super::stack::{authenticators, Envelope, MockStack, Outbox};

/// Predicate that decides whether an envelope is lost on the wire.
pub(crate) type DropFilter = Box<dyn Fn(&Envelope, &Message) -> bool>;

/// A configuration with short deadlines for an `n`-replica cluster that tolerates `f` faults.
pub(crate) fn configuration(
    n: u64,
    f: u64,
    checkpoint_period: u64,
    log_window: u64,
) -> Configuration {
    Configuration::builder()
        .replica_count(n)
        .fault_tolerance(f)
        .checkpoint_period(checkpoint_period)
        .log_window(log_window)
        .request_timeout(Duration::from_millis(500))
        .view_change_timeout(Duration::from_secs(1))
        .log_events(true)
        .build()
}

/// A cluster of [`Pbft`] replicas connected by a single FIFO [`Outbox`].
///
/// Nothing happens until the test calls [`deliver_all`](Self::deliver_all) or [`advance`](Self::advance), so
/// every interleaving a test exercises is deterministic.
pub(crate) struct Cluster {
    pub(crate) replicas: Vec<Pbft<MockStack>>,
    pub(crate) authenticators: Vec<Ed25519Authenticator>,
    configuration: Configuration,
    outbox: Outbox,
    events: Vec<Receiver<Event>>,
    crashed: HashSet<ReplicaID>,
    drop_filter: Option<DropFilter>,
    clock: Instant,
    /// Every envelope delivered so far, in delivery order.
    pub(crate) delivered: Vec<Envelope>,
}

impl Cluster {
    /// Build and initialize a cluster.
    pub(crate) fn new(configuration: Configuration) -> Self {
        let mut cluster = Self::build(configuration, |_, stack| stack);
        cluster.initialize_all();
        cluster
    }

    /// Build an uninitialized cluster, passing each replica's stack through `customize` first.
    pub(crate) fn build(
        configuration: Configuration,
        customize: impl Fn(ReplicaID, MockStack) -> MockStack,
    ) -> Self {
        let n = configuration.replica_count;
        let outbox: Outbox = Arc::new(Mutex::new(VecDeque::new()));
        let authenticators = authenticators(n);
        let mut replicas = Vec::new();
        let mut events = Vec::new();
        for (i, authenticator) in authenticators.iter().enumerate() {
            let me = ReplicaID::new(i as u64);
            let stack = customize(me, MockStack::new(me, n, authenticator.clone(), outbox.clone()));
            let (event_publisher, event_subscriber) = mpsc::channel();
            replicas.push(Pbft::new(stack, configuration.clone(), Some(event_publisher)).unwrap());
            events.push(event_subscriber);
        }
        Self {
            replicas,
            authenticators,
            configuration,
            outbox,
            events,
            crashed: HashSet::new(),
            drop_filter: None,
            clock: Instant::now(),
            delivered: Vec::new(),
        }
    }

    pub(crate) fn initialize(&mut self, replica: u64) {
        self.replicas[replica as usize].initialize().unwrap()
    }

    pub(crate) fn initialize_all(&mut self) {
        for replica in 0..self.replicas.len() as u64 {
            self.initialize(replica)
        }
    }

    pub(crate) fn replica(&mut self, replica: u64) -> &mut Pbft<MockStack> {
        &mut self.replicas[replica as usize]
    }

    /// Stop delivering messages to and from `replica`, and stop ticking it.
    pub(crate) fn crash(&mut self, replica: u64) {
        self.crashed.insert(ReplicaID::new(replica));
    }

    /// Close `replica`, then start and initialize a fresh one over the same stack. Messages sent to the
    /// replica while it was down are lost.
    pub(crate) fn restart(&mut self, replica: u64) {
        let i = replica as usize;
        let stack = self.replicas[i].stack().unwrap().reopen();
        self.replicas[i].close();
        self.outbox
            .lock()
            .unwrap()
            .retain(|envelope| envelope.to != ReplicaID::new(replica));

        let (event_publisher, event_subscriber) = mpsc::channel();
        self.replicas[i] =
            Pbft::new(stack, self.configuration.clone(), Some(event_publisher)).unwrap();
        self.events[i] = event_subscriber;
        self.crashed.remove(&ReplicaID::new(replica));
        self.initialize(replica);
    }

    pub(crate) fn set_drop_filter(&mut self, filter: impl Fn(&Envelope, &Message) -> bool + 'static) {
        self.drop_filter = Some(Box::new(filter))
    }

    pub(crate) fn clear_drop_filter(&mut self) {
        self.drop_filter = None
    }

    /// Put an envelope on the wire, as if `from` had sent it.
    pub(crate) fn inject(&mut self, from: u64, to: u64, payload: Vec<u8>) {
        self.outbox.lock().unwrap().push_back(Envelope {
            from: ReplicaID::new(from),
            to: ReplicaID::new(to),
            payload,
        })
    }

    /// Deliver messages in FIFO order until the wire is empty. Returns the number delivered.
    pub(crate) fn deliver_all(&mut self) -> usize {
        let mut count = 0;
        loop {
            let envelope = match self.outbox.lock().unwrap().pop_front() {
                Some(envelope) => envelope,
                None => return count,
            };
            if self.crashed.contains(&envelope.from) || self.crashed.contains(&envelope.to) {
                continue;
            }
            if let Some(filter) = &self.drop_filter {
                let dropped = match Message::decode(&envelope.payload) {
                    Ok(message) => filter(&envelope, &message),
                    Err(_) => false,
                };
                if dropped {
                    continue;
                }
            }

            let result = self.replicas[envelope.to.int() as usize]
                .receive(envelope.payload.clone(), envelope.from);
            match result {
                Ok(()) | Err(PbftError::Halted) | Err(PbftError::Closed) => (),
                Err(err) => log::debug!("replica {} failed to receive: {}", envelope.to, err),
            }
            self.delivered.push(envelope);
            count += 1;
        }
    }

    /// Move the cluster's clock forward by `duration`, tick every live replica at the new time, then
    /// deliver the resulting traffic.
    pub(crate) fn advance(&mut self, duration: Duration) {
        self.clock = self.clock.max(Instant::now()) + duration;
        for (i, replica) in self.replicas.iter_mut().enumerate() {
            if !self.crashed.contains(&ReplicaID::new(i as u64)) {
                let _ = replica.tick(self.clock);
            }
        }
        self.deliver_all();
    }

    /// Advance the clock far enough that every armed deadline expires.
    pub(crate) fn expire_deadlines(&mut self) {
        self.advance(Duration::from_secs(120))
    }

    /// Take every event `replica` has published since the last call.
    pub(crate) fn events(&self, replica: u64) -> Vec<Event> {
        self.events[replica as usize].try_iter().collect()
    }

    pub(crate) fn executed(&self, replica: u64) -> Vec<(SequenceNumber, Vec<u8>)> {
        self.replicas[replica as usize]
            .stack()
            .map(MockStack::executed)
            .unwrap_or_default()
    }
}
