use ahash::{HashMap, HashMapExt};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::{
    atomic::{AtomicU64, AtomicU8, Ordering},
    Arc, Mutex,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, info, warn};

pub mod mailbox;
pub mod membership;
pub mod msg;

use mailbox::{Mailbox, NodeHandle};
use membership::Membership;
use msg::{
    Envelope, InboxRecord, MessageKind, NodeId, Value, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT,
    HEARTBEAT_TIMEOUT_JITTER,
};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Follower = 0,
    Leader = 1,
}

impl Role {
    fn from_u8(v: u8) -> Role {
        match v {
            0 => Role::Follower,
            _ => Role::Leader,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Alive = 0,
    Stopped = 1,
    Failed = 2,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Alive,
            1 => Status::Stopped,
            _ => Status::Failed,
        }
    }
}

/// Timing knobs for one node. The seed makes the receive-window jitter,
/// and therefore election timing, reproducible in tests.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub timeout_jitter: Duration,
    pub seed: Option<u64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            timeout_jitter: HEARTBEAT_TIMEOUT_JITTER,
            seed: None,
        }
    }
}

/// State shared between the driver-facing surface and the node's two
/// loops. The membership set and leader reference are mutated from more
/// than one task, so they sit behind their own locks.
struct Shared {
    handle: NodeHandle,
    status: AtomicU8,
    role: AtomicU8,
    neighbors: Membership,
    leader: Mutex<Option<NodeHandle>>,
    log: Mutex<Vec<Value>>,
    inbox_log: Mutex<Vec<InboxRecord>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::SeqCst))
    }

    fn set_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::SeqCst);
    }

    fn leader(&self) -> Option<NodeHandle> {
        self.leader.lock().unwrap().clone()
    }

    fn set_leader(&self, leader: Option<NodeHandle>) {
        *self.leader.lock().unwrap() = leader;
    }

    fn record(&self, envelope: &Envelope) {
        self.inbox_log.lock().unwrap().push(InboxRecord {
            sender: envelope.sender.id(),
            kind: envelope.kind.clone(),
        });
    }

    /// Fan a message out to every current neighbor. Snapshots the
    /// membership first so no lock is held while enqueuing.
    fn broadcast(&self, kind: MessageKind) {
        for peer in self.neighbors.handles() {
            peer.deliver(&self.handle, kind.clone());
        }
    }
}

/// One actor in the simulated cluster. Owns a mailbox and a membership
/// set; `start()` spawns its message loop and heartbeat loop.
pub struct Node {
    inner: Arc<Shared>,
    cfg: NodeConfig,
    mailbox: Mutex<Option<Mailbox>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub fn new(name: &str) -> Self {
        Node::with_config(name, NodeConfig::default())
    }

    pub fn with_config(name: &str, cfg: NodeConfig) -> Self {
        let id = NEXT_NODE_ID.fetch_add(1, Ordering::SeqCst);
        let (handle, mailbox) = Mailbox::new(id, name);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(Shared {
            handle,
            status: AtomicU8::new(Status::Alive as u8),
            role: AtomicU8::new(Role::Follower as u8),
            neighbors: Membership::new(),
            leader: Mutex::new(None),
            log: Mutex::new(Vec::new()),
            inbox_log: Mutex::new(Vec::new()),
            shutdown,
        });
        Node {
            inner,
            cfg,
            mailbox: Mutex::new(Some(mailbox)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.handle.id()
    }

    pub fn name(&self) -> &str {
        self.inner.handle.name()
    }

    /// The address other nodes use to message this one.
    pub fn handle(&self) -> NodeHandle {
        self.inner.handle.clone()
    }

    pub fn add_neighbor(&self, peer: &Node) {
        self.inner.neighbors.add(peer.handle());
    }

    pub fn remove_neighbor(&self, id: NodeId) {
        self.inner.neighbors.remove(id);
    }

    /// Spawn the message loop and the heartbeat loop. A second call is a
    /// no-op: the mailbox has already been handed to the running loop.
    pub fn start(&self) {
        let Some(mailbox) = self.mailbox.lock().unwrap().take() else {
            return;
        };
        let rng = match self.cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let message_loop = MessageLoop {
            shared: self.inner.clone(),
            mailbox,
            cfg: self.cfg.clone(),
            votes: HashMap::new(),
            rng,
            shutdown: self.inner.shutdown.subscribe(),
        };
        let messages = tokio::spawn(message_loop.run());
        let heartbeats = tokio::spawn(heartbeat_loop(
            self.inner.clone(),
            self.cfg.heartbeat_interval,
            self.inner.shutdown.subscribe(),
        ));
        self.tasks.lock().unwrap().extend([messages, heartbeats]);
    }

    /// Request graceful termination. Idempotent; never downgrades a
    /// `Failed` status.
    pub fn stop(&self) {
        let _ = self.inner.status.compare_exchange(
            Status::Alive as u8,
            Status::Stopped as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.inner.shutdown.send(true);
    }

    /// Simulate a crash: terminate both loops, empty the own neighbor
    /// set, and tell every former neighbor to detach. Each peer drops the
    /// failed node from its membership (and forgets it as leader) on the
    /// peer's own message loop.
    pub fn fail(&self) {
        self.inner.status.store(Status::Failed as u8, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(true);
        let peers = self.inner.neighbors.handles();
        self.inner.neighbors.clear();
        for peer in &peers {
            peer.deliver(&self.inner.handle, MessageKind::Detach);
        }
    }

    /// Inject a state-change request as if from an anonymous external
    /// client: the node sends itself a `ProposeState` message.
    pub fn propose_state(&self, value: Value) {
        self.inner
            .handle
            .deliver(&self.inner.handle, MessageKind::ProposeState(value));
    }

    /// Wait until both loops have terminated. Returns promptly when the
    /// node was never started or was already joined.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    pub fn status(&self) -> Status {
        self.inner.status()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.leader().map(|l| l.id())
    }

    /// Committed replicated values, in commit order.
    pub fn log(&self) -> Vec<Value> {
        self.inner.log.lock().unwrap().clone()
    }

    /// Every non-housekeeping message this node processed, in receipt
    /// order.
    pub fn inbox_log(&self) -> Vec<InboxRecord> {
        self.inner.inbox_log.lock().unwrap().clone()
    }

    pub fn neighbor_ids(&self) -> Vec<NodeId> {
        self.inner.neighbors.ids()
    }
}

/// The message-processing state machine. Runs until the node is stopped
/// or failed, or its mailbox becomes unavailable.
struct MessageLoop {
    shared: Arc<Shared>,
    mailbox: Mailbox,
    cfg: NodeConfig,
    /// voter id -> candidate id for the in-progress election round.
    votes: HashMap<NodeId, NodeId>,
    rng: StdRng,
    shutdown: watch::Receiver<bool>,
}

impl MessageLoop {
    async fn run(mut self) {
        while self.shared.status() == Status::Alive {
            let window = self.cfg.heartbeat_timeout + self.jitter();
            let received = tokio::select! {
                res = self.mailbox.receive(window) => res,
                _ = self.shutdown.changed() => break,
            };
            let envelope = match received {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(node = %self.shared.handle.name(), %err, "message loop terminating");
                    break;
                }
            };
            if self.shared.status() != Status::Alive {
                break;
            }
            if !envelope.kind.is_housekeeping() {
                self.shared.record(&envelope);
            }
            self.dispatch(envelope);
        }
        debug!(node = %self.shared.handle.name(), "message loop exited");
    }

    /// Receive windows are randomized so the cluster's election timers
    /// never fire in lockstep.
    fn jitter(&mut self) -> Duration {
        let bound_ms = self.cfg.timeout_jitter.as_millis() as u64;
        Duration::from_millis(self.rng.gen_range(0..=bound_ms))
    }

    fn dispatch(&mut self, envelope: Envelope) {
        let Envelope { sender, kind } = envelope;
        match kind {
            MessageKind::Heartbeat => self.receive_heartbeat(sender),
            MessageKind::ProposeState(value) => self.receive_propose_state(value),
            MessageKind::LogState(value) => self.receive_log_state(value),
            MessageKind::LeaderElectionRequest => self.receive_election_request(sender),
            MessageKind::LeaderElectionVote { candidate } => self.receive_vote(sender, candidate),
            MessageKind::SetLeader => self.receive_set_leader(sender),
            MessageKind::Timeout => self.receive_timeout(),
            MessageKind::Detach => self.receive_detach(sender),
        }
    }

    /// Liveness signal only: nothing to update, the next receive window
    /// restarts the timeout race by itself.
    fn receive_heartbeat(&self, sender: NodeHandle) {
        let recognized = self.shared.leader().map(|l| l.id()) == Some(sender.id());
        if !recognized {
            warn!(
                node = %self.shared.handle.name(),
                from = %sender.name(),
                "heartbeat from a sender that is not the recognized leader"
            );
        }
    }

    fn receive_propose_state(&mut self, value: Value) {
        if self.shared.role() == Role::Leader {
            self.commit(value);
            return;
        }
        match self.shared.leader() {
            Some(leader) => {
                debug!(
                    node = %self.shared.handle.name(),
                    to = %leader.name(),
                    value,
                    "forwarding state proposal to leader"
                );
                leader.deliver(&self.shared.handle, MessageKind::ProposeState(value));
            }
            None => {
                warn!(
                    node = %self.shared.handle.name(),
                    value,
                    "no leader known, dropping state proposal"
                );
            }
        }
    }

    /// Leader-only write path: append locally, then push the value to
    /// every neighbor.
    fn commit(&mut self, value: Value) {
        assert_eq!(
            self.shared.role(),
            Role::Leader,
            "commit requested at a non-leader"
        );
        self.shared.log.lock().unwrap().push(value);
        self.shared.broadcast(MessageKind::LogState(value));
    }

    fn receive_log_state(&self, value: Value) {
        self.shared.log.lock().unwrap().push(value);
    }

    /// Vote unconditionally for whoever solicited the vote. No
    /// eligibility check, by design.
    fn receive_election_request(&self, sender: NodeHandle) {
        debug!(
            node = %self.shared.handle.name(),
            candidate = %sender.name(),
            "voting for election initiator"
        );
        let vote = MessageKind::LeaderElectionVote {
            candidate: sender.id(),
        };
        sender.deliver(&self.shared.handle, vote);
    }

    fn receive_vote(&mut self, voter: NodeHandle, candidate: NodeId) {
        self.votes.insert(voter.id(), candidate);
        let round_size = self.shared.neighbors.len();
        debug!(
            node = %self.shared.handle.name(),
            voter = %voter.name(),
            candidate,
            collected = self.votes.len(),
            round_size,
            "recorded vote"
        );
        if round_size == 0 || self.votes.len() != round_size {
            return;
        }
        // One vote per current neighbor collected: tally and reset, win
        // or lose.
        let own_id = self.shared.handle.id();
        let for_me = self.votes.values().filter(|c| **c == own_id).count();
        if for_me > round_size / 2 {
            info!(
                node = %self.shared.handle.name(),
                votes = for_me,
                round_size,
                "won election, becoming leader"
            );
            self.become_leader();
        } else {
            debug!(
                node = %self.shared.handle.name(),
                votes = for_me,
                round_size,
                "election round lost, waiting for next timeout"
            );
        }
        self.votes.clear();
    }

    fn become_leader(&mut self) {
        self.shared.set_role(Role::Leader);
        self.shared.set_leader(Some(self.shared.handle.clone()));
        self.shared.broadcast(MessageKind::SetLeader);
    }

    /// Adopt the sender as leader unconditionally, demoting ourselves if
    /// necessary. There is no term or recency check, by design.
    fn receive_set_leader(&mut self, sender: NodeHandle) {
        info!(
            node = %self.shared.handle.name(),
            leader = %sender.name(),
            "adopting leader"
        );
        self.shared.set_role(Role::Follower);
        self.shared.set_leader(Some(sender));
    }

    /// Nothing arrived within the receive window. A leader expects
    /// silence; anyone else suspects the leader and starts an election.
    fn receive_timeout(&mut self) {
        if self.shared.role() == Role::Leader {
            return;
        }
        self.start_election();
    }

    fn start_election(&mut self) {
        assert_ne!(
            self.shared.role(),
            Role::Leader,
            "election started while already leader"
        );
        debug!(
            node = %self.shared.handle.name(),
            "receive window expired, requesting votes"
        );
        self.shared.broadcast(MessageKind::LeaderElectionRequest);
    }

    fn receive_detach(&mut self, sender: NodeHandle) {
        self.shared.neighbors.remove(sender.id());
        if self.shared.leader().map(|l| l.id()) == Some(sender.id()) {
            warn!(
                node = %self.shared.handle.name(),
                failed = %sender.name(),
                "leader failed, clearing leader reference"
            );
            self.shared.set_leader(None);
        }
    }
}

/// Fixed-period loop: while this node is the leader, broadcast a
/// heartbeat to every current neighbor each tick.
async fn heartbeat_loop(
    shared: Arc<Shared>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        if shared.status() != Status::Alive {
            return;
        }
        if shared.role() == Role::Leader {
            shared.broadcast(MessageKind::Heartbeat);
        }
    }
}
