//! Bully Election Engine
//!
//! Each node runs one engine. An election contacts every higher-ranked
//! peer; if none answers, the node proclaims itself coordinator and tells
//! everyone else. If a higher peer answers, the node waits (bounded) for
//! that peer's announcement and retries the round when it never comes.
//!
//! Rounds replace the missing term number of the classic algorithm: every
//! message carries one, and an announcement older than the highest round a
//! node has seen is discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::prober::HeartbeatProber;
use super::protocol::{
    CoordinatorMessage, CoordinatorReply, ElectionMessage, ElectionReply, ElectionState,
    StatusReply,
};
use crate::cluster::{ClusterMembership, NodeSpec};
use crate::config::CoordinatorConfig;
use crate::transport::PeerTransport;

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long to wait for a higher node's announcement
    pub election_timeout: Duration,
    /// Rounds attempted before an election gives up
    pub max_attempts: u32,
    /// Leader polling interval
    pub heartbeat_interval: Duration,
    /// Run an election when the engine starts
    pub elect_on_start: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_secs(3),
            max_attempts: 3,
            heartbeat_interval: Duration::from_secs(5),
            elect_on_start: true,
        }
    }
}

impl From<&CoordinatorConfig> for ElectionConfig {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            election_timeout: config.election_timeout(),
            max_attempts: config.cluster.max_election_attempts.max(1),
            heartbeat_interval: config.heartbeat_interval(),
            elect_on_start: config.cluster.elect_on_start,
        }
    }
}

/// Leadership as currently known by this node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderView {
    /// Current leader, if any
    pub leader: Option<NodeSpec>,
    /// Round under which the current leader was announced
    pub leader_round: u64,
    /// Highest round seen in any message
    pub highest_round: u64,
    /// Incremented every time the leader identity changes
    pub epoch: u64,
}

/// How a call to `start_election` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node proclaimed itself coordinator
    Won,
    /// A higher node announced itself
    Yielded(u64),
    /// Another election on this node was already running
    AlreadyRunning,
    /// Higher nodes acknowledged but none announced within the attempts
    Inconclusive,
}

/// What happened to an incoming coordinator announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announcement {
    Adopted,
    Stale,
    Challenged,
}

/// Clears the in-progress flag when an election returns
struct ElectionGuard<'a>(&'a AtomicBool);

impl<'a> ElectionGuard<'a> {
    fn try_begin(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ElectionGuard(flag))
    }
}

impl Drop for ElectionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bully election engine for one node
pub struct ElectionEngine {
    /// Fixed cluster membership
    cluster: ClusterMembership,
    /// Outbound peer calls
    transport: Arc<dyn PeerTransport>,
    /// Election configuration
    config: ElectionConfig,
    /// Election in progress
    electing: AtomicBool,
    /// Leader reference and rounds; subscribers are notified on adoption
    view: watch::Sender<LeaderView>,
}

impl ElectionEngine {
    /// Create a new election engine
    pub fn new(
        cluster: ClusterMembership,
        transport: Arc<dyn PeerTransport>,
        config: ElectionConfig,
    ) -> Self {
        let (view, _) = watch::channel(LeaderView::default());
        Self {
            cluster,
            transport,
            config,
            electing: AtomicBool::new(false),
            view,
        }
    }

    /// This node's ID
    pub fn node_id(&self) -> u64 {
        self.cluster.node_id()
    }

    /// This node's identity
    pub fn local(&self) -> &NodeSpec {
        self.cluster.local()
    }

    /// Current leader, if known
    pub fn current_leader(&self) -> Option<NodeSpec> {
        self.view.borrow().leader.clone()
    }

    /// Snapshot of the leadership view
    pub fn view(&self) -> LeaderView {
        self.view.borrow().clone()
    }

    /// Whether this node is the leader
    pub fn is_leader(&self) -> bool {
        self.view
            .borrow()
            .leader
            .as_ref()
            .is_some_and(|l| l.id == self.node_id())
    }

    /// Current state; a node that has proclaimed itself reports `Leader`
    /// even while its announcement is still being broadcast
    pub fn state(&self) -> ElectionState {
        if self.is_leader() {
            ElectionState::Leader
        } else if self.electing.load(Ordering::Acquire) {
            ElectionState::Electing
        } else {
            ElectionState::Follower
        }
    }

    /// Leadership changes; every adoption or proclamation notifies
    pub fn subscribe(&self) -> watch::Receiver<LeaderView> {
        self.view.subscribe()
    }

    /// Status as served on `/status`
    pub fn status(&self) -> StatusReply {
        let view = self.view();
        let id = self.node_id();
        StatusReply {
            id,
            coordinator_id: view.leader.as_ref().map(|l| l.id),
            coordinator_url: view.leader.as_ref().map(|l| l.url.clone()),
            is_coordinator: view.leader.as_ref().is_some_and(|l| l.id == id),
            state: self.state(),
            round: view.highest_round,
        }
    }

    /// Run the initial election (if configured) and then the heartbeat
    /// prober until cancelled
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            "Election engine starting for node {} ({} nodes)",
            self.node_id(),
            self.cluster.size()
        );

        if self.config.elect_on_start {
            tokio::select! {
                _ = cancel.cancelled() => return,
                outcome = self.start_election() => {
                    tracing::info!("Initial election finished: {:?}", outcome);
                }
            }
        }

        let prober = HeartbeatProber::new(Arc::clone(&self), self.config.heartbeat_interval);
        prober.run(cancel).await;
    }

    /// Start an election. No-op if one is already running on this node.
    pub async fn start_election(self: &Arc<Self>) -> ElectionOutcome {
        let Some(_guard) = ElectionGuard::try_begin(&self.electing) else {
            tracing::debug!("Election already in progress on node {}", self.node_id());
            return ElectionOutcome::AlreadyRunning;
        };

        let higher = self.cluster.higher_peers();

        for attempt in 1..=self.config.max_attempts {
            let round = self.next_round();
            tracing::info!(
                "Node {} starting election round {} (attempt {}/{})",
                self.node_id(),
                round,
                attempt,
                self.config.max_attempts
            );

            if higher.is_empty() {
                tracing::info!("Node {} has no higher peers", self.node_id());
                return self.proclaim(round).await;
            }

            if self.solicit(&higher, round).await == 0 {
                tracing::info!("No higher node answered round {}", round);
                return self.proclaim(round).await;
            }

            if let Some(leader) = self.await_announcement(round).await {
                tracing::info!("Node {} yields to node {}", self.node_id(), leader.id);
                return ElectionOutcome::Yielded(leader.id);
            }

            tracing::warn!(
                "Higher node acknowledged round {} but never announced, retrying",
                round
            );
            let max_backoff = self.config.election_timeout.as_millis() as u64 / 4;
            let backoff = rand::thread_rng().gen_range(0..=max_backoff);
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        tracing::warn!("Election on node {} was inconclusive", self.node_id());
        ElectionOutcome::Inconclusive
    }

    /// Send election messages to every higher peer; returns how many
    /// acknowledged as alive and higher
    async fn solicit(&self, higher: &[NodeSpec], round: u64) -> usize {
        let msg = ElectionMessage {
            id: self.node_id(),
            url: self.local().url.clone(),
            round,
        };

        let replies = join_all(
            higher
                .iter()
                .map(|peer| self.transport.send_election(peer, &msg)),
        )
        .await;

        let mut acks = 0;
        for (peer, reply) in higher.iter().zip(replies) {
            match reply {
                Ok(reply) => {
                    self.observe_round(reply.round);
                    if reply.alive {
                        tracing::debug!("Node {} acknowledged election round {}", peer.id, round);
                        acks += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to contact node {} ({}): {}", peer.id, peer.url, e);
                }
            }
        }
        acks
    }

    /// Wait for a higher node to announce itself at `round` or later
    async fn await_announcement(&self, round: u64) -> Option<NodeSpec> {
        let mut rx = self.view.subscribe();
        let me = self.node_id();

        let wait = async {
            loop {
                {
                    let view = rx.borrow_and_update();
                    if let Some(leader) = &view.leader {
                        if leader.id > me && view.leader_round >= round {
                            return Some(leader.clone());
                        }
                    }
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };

        tokio::time::timeout(self.config.election_timeout, wait)
            .await
            .ok()
            .flatten()
    }

    /// Become coordinator and broadcast the announcement. A peer that
    /// reports a newer round makes the node re-announce under a fresh one.
    async fn proclaim(&self, mut round: u64) -> ElectionOutcome {
        let peers: Vec<NodeSpec> = self.cluster.peers().cloned().collect();

        for _ in 0..self.config.max_attempts {
            self.install_self(round);
            tracing::info!("Node {} is now COORDINATOR (round {})", self.node_id(), round);

            let msg = CoordinatorMessage {
                id: self.node_id(),
                url: self.local().url.clone(),
                round,
            };
            let replies = join_all(
                peers
                    .iter()
                    .map(|peer| self.transport.send_coordinator(peer, &msg)),
            )
            .await;

            let mut newer = None;
            for (peer, reply) in peers.iter().zip(replies) {
                match reply {
                    Ok(reply) if !reply.adopted && reply.round > round => {
                        newer = newer.max(Some(reply.round));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Failed to notify node {}: {}", peer.id, e);
                    }
                }
            }

            match newer {
                Some(seen) => {
                    tracing::info!("A peer has seen round {}, re-announcing", seen);
                    self.observe_round(seen);
                    round = self.next_round();
                }
                None => break,
            }
        }

        ElectionOutcome::Won
    }

    /// Answer an election message from another node
    pub fn handle_election_request(self: &Arc<Self>, msg: &ElectionMessage) -> ElectionReply {
        self.observe_round(msg.round);
        tracing::info!("Node {} received election from node {}", self.node_id(), msg.id);
        if self.cluster.get(msg.id).is_none() {
            tracing::warn!("Election message from node {} outside the membership", msg.id);
        }

        if self.local().outranks(msg.id) {
            tracing::info!("Node {} outranks node {}, contending", self.node_id(), msg.id);
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.start_election().await;
            });
            ElectionReply {
                ok: true,
                alive: true,
                round: self.view.borrow().highest_round,
            }
        } else {
            tracing::debug!("Ignoring election from higher node {}", msg.id);
            ElectionReply {
                ok: true,
                alive: false,
                round: self.view.borrow().highest_round,
            }
        }
    }

    /// Apply a coordinator announcement from another node
    pub fn handle_coordinator_announcement(
        self: &Arc<Self>,
        msg: &CoordinatorMessage,
    ) -> CoordinatorReply {
        let me = self.node_id();
        let node = msg.node();
        let outranked = self.local().outranks(msg.id);
        let mut outcome = Announcement::Stale;

        if self.cluster.get(msg.id).is_none() {
            tracing::warn!("Announcement from node {} outside the membership", msg.id);
        }

        self.view.send_if_modified(|view| {
            if msg.round < view.highest_round {
                outcome = Announcement::Stale;
                return false;
            }
            view.highest_round = msg.round;
            if outranked {
                outcome = Announcement::Challenged;
                return false;
            }
            if view.leader.as_ref() != Some(&node) {
                view.epoch += 1;
            }
            view.leader = Some(node.clone());
            view.leader_round = msg.round;
            outcome = Announcement::Adopted;
            true
        });

        match outcome {
            Announcement::Adopted => {
                tracing::info!("Node {} recognises coordinator {} ({})", me, msg.id, msg.url);
            }
            Announcement::Stale => {
                tracing::warn!(
                    "Discarding stale announcement from node {} (round {})",
                    msg.id,
                    msg.round
                );
            }
            Announcement::Challenged => {
                tracing::info!("Lower node {} announced itself, challenging", msg.id);
                let engine = Arc::clone(self);
                tokio::spawn(async move {
                    engine.start_election().await;
                });
            }
        }

        CoordinatorReply {
            ok: true,
            adopted: outcome == Announcement::Adopted,
            round: self.view.borrow().highest_round,
        }
    }

    /// Probe the current leader; errors and timeouts both count as dead
    pub async fn ping_coordinator(&self) -> bool {
        let Some(leader) = self.current_leader() else {
            return false;
        };
        match self.transport.heartbeat(&leader).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Heartbeat to node {} failed: {}", leader.id, e);
                false
            }
        }
    }

    /// Bump and return the round for a new election
    fn next_round(&self) -> u64 {
        let mut round = 0;
        self.view.send_if_modified(|view| {
            view.highest_round += 1;
            round = view.highest_round;
            false
        });
        round
    }

    /// Record a round seen in a message
    fn observe_round(&self, round: u64) {
        self.view.send_if_modified(|view| {
            if round > view.highest_round {
                view.highest_round = round;
            }
            false
        });
    }

    /// Record self as leader under `round`
    fn install_self(&self, round: u64) {
        let local = self.local().clone();
        self.view.send_modify(|view| {
            view.highest_round = view.highest_round.max(round);
            if view.leader.as_ref() != Some(&local) {
                view.epoch += 1;
            }
            view.leader = Some(local);
            view.leader_round = round;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            election_timeout: Duration::from_millis(300),
            max_attempts: 3,
            heartbeat_interval: Duration::from_millis(50),
            elect_on_start: false,
        }
    }

    async fn wait_for_leader(engine: &ElectionEngine, id: u64) -> bool {
        for _ in 0..100 {
            if engine.current_leader().map(|l| l.id) == Some(id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_single_node_proclaims_itself() {
        let net = MemoryNetwork::new();
        let engine = net.spawn_node(1, &[1], fast_config());

        assert_eq!(engine.start_election().await, ElectionOutcome::Won);
        let status = engine.status();
        assert!(status.is_coordinator);
        assert_eq!(status.coordinator_id, Some(1));
        assert_eq!(status.state, ElectionState::Leader);
    }

    #[tokio::test]
    async fn test_highest_node_wins_without_asking() {
        let net = MemoryNetwork::new();
        let ids = [1, 2, 3];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();

        assert_eq!(nodes[2].start_election().await, ElectionOutcome::Won);
        assert_eq!(nodes[0].current_leader().unwrap().id, 3);
        assert_eq!(nodes[1].current_leader().unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_concurrent_elections_converge_on_highest() {
        let net = MemoryNetwork::new();
        let ids = [1, 2, 3];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();

        let (a, b, c) = tokio::join!(
            nodes[0].start_election(),
            nodes[1].start_election(),
            nodes[2].start_election()
        );
        assert_eq!(c, ElectionOutcome::Won);
        assert_ne!(a, ElectionOutcome::Won);
        assert_ne!(b, ElectionOutcome::Won);

        for node in &nodes {
            assert!(wait_for_leader(node, 3).await, "node {} disagrees", node.node_id());
            assert_eq!(node.status().coordinator_id, Some(3));
        }
    }

    #[tokio::test]
    async fn test_unreachable_higher_nodes_means_self_wins() {
        let net = MemoryNetwork::new();
        let ids = [1, 2, 3];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();
        net.set_down(2, true);
        net.set_down(3, true);

        assert_eq!(nodes[0].start_election().await, ElectionOutcome::Won);
        assert!(nodes[0].is_leader());
    }

    #[tokio::test]
    async fn test_election_request_from_lower_node() {
        let net = MemoryNetwork::new();
        let ids = [1, 2];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();

        let reply = nodes[1].handle_election_request(&ElectionMessage {
            id: 1,
            url: net.url(1),
            round: 1,
        });
        assert!(reply.alive);

        // Node 2 contends upward, wins, and node 1 learns about it
        assert!(wait_for_leader(&nodes[0], 2).await);
        assert!(nodes[1].is_leader());
    }

    #[tokio::test]
    async fn test_election_request_from_higher_node_is_ignored() {
        let net = MemoryNetwork::new();
        let ids = [1, 2];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();

        let reply = nodes[0].handle_election_request(&ElectionMessage {
            id: 2,
            url: net.url(2),
            round: 4,
        });
        assert!(!reply.alive);
        assert_eq!(reply.round, 4);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(nodes[0].current_leader().is_none());
        assert!(nodes[1].current_leader().is_none());
    }

    #[tokio::test]
    async fn test_stale_announcement_is_discarded() {
        let net = MemoryNetwork::new();
        let engine = net.spawn_node(1, &[1, 2, 3], fast_config());

        let fresh = engine.handle_coordinator_announcement(&CoordinatorMessage {
            id: 3,
            url: net.url(3),
            round: 5,
        });
        assert!(fresh.adopted);

        let stale = engine.handle_coordinator_announcement(&CoordinatorMessage {
            id: 2,
            url: net.url(2),
            round: 4,
        });
        assert!(!stale.adopted);
        assert_eq!(stale.round, 5);
        assert_eq!(engine.current_leader().unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_epoch_changes_only_with_leader_identity() {
        let net = MemoryNetwork::new();
        let engine = net.spawn_node(1, &[1, 2, 3], fast_config());
        let announce = |id, round| CoordinatorMessage { id, url: net.url(id), round };

        engine.handle_coordinator_announcement(&announce(3, 1));
        let first = engine.view().epoch;
        engine.handle_coordinator_announcement(&announce(3, 2));
        assert_eq!(engine.view().epoch, first);
        engine.handle_coordinator_announcement(&announce(2, 3));
        assert_eq!(engine.view().epoch, first + 1);
    }

    #[tokio::test]
    async fn test_restarted_node_catches_up_on_rounds() {
        let net = MemoryNetwork::new();
        let ids = [1, 2, 3];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();

        // Node 3 is away while 1 and 2 run several rounds
        net.set_down(3, true);
        for _ in 0..3 {
            nodes[1].start_election().await;
        }
        assert!(nodes[0].view().highest_round >= 3);

        // Node 3 returns with its rounds reset
        net.set_down(3, false);
        let fresh = net.spawn_node(3, &ids, fast_config());
        assert_eq!(fresh.start_election().await, ElectionOutcome::Won);

        assert!(wait_for_leader(&nodes[0], 3).await);
        assert!(wait_for_leader(&nodes[1], 3).await);
    }

    #[tokio::test]
    async fn test_lower_announcement_is_challenged() {
        let net = MemoryNetwork::new();
        let ids = [1, 2];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();

        let reply = nodes[1].handle_coordinator_announcement(&CoordinatorMessage {
            id: 1,
            url: net.url(1),
            round: 1,
        });
        assert!(!reply.adopted);

        assert!(wait_for_leader(&nodes[0], 2).await);
        assert!(nodes[1].is_leader());
    }

    #[tokio::test]
    async fn test_ping_coordinator() {
        let net = MemoryNetwork::new();
        let ids = [1, 2];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();

        assert!(!nodes[0].ping_coordinator().await);
        nodes[1].start_election().await;
        assert!(nodes[0].ping_coordinator().await);

        net.set_down(2, true);
        assert!(!nodes[0].ping_coordinator().await);
    }

    /// Transport whose announcements hang until released
    #[derive(Default)]
    struct StalledAnnouncements(tokio::sync::Notify);

    #[async_trait::async_trait]
    impl PeerTransport for StalledAnnouncements {
        async fn send_election(
            &self,
            peer: &NodeSpec,
            _msg: &ElectionMessage,
        ) -> crate::error::Result<ElectionReply> {
            Err(crate::error::Error::PeerUnreachable {
                address: peer.url.clone(),
                reason: "stalled".into(),
            })
        }

        async fn send_coordinator(
            &self,
            _peer: &NodeSpec,
            msg: &CoordinatorMessage,
        ) -> crate::error::Result<CoordinatorReply> {
            self.0.notified().await;
            Ok(CoordinatorReply { ok: true, adopted: true, round: msg.round })
        }

        async fn heartbeat(&self, _peer: &NodeSpec) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_reports_leader_while_announcement_is_in_flight() {
        let transport = Arc::new(StalledAnnouncements::default());
        let cluster = ClusterMembership::new(
            NodeSpec::new(2, "http://n2"),
            [NodeSpec::new(1, "http://n1"), NodeSpec::new(2, "http://n2")],
        );
        let engine = Arc::new(ElectionEngine::new(
            cluster,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            fast_config(),
        ));

        let election = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.start_election().await }
        });
        assert!(wait_for_leader(&engine, 2).await);

        // Still broadcasting to node 1
        assert!(!election.is_finished());
        let status = engine.status();
        assert!(status.is_coordinator);
        assert_eq!(status.state, ElectionState::Leader);

        transport.0.notify_one();
        assert_eq!(election.await.unwrap(), ElectionOutcome::Won);
        assert_eq!(engine.state(), ElectionState::Leader);
    }
}
