//! In-process transport for multi-node election tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use async_trait::async_trait;

use super::PeerTransport;
use crate::cluster::{ClusterMembership, NodeSpec};
use crate::election::protocol::{
    CoordinatorMessage, CoordinatorReply, ElectionMessage, ElectionReply,
};
use crate::election::{ElectionConfig, ElectionEngine};
use crate::error::{Error, Result};

/// A set of engines wired together without sockets
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<u64, Arc<ElectionEngine>>>,
    down: RwLock<HashSet<u64>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn url(&self, id: u64) -> String {
        format!("mem://node-{}", id)
    }

    /// Create an engine for `id` and register it, replacing any previous
    /// engine with the same id
    pub fn spawn_node(
        self: &Arc<Self>,
        id: u64,
        members: &[u64],
        config: ElectionConfig,
    ) -> Arc<ElectionEngine> {
        let local = NodeSpec::new(id, self.url(id));
        let cluster = ClusterMembership::new(
            local,
            members.iter().map(|&m| NodeSpec::new(m, self.url(m))),
        );
        let transport = Arc::new(MemoryTransport {
            local_id: id,
            net: Arc::downgrade(self),
        });
        let engine = Arc::new(ElectionEngine::new(cluster, transport, config));
        self.nodes.write().unwrap().insert(id, Arc::clone(&engine));
        engine
    }

    /// Partition a node away from everyone else
    pub fn set_down(&self, id: u64, down: bool) {
        let mut set = self.down.write().unwrap();
        if down {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    fn route(&self, from: u64, to: &NodeSpec) -> Result<Arc<ElectionEngine>> {
        let down = self.down.read().unwrap();
        if down.contains(&from) || down.contains(&to.id) {
            return Err(Error::PeerUnreachable {
                address: to.url.clone(),
                reason: "partitioned".into(),
            });
        }
        self.nodes
            .read()
            .unwrap()
            .get(&to.id)
            .cloned()
            .ok_or_else(|| Error::PeerUnreachable {
                address: to.url.clone(),
                reason: "no such node".into(),
            })
    }
}

/// Transport handle owned by one engine
pub struct MemoryTransport {
    local_id: u64,
    net: Weak<MemoryNetwork>,
}

impl MemoryTransport {
    fn target(&self, peer: &NodeSpec) -> Result<Arc<ElectionEngine>> {
        let net = self.net.upgrade().ok_or(Error::ShuttingDown)?;
        net.route(self.local_id, peer)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn send_election(&self, peer: &NodeSpec, msg: &ElectionMessage) -> Result<ElectionReply> {
        let target = self.target(peer)?;
        Ok(target.handle_election_request(msg))
    }

    async fn send_coordinator(
        &self,
        peer: &NodeSpec,
        msg: &CoordinatorMessage,
    ) -> Result<CoordinatorReply> {
        let target = self.target(peer)?;
        Ok(target.handle_coordinator_announcement(msg))
    }

    async fn heartbeat(&self, peer: &NodeSpec) -> Result<()> {
        self.target(peer).map(|_| ())
    }
}
