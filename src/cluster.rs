//! Cluster Membership
//!
//! The fixed list of nodes taking part in elections. Membership is
//! provided at startup and never changes while the process runs.

use std::collections::BTreeMap;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Numeric identifier and election rank
    pub id: u64,
    /// Base URL the node serves its HTTP API on
    pub url: String,
}

impl NodeSpec {
    pub fn new(id: u64, url: impl Into<String>) -> Self {
        Self { id, url: url.into() }
    }

    /// Whether this node outranks another in an election
    pub fn outranks(&self, other_id: u64) -> bool {
        self.id > other_id
    }
}

impl std::fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.id, self.url)
    }
}

impl FromStr for NodeSpec {
    type Err = Error;

    /// Parse an `id|url` entry
    fn from_str(s: &str) -> Result<Self> {
        let (id, url) = s
            .split_once('|')
            .ok_or_else(|| Error::InvalidPeer(s.to_string()))?;
        let id = id
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::InvalidPeer(s.to_string()))?;
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() {
            return Err(Error::InvalidPeer(s.to_string()));
        }
        Ok(NodeSpec::new(id, url))
    }
}

/// Static cluster membership as seen from one node
#[derive(Debug, Clone)]
pub struct ClusterMembership {
    /// This node
    local: NodeSpec,
    /// Every other node, ordered by id
    peers: BTreeMap<u64, NodeSpec>,
}

impl ClusterMembership {
    /// Build membership from the configured list; entries for the local id
    /// are dropped so the list may include this node.
    pub fn new(local: NodeSpec, members: impl IntoIterator<Item = NodeSpec>) -> Self {
        let peers = members
            .into_iter()
            .filter(|n| n.id != local.id)
            .map(|n| (n.id, n))
            .collect();
        Self { local, peers }
    }

    /// This node's identity
    pub fn local(&self) -> &NodeSpec {
        &self.local
    }

    /// This node's ID
    pub fn node_id(&self) -> u64 {
        self.local.id
    }

    /// All other nodes
    pub fn peers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.peers.values()
    }

    /// Nodes ranked above this one
    pub fn higher_peers(&self) -> Vec<NodeSpec> {
        self.peers
            .range(self.local.id.saturating_add(1)..)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Look up a node (including self) by id
    pub fn get(&self, id: u64) -> Option<&NodeSpec> {
        if id == self.local.id {
            Some(&self.local)
        } else {
            self.peers.get(&id)
        }
    }

    /// Total cluster size including self
    pub fn size(&self) -> usize {
        self.peers.len() + 1
    }
}
