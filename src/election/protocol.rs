//! Peer Protocol Messages
//!
//! JSON bodies exchanged between nodes on `/election`, `/coordinator`,
//! `/heartbeat` and `/status`. Every election and coordinator message
//! carries the sender's round so stale announcements can be discarded.

use serde::{Deserialize, Serialize};

use crate::cluster::NodeSpec;

/// Election state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionState {
    /// Has a known leader, or none yet
    Follower,
    /// Election in progress
    Electing,
    /// This node is the leader
    Leader,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Follower => write!(f, "FOLLOWER"),
            ElectionState::Electing => write!(f, "ELECTING"),
            ElectionState::Leader => write!(f, "LEADER"),
        }
    }
}

/// `POST /election` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionMessage {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub round: u64,
}

/// Reply to an election message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionReply {
    pub ok: bool,
    /// The receiver outranks the sender and is contending
    #[serde(default)]
    pub alive: bool,
    /// Highest round the receiver has seen
    #[serde(default)]
    pub round: u64,
}

/// `POST /coordinator` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorMessage {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub round: u64,
}

impl CoordinatorMessage {
    pub fn node(&self) -> NodeSpec {
        NodeSpec::new(self.id, self.url.clone())
    }
}

/// Reply to a coordinator announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorReply {
    pub ok: bool,
    /// The receiver now records the announcer as leader
    #[serde(default)]
    pub adopted: bool,
    /// Highest round the receiver has seen
    #[serde(default)]
    pub round: u64,
}

/// `GET /heartbeat` reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub ok: bool,
}

/// `GET /status` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub id: u64,
    pub coordinator_id: Option<u64>,
    pub coordinator_url: Option<String>,
    pub is_coordinator: bool,
    pub state: ElectionState,
    pub round: u64,
}
