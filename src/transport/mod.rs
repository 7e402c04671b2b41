//! Peer Transport
//!
//! How the election engine reaches other nodes. Every call is a bounded
//! request/response; an error of any kind means the peer is treated as
//! down for the current round.

mod http;
#[cfg(test)]
pub mod memory;

pub use http::HttpTransport;

use async_trait::async_trait;

use crate::cluster::NodeSpec;
use crate::election::protocol::{
    CoordinatorMessage, CoordinatorReply, ElectionMessage, ElectionReply,
};
use crate::error::Result;

/// Outbound peer calls used by the election engine and heartbeat prober
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Ask a higher-ranked peer to take part in an election
    async fn send_election(&self, peer: &NodeSpec, msg: &ElectionMessage) -> Result<ElectionReply>;

    /// Announce a new coordinator to a peer
    async fn send_coordinator(
        &self,
        peer: &NodeSpec,
        msg: &CoordinatorMessage,
    ) -> Result<CoordinatorReply>;

    /// Liveness probe; `Ok` only if the peer answered in time
    async fn heartbeat(&self, peer: &NodeSpec) -> Result<()>;
}
