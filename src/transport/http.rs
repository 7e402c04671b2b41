//! HTTP Peer Transport
//!
//! JSON over HTTP with per-call timeouts: heartbeats use the short probe
//! timeout, everything else the general request timeout.

use std::time::Duration;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::PeerTransport;
use crate::cluster::NodeSpec;
use crate::election::protocol::{
    CoordinatorMessage, CoordinatorReply, ElectionMessage, ElectionReply, HeartbeatReply,
};
use crate::error::{Error, Result};

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    /// Timeout for election and coordinator calls
    request_timeout: Duration,
    /// Timeout for heartbeat probes
    heartbeat_timeout: Duration,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(request_timeout: Duration, heartbeat_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            request_timeout,
            heartbeat_timeout,
        })
    }

    async fn post<B, R>(&self, url: String, body: &B) -> Result<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;

        if !response.status().is_success() {
            return Err(Error::PeerUnreachable {
                address: url,
                reason: format!("status {}", response.status()),
            });
        }

        response.json::<R>().await.map_err(|e| classify(&url, e))
    }
}

/// Map a reqwest failure onto the peer-unreachable taxonomy
fn classify(url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ConnectionTimeout(url.to_string())
    } else {
        Error::PeerUnreachable {
            address: url.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn send_election(&self, peer: &NodeSpec, msg: &ElectionMessage) -> Result<ElectionReply> {
        self.post(format!("{}/election", peer.url), msg).await
    }

    async fn send_coordinator(
        &self,
        peer: &NodeSpec,
        msg: &CoordinatorMessage,
    ) -> Result<CoordinatorReply> {
        self.post(format!("{}/coordinator", peer.url), msg).await
    }

    async fn heartbeat(&self, peer: &NodeSpec) -> Result<()> {
        let url = format!("{}/heartbeat", peer.url);
        let response = self
            .client
            .get(&url)
            .timeout(self.heartbeat_timeout)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;

        if !response.status().is_success() {
            return Err(Error::PeerUnreachable {
                address: url,
                reason: format!("status {}", response.status()),
            });
        }

        let reply: HeartbeatReply = response.json().await.map_err(|e| classify(&url, e))?;
        if reply.ok {
            Ok(())
        } else {
            Err(Error::PeerUnreachable {
                address: url,
                reason: "heartbeat reported not ok".into(),
            })
        }
    }
}
