//! Heartbeat Prober
//!
//! Periodically pings the current coordinator from every non-coordinator
//! node. A failed or timed-out ping starts a new election.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::engine::ElectionEngine;

/// Result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// No coordinator known, this node is the coordinator, or an
    /// election is running
    Skipped,
    /// The coordinator answered
    Healthy,
    /// The coordinator did not answer; an election ran
    LeaderDown,
}

/// Periodic coordinator liveness check
pub struct HeartbeatProber {
    engine: Arc<ElectionEngine>,
    interval: Duration,
}

impl HeartbeatProber {
    pub fn new(engine: Arc<ElectionEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// Probe until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Heartbeat prober stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Run a single probe
    pub async fn tick(&self) -> ProbeOutcome {
        let Some(leader) = self.engine.current_leader() else {
            return ProbeOutcome::Skipped;
        };
        if leader.id == self.engine.node_id()
            || self.engine.state() == super::ElectionState::Electing
        {
            return ProbeOutcome::Skipped;
        }

        if self.engine.ping_coordinator().await {
            return ProbeOutcome::Healthy;
        }

        tracing::warn!(
            "Coordinator {} ({}) is not responding, starting election",
            leader.id,
            leader.url
        );
        self.engine.start_election().await;
        ProbeOutcome::LeaderDown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::ElectionConfig;
    use crate::transport::memory::MemoryNetwork;

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            election_timeout: Duration::from_millis(300),
            max_attempts: 3,
            heartbeat_interval: Duration::from_millis(50),
            elect_on_start: false,
        }
    }

    #[tokio::test]
    async fn test_leader_failure_triggers_reelection() {
        let net = MemoryNetwork::new();
        let ids = [1, 2, 3];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, fast_config())).collect();
        nodes[2].start_election().await;
        assert_eq!(nodes[0].current_leader().unwrap().id, 3);

        let prober = HeartbeatProber::new(Arc::clone(&nodes[0]), Duration::from_millis(50));
        assert_eq!(prober.tick().await, ProbeOutcome::Healthy);

        net.set_down(3, true);
        assert_eq!(prober.tick().await, ProbeOutcome::LeaderDown);

        // Node 1 asked node 2, which took over
        for _ in 0..100 {
            if nodes[0].current_leader().map(|l| l.id) == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(nodes[0].current_leader().unwrap().id, 2);
        assert!(nodes[1].is_leader());
    }

    /// Poll until every node reports `leader`, or give up at `deadline`
    async fn converge(nodes: &[Arc<ElectionEngine>], leader: u64, deadline: Duration) -> bool {
        tokio::time::timeout(deadline, async {
            loop {
                if nodes.iter().all(|n| n.status().coordinator_id == Some(leader)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn test_running_nodes_fail_over_within_two_intervals() {
        let config = ElectionConfig {
            election_timeout: Duration::from_millis(200),
            max_attempts: 3,
            heartbeat_interval: Duration::from_millis(50),
            elect_on_start: true,
        };
        let net = MemoryNetwork::new();
        let ids = [1, 2, 3];
        let nodes: Vec<_> = ids.iter().map(|&id| net.spawn_node(id, &ids, config.clone())).collect();

        let cancel = CancellationToken::new();
        for node in &nodes {
            tokio::spawn(Arc::clone(node).start(cancel.child_token()));
        }
        assert!(converge(&nodes, 3, Duration::from_secs(2)).await, "nodes never agreed on 3");

        net.set_down(3, true);
        let bound = config.heartbeat_interval * 2 + config.election_timeout;
        let survivors = &nodes[..2];
        assert!(
            converge(survivors, 2, bound).await,
            "survivors did not elect 2 within {:?}",
            bound
        );
        assert!(nodes[1].is_leader());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_leader_skips_probe() {
        let net = MemoryNetwork::new();
        let engine = net.spawn_node(1, &[1], fast_config());
        engine.start_election().await;

        let prober = HeartbeatProber::new(Arc::clone(&engine), Duration::from_millis(50));
        assert_eq!(prober.tick().await, ProbeOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_no_known_leader_skips_probe() {
        let net = MemoryNetwork::new();
        let engine = net.spawn_node(1, &[1, 2], fast_config());

        let prober = HeartbeatProber::new(engine, Duration::from_millis(50));
        assert_eq!(prober.tick().await, ProbeOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let net = MemoryNetwork::new();
        let engine = net.spawn_node(1, &[1, 2], fast_config());
        let prober = HeartbeatProber::new(engine, Duration::from_millis(10));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { prober.run(cancel).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
