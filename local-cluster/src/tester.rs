use color_eyre::eyre::{bail, Result};
use std::time::Duration;
use tokio::time::sleep;

use flock_node::{
    msg::{NodeId, Value},
    Node, NodeConfig, Role, Status,
};

use crate::Cluster;

/// Bounded retry-and-sleep assertions over a running cluster. Election
/// timing is randomized, so every check polls with a time bound instead
/// of asserting instantaneous state.
pub struct ClusterTester {
    cluster: Cluster,
}

impl ClusterTester {
    /// Build and start a fully meshed cluster with reproducible election
    /// timing.
    pub fn new(node_count: usize, seed: u64) -> Self {
        let cfg = NodeConfig {
            seed: Some(seed),
            ..NodeConfig::default()
        };
        let cluster = Cluster::with_config(node_count, cfg);
        cluster.start_all();
        ClusterTester { cluster }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub async fn sleep_ms(&self, ms: u64) {
        sleep(Duration::from_millis(ms)).await;
    }

    /// Wait until exactly one alive node holds the leader role and every
    /// alive node recognizes it as leader.
    pub async fn check_one_leader(&self) -> Result<NodeId> {
        for _ in 0..40 {
            sleep(Duration::from_millis(100)).await;
            let alive: Vec<&Node> = self
                .cluster
                .nodes()
                .iter()
                .filter(|node| node.status() == Status::Alive)
                .collect();
            let leaders: Vec<NodeId> = alive
                .iter()
                .filter(|node| node.role() == Role::Leader)
                .map(|node| node.id())
                .collect();
            if let [leader] = leaders[..] {
                if alive.iter().all(|node| node.leader_id() == Some(leader)) {
                    return Ok(leader);
                }
            }
        }
        bail!("no single recognized leader elected in time")
    }

    /// Wait until every alive node's committed log equals `expected`.
    pub async fn wait_for_log(&self, expected: &[Value]) -> Result<()> {
        for _ in 0..40 {
            sleep(Duration::from_millis(100)).await;
            let converged = self
                .cluster
                .nodes()
                .iter()
                .filter(|node| node.status() == Status::Alive)
                .all(|node| node.log() == expected);
            if converged {
                return Ok(());
            }
        }
        bail!("logs did not converge to {expected:?}")
    }
}
