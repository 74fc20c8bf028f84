use flock_node::{msg::NodeId, Node, NodeConfig};

pub mod tester;

/// External driver for a fully meshed cluster of nodes run in one
/// process. Constructs the nodes, wires every pair as neighbors, and
/// drives their lifecycle; all protocol behavior lives in the nodes.
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    pub fn new(node_count: usize) -> Self {
        Cluster::with_config(node_count, NodeConfig::default())
    }

    /// When a base seed is set, each node gets its own derived seed so
    /// election timers are reproducible but never in lockstep.
    pub fn with_config(node_count: usize, cfg: NodeConfig) -> Self {
        let nodes: Vec<Node> = (0..node_count)
            .map(|i| {
                let node_cfg = NodeConfig {
                    seed: cfg.seed.map(|seed| seed.wrapping_add(7919 * i as u64)),
                    ..cfg.clone()
                };
                Node::with_config(&format!("node-{i}"), node_cfg)
            })
            .collect();
        for a in &nodes {
            for b in &nodes {
                if a.id() != b.id() {
                    a.add_neighbor(b);
                }
            }
        }
        Cluster { nodes }
    }

    pub fn start_all(&self) {
        for node in &self.nodes {
            node.start();
        }
    }

    pub fn stop_all(&self) {
        for node in &self.nodes {
            node.stop();
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn by_id(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id() == id)
    }

    /// Stop every node and wait for all loops to wind down.
    pub async fn shutdown(&self) {
        self.stop_all();
        for node in &self.nodes {
            node.join().await;
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop_all();
    }
}
