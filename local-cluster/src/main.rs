use color_eyre::eyre::{eyre, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use flock_local_cluster::tester::ClusterTester;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let tester = ClusterTester::new(5, 42);
    let leader = tester.check_one_leader().await?;
    info!(leader, "cluster elected a leader");

    let leader_node = tester
        .cluster()
        .by_id(leader)
        .ok_or_else(|| eyre!("leader disappeared from the cluster"))?;
    for value in [1, 2, 3] {
        leader_node.propose_state(value);
    }
    tester.wait_for_log(&[1, 2, 3]).await?;

    for node in tester.cluster().nodes() {
        info!(node = %node.name(), log = ?node.log(), "replicated state");
    }
    tester.cluster().shutdown().await;
    Ok(())
}
