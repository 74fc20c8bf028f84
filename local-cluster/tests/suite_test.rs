use std::time::Duration;

use tokio::time::{sleep, timeout};

use flock_local_cluster::tester::ClusterTester;
use flock_node::{
    msg::{InboxRecord, MessageKind},
    Node, NodeConfig, Role, Status,
};

/// Config with receive windows far beyond the test horizon, for tests
/// that must observe a node before any timeout-triggered election fires.
fn quiet_config(seed: u64) -> NodeConfig {
    NodeConfig {
        heartbeat_timeout: Duration::from_secs(5),
        timeout_jitter: Duration::from_millis(1),
        seed: Some(seed),
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn eventual_single_leader() {
    let tester = ClusterTester::new(5, 11);
    let leader = tester.check_one_leader().await.unwrap();

    // With heartbeats flowing, no follower times out and leadership
    // stays put.
    tester.sleep_ms(1000).await;
    assert_eq!(tester.check_one_leader().await.unwrap(), leader);
    tester.cluster().shutdown().await;
}

#[tokio::test]
async fn re_election_after_leader_failure() {
    let tester = ClusterTester::new(3, 5);
    let first = tester.check_one_leader().await.unwrap();

    tester.cluster().by_id(first).unwrap().fail();
    let second = tester.check_one_leader().await.unwrap();
    assert_ne!(first, second);
    tester.cluster().shutdown().await;
}

#[tokio::test]
async fn two_votes_of_four_do_not_make_a_leader() {
    let target = Node::with_config("tally-4", quiet_config(1));
    let peers: Vec<Node> = (0..4)
        .map(|i| Node::new(&format!("tally-4-peer-{i}")))
        .collect();
    for peer in &peers {
        target.add_neighbor(peer);
    }

    // Queue one vote per neighbor before the loop starts: two name the
    // target, two name someone else.
    let inbox = target.handle();
    inbox.deliver(
        &peers[0].handle(),
        MessageKind::LeaderElectionVote {
            candidate: target.id(),
        },
    );
    inbox.deliver(
        &peers[1].handle(),
        MessageKind::LeaderElectionVote {
            candidate: target.id(),
        },
    );
    inbox.deliver(
        &peers[2].handle(),
        MessageKind::LeaderElectionVote {
            candidate: peers[0].id(),
        },
    );
    inbox.deliver(
        &peers[3].handle(),
        MessageKind::LeaderElectionVote {
            candidate: peers[0].id(),
        },
    );

    target.start();
    sleep(Duration::from_millis(200)).await;

    // 2 of 4 is not a strict majority.
    assert_eq!(target.role(), Role::Follower);
    assert_eq!(target.leader_id(), None);
    target.stop();
    target.join().await;
}

#[tokio::test]
async fn two_votes_of_three_make_a_leader() {
    let target = Node::with_config("tally-3", quiet_config(2));
    let peers: Vec<Node> = (0..3)
        .map(|i| Node::new(&format!("tally-3-peer-{i}")))
        .collect();
    for peer in &peers {
        target.add_neighbor(peer);
    }

    let inbox = target.handle();
    inbox.deliver(
        &peers[0].handle(),
        MessageKind::LeaderElectionVote {
            candidate: target.id(),
        },
    );
    inbox.deliver(
        &peers[1].handle(),
        MessageKind::LeaderElectionVote {
            candidate: target.id(),
        },
    );
    inbox.deliver(
        &peers[2].handle(),
        MessageKind::LeaderElectionVote {
            candidate: peers[0].id(),
        },
    );

    target.start();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(target.role(), Role::Leader);
    assert_eq!(target.leader_id(), Some(target.id()));
    target.stop();
    target.join().await;
}

#[tokio::test]
async fn logs_converge_under_a_stable_leader() {
    let tester = ClusterTester::new(3, 7);
    let leader = tester.check_one_leader().await.unwrap();

    let leader_node = tester.cluster().by_id(leader).unwrap();
    for value in [1, 2, 3] {
        leader_node.propose_state(value);
    }
    tester.wait_for_log(&[1, 2, 3]).await.unwrap();

    // Housekeeping traffic never shows up in inbox logs.
    for node in tester.cluster().nodes() {
        assert!(!node
            .inbox_log()
            .iter()
            .any(|r| matches!(r.kind, MessageKind::Heartbeat | MessageKind::Timeout)));
    }
    tester.cluster().shutdown().await;
}

#[tokio::test]
async fn follower_forwards_proposals_to_the_leader() {
    let tester = ClusterTester::new(3, 9);
    let leader = tester.check_one_leader().await.unwrap();

    let follower = tester
        .cluster()
        .nodes()
        .iter()
        .find(|node| node.id() != leader)
        .unwrap();
    follower.propose_state(42);
    tester.wait_for_log(&[42]).await.unwrap();
    tester.cluster().shutdown().await;
}

#[tokio::test]
async fn proposal_without_a_leader_is_dropped() {
    let a = Node::with_config("orphan-a", quiet_config(3));
    let b = Node::with_config("orphan-b", quiet_config(4));
    a.add_neighbor(&b);
    b.add_neighbor(&a);
    a.start();
    b.start();

    a.propose_state(99);
    sleep(Duration::from_millis(200)).await;

    assert!(a.log().is_empty());
    assert!(b.log().is_empty());
    // The dropped proposal is still observable in the inbox log.
    assert_eq!(
        a.inbox_log(),
        vec![InboxRecord {
            sender: a.id(),
            kind: MessageKind::ProposeState(99),
        }]
    );

    a.stop();
    b.stop();
    a.join().await;
    b.join().await;
}

#[tokio::test]
async fn failing_a_node_isolates_it() {
    let tester = ClusterTester::new(3, 13);
    let leader = tester.check_one_leader().await.unwrap();

    let failed = tester.cluster().by_id(leader).unwrap();
    failed.fail();
    // Detach handling is asynchronous but well inside any re-election
    // window.
    tester.sleep_ms(150).await;

    assert_eq!(failed.status(), Status::Failed);
    assert!(failed.neighbor_ids().is_empty());
    for node in tester
        .cluster()
        .nodes()
        .iter()
        .filter(|node| node.id() != leader)
    {
        assert!(!node.neighbor_ids().contains(&leader));
        assert_eq!(node.leader_id(), None);
    }
    tester.cluster().shutdown().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_join_returns_promptly() {
    let node = Node::new("loner");
    node.start();

    node.stop();
    node.stop();
    assert_eq!(node.status(), Status::Stopped);

    timeout(Duration::from_secs(1), node.join())
        .await
        .expect("join should return promptly after stop");
    timeout(Duration::from_secs(1), node.join())
        .await
        .expect("repeated join should return promptly");
    assert_eq!(node.status(), Status::Stopped);
}

#[tokio::test]
async fn heartbeat_from_a_stranger_changes_nothing() {
    let node = Node::with_config("wary", quiet_config(6));
    let stranger = Node::new("stranger");
    node.start();

    node.handle().deliver(&stranger.handle(), MessageKind::Heartbeat);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(node.role(), Role::Follower);
    assert_eq!(node.leader_id(), None);
    assert!(node.inbox_log().is_empty());
    node.stop();
    node.join().await;
}
