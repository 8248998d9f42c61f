//! KV service tests against in-process clusters.
//!
//! Every test runs on paused tokio time, so election and request timeouts
//! elapse instantly once all tasks are idle.

use std::time::Duration;

use raft_kv::state_machine::{KvError, PutAppendArgs, WriteMode};
use raft_kv::testing::TestCluster;

const LEADER_WAIT: Duration = Duration::from_secs(10);

fn append_args(key: &str, value: &str, client_id: u64, seq: u64) -> PutAppendArgs {
    PutAppendArgs {
        key: key.to_string(),
        value: value.to_string(),
        mode: WriteMode::Append,
        client_id,
        seq,
    }
}

/// Wait until every live server has applied the same database
async fn wait_for_convergence(cluster: &TestCluster) {
    for _ in 0..100 {
        let dbs = cluster.databases().await;
        let mut values = dbs.values();
        if let Some(first) = values.next() {
            if values.all(|db| db == first) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("servers never converged: {:?}", cluster.databases().await);
}

/// Put then Append then Get on one key
#[tokio::test(start_paused = true)]
async fn test_put_append_get() {
    let mut cluster = TestCluster::new(3);
    let mut clerk = cluster.clerk();

    clerk.put("x", "1").await.unwrap();
    clerk.append("x", "2").await.unwrap();
    assert_eq!(clerk.get("x").await.unwrap(), Some("12".to_string()));

    wait_for_convergence(&cluster).await;
    for db in cluster.databases().await.values() {
        assert_eq!(db.get("x").map(String::as_str), Some("12"));
    }
    cluster.shutdown();
}

/// A write accepted by a leader that is cut off before replicating it
/// never becomes visible
#[tokio::test(start_paused = true)]
async fn test_uncommitted_write_on_partitioned_leader_is_lost() {
    let mut cluster = TestCluster::new(3);
    let mut clerk = cluster.clerk();
    clerk.put("x", "before").await.unwrap();

    let old = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let old_server = cluster.server(old).unwrap();
    cluster.disconnect(old);

    // The isolated leader still accepts the proposal but cannot commit it
    let result = old_server
        .put_append(append_args("x", "-lost", 999, 1))
        .await;
    assert_eq!(result, Err(KvError::Timeout));

    let new = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    assert_ne!(new, old);
    assert_eq!(clerk.get("x").await.unwrap(), Some("before".to_string()));

    // After healing, the stale entry is overwritten everywhere
    cluster.connect(old);
    clerk.append("x", "-after").await.unwrap();
    assert_eq!(clerk.get("x").await.unwrap(), Some("before-after".to_string()));
    wait_for_convergence(&cluster).await;
    for db in cluster.databases().await.values() {
        assert_eq!(db.get("x").map(String::as_str), Some("before-after"));
    }
    cluster.shutdown();
}

/// Re-sending a request with the same (client, seq) does not re-execute it
#[tokio::test(start_paused = true)]
async fn test_retransmitted_request_applies_once() {
    let mut cluster = TestCluster::new(3);
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let server = cluster.server(leader).unwrap();

    server.put_append(append_args("k", "a", 42, 5)).await.unwrap();
    // Reply "lost"; the client retries seq 5
    server.put_append(append_args("k", "a", 42, 5)).await.unwrap();

    let mut clerk = cluster.clerk();
    assert_eq!(clerk.get("k").await.unwrap(), Some("a".to_string()));
    cluster.shutdown();
}

/// A retry that lands on a new leader is still deduplicated
#[tokio::test(start_paused = true)]
async fn test_retransmission_after_failover_applies_once() {
    let mut cluster = TestCluster::new(3);
    let old = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    cluster
        .server(old)
        .unwrap()
        .put_append(append_args("k", "a", 42, 1))
        .await
        .unwrap();

    cluster.crash(old);
    let new = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    cluster
        .server(new)
        .unwrap()
        .put_append(append_args("k", "a", 42, 1))
        .await
        .unwrap();

    let mut clerk = cluster.clerk();
    assert_eq!(clerk.get("k").await.unwrap(), Some("a".to_string()));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_state_survives_full_restart() {
    let mut cluster = TestCluster::new(3);
    let mut clerk = cluster.clerk();
    for i in 0..10 {
        clerk.append("log", &format!("{};", i)).await.unwrap();
    }
    let expected: String = (0..10).map(|i| format!("{};", i)).collect();

    for i in 0..3 {
        cluster.crash(i);
    }
    for i in 0..3 {
        cluster.start(i);
    }

    // A retry of the last write after the restart is absorbed
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    cluster
        .server(leader)
        .unwrap()
        .put_append(append_args("log", "9;", clerk.client_id(), clerk.seq()))
        .await
        .unwrap();
    assert_eq!(clerk.get("log").await.unwrap(), Some(expected));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_minority_cannot_make_progress() {
    let mut cluster = TestCluster::new(5);
    let leader = cluster.wait_for_leader(LEADER_WAIT).await.unwrap();
    let server = cluster.server(leader).unwrap();

    // Leader plus one follower: a minority of five
    let mut cut = 0;
    for i in 0..5 {
        if i != leader && cut < 3 {
            cluster.disconnect(i);
            cut += 1;
        }
    }
    let result = server.put_append(append_args("x", "1", 7, 1)).await;
    assert!(matches!(result, Err(KvError::Timeout)), "{:?}", result);

    for i in 0..5 {
        cluster.connect(i);
    }
    let mut clerk = cluster.clerk();
    clerk.put("y", "ok").await.unwrap();
    assert_eq!(clerk.get("y").await.unwrap(), Some("ok".to_string()));
    cluster.shutdown();
}
