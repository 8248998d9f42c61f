//! Log compaction, lagging followers and unreliable networks.

use std::time::Duration;

use raft_kv::core::RaftConfig;
use raft_kv::state_machine::KvConfig;
use raft_kv::storage::Storage;
use raft_kv::testing::TestCluster;

const MAX_RAFT_STATE: usize = 2000;

fn snapshot_cluster(n: usize) -> TestCluster {
    TestCluster::with_config(
        n,
        RaftConfig::default(),
        KvConfig::default().with_max_raft_state(MAX_RAFT_STATE),
    )
}

async fn wait_for_convergence(cluster: &TestCluster) {
    for _ in 0..200 {
        let dbs = cluster.databases().await;
        let mut values = dbs.values();
        if let Some(first) = values.next() {
            if values.all(|db| db == first) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("servers never converged");
}

#[tokio::test(start_paused = true)]
async fn test_persisted_state_stays_bounded() {
    let mut cluster = snapshot_cluster(3);
    let mut clerk = cluster.clerk();

    for i in 0..100 {
        clerk.put(&format!("key{}", i % 10), &i.to_string()).await.unwrap();
    }
    wait_for_convergence(&cluster).await;

    for i in 0..3 {
        let storage = cluster.storage(i);
        assert!(storage.snapshot_size() > 0, "server {} never snapshotted", i);
        assert!(
            storage.state_size() < 2 * MAX_RAFT_STATE,
            "server {} state is {} bytes",
            i,
            storage.state_size()
        );
    }
    assert_eq!(clerk.get("key9").await.unwrap(), Some("99".to_string()));
    cluster.shutdown();
}

/// A follower that missed entries now compacted away catches up from the
/// leader's snapshot and then from ordinary appends after it
#[tokio::test(start_paused = true)]
async fn test_lagging_follower_installs_snapshot() {
    let mut cluster = snapshot_cluster(3);
    let mut clerk = cluster.clerk();
    clerk.put("a", "1").await.unwrap();

    let leader = cluster.wait_for_leader(Duration::from_secs(10)).await.unwrap();
    let lagging = (leader + 1) % 3;
    cluster.crash(lagging);

    for i in 0..60 {
        clerk.append("a", &format!(",{}", i)).await.unwrap();
    }
    let leader_snapshot = cluster
        .server(leader)
        .unwrap()
        .raft()
        .status()
        .await
        .snapshot_index;
    assert!(leader_snapshot > 0);

    cluster.start(lagging);
    clerk.put("b", "after").await.unwrap();
    wait_for_convergence(&cluster).await;

    let status = cluster.server(lagging).unwrap().status().await;
    assert!(status.raft.snapshot_index > 0);
    assert!(status.kv_applied_index > leader_snapshot);
    let db = cluster.server(lagging).unwrap().data().await;
    assert_eq!(db.get("b").map(String::as_str), Some("after"));
    cluster.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_restart_from_snapshot() {
    let mut cluster = snapshot_cluster(3);
    let mut clerk = cluster.clerk();
    for i in 0..50 {
        clerk.append("k", &i.to_string()).await.unwrap();
    }
    let expected: String = (0..50).map(|i| i.to_string()).collect();

    for i in 0..3 {
        cluster.crash(i);
        cluster.start(i);
    }
    assert_eq!(clerk.get("k").await.unwrap(), Some(expected));
    cluster.shutdown();
}

/// Concurrent clients over a lossy, reordering network: every append lands
/// exactly once and in client order
#[tokio::test(start_paused = true)]
async fn test_unreliable_network_appends_exactly_once() {
    let mut cluster = TestCluster::new(5);
    cluster.set_reliable(false);

    let mut tasks = Vec::new();
    for client in 0..3 {
        let mut clerk = cluster.clerk();
        tasks.push(tokio::spawn(async move {
            let key = format!("c{}", client);
            for i in 0..15 {
                clerk.append(&key, &format!("[{}]", i)).await.unwrap();
            }
            clerk.get(&key).await.unwrap()
        }));
    }

    for (client, task) in tasks.into_iter().enumerate() {
        let value = task.await.unwrap();
        let expected: String = (0..15).map(|i| format!("[{}]", i)).collect();
        assert_eq!(value, Some(expected), "client {}", client);
    }
    cluster.set_reliable(true);
    cluster.shutdown();
}

/// Never two leaders in one term while leaders are repeatedly cut off
#[tokio::test(start_paused = true)]
async fn test_at_most_one_leader_per_term() {
    let mut cluster = TestCluster::new(5);
    let mut seen = std::collections::BTreeMap::new();

    for round in 0..6 {
        tokio::time::sleep(Duration::from_millis(700)).await;
        for (term, leaders) in cluster.leaders_by_term().await {
            assert_eq!(leaders.len(), 1, "term {} has leaders {:?}", term, leaders);
            let first = *seen.entry(term).or_insert(leaders[0]);
            assert_eq!(first, leaders[0], "term {} changed leader", term);
        }
        if let Some(leader) = cluster.leader().await {
            cluster.disconnect(leader);
        }
        if round % 2 == 1 {
            for i in 0..5 {
                cluster.connect(i);
            }
        }
    }

    for i in 0..5 {
        cluster.connect(i);
    }
    let mut clerk = cluster.clerk();
    clerk.put("alive", "yes").await.unwrap();
    assert_eq!(clerk.get("alive").await.unwrap(), Some("yes".to_string()));
    cluster.shutdown();
}
