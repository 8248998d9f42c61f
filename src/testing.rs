//! Testing utilities for cluster integration tests
//!
//! `TestCluster` runs KV servers in-process over an `InMemoryNetwork`.
//! Servers can be partitioned, crashed and restarted on their persisted
//! state. `Clerk` is a retrying client that talks to every server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::core::{RaftConfig, RaftCore, RaftServer};
use crate::state_machine::{GetArgs, KvConfig, KvError, KvServer, PutAppendArgs, WriteMode};
use crate::storage::MemoryStorage;
use crate::transport::{InMemoryNetwork, InMemoryTransport};

pub type TestServer = KvServer<InMemoryTransport>;

/// Live servers by position; `None` while crashed
type SharedServers = Arc<RwLock<Vec<Option<TestServer>>>>;

/// Node IDs are 1-based; positions are 0-based
fn node_id(i: usize) -> u64 {
    i as u64 + 1
}

pub struct TestCluster {
    network: InMemoryNetwork,
    servers: SharedServers,
    storages: Vec<MemoryStorage>,
    raft_config: RaftConfig,
    kv_config: KvConfig,
}

impl TestCluster {
    /// Start `n` servers with default timing and no snapshots
    pub fn new(n: usize) -> Self {
        Self::with_config(n, RaftConfig::default(), KvConfig::default())
    }

    pub fn with_config(n: usize, raft_config: RaftConfig, kv_config: KvConfig) -> Self {
        let mut cluster = TestCluster {
            network: InMemoryNetwork::new(),
            servers: Arc::new(RwLock::new(vec![None; n])),
            storages: (0..n).map(|_| MemoryStorage::new()).collect(),
            raft_config,
            kv_config,
        };
        for i in 0..n {
            cluster.start(i);
        }
        cluster
    }

    pub fn size(&self) -> usize {
        self.storages.len()
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    /// Start server `i` from whatever its storage holds.
    /// A running instance is crashed first.
    pub fn start(&mut self, i: usize) {
        self.crash(i);

        let id = node_id(i);
        let peers = (0..self.size()).filter(|&p| p != i).map(node_id).collect();
        let core = match RaftCore::new(id, peers, Box::new(self.storages[i].clone())) {
            Ok(core) => core,
            Err(e) => panic!("node {} failed to load its state: {}", id, e),
        };
        let (raft, apply_rx) = RaftServer::with_config(
            core,
            self.network.transport_for(id),
            self.raft_config.clone(),
        );
        self.network.register(id, raft.rpc_handler());
        let server = KvServer::start(raft, apply_rx, self.kv_config.clone());
        self.servers.write()[i] = Some(server);
        debug!(node = id, "test server started");
    }

    /// Stop server `i`; its storage survives for `start`
    pub fn crash(&mut self, i: usize) {
        let id = node_id(i);
        if let Some(server) = self.servers.write()[i].take() {
            server.kill();
            self.network.unregister(id);
            debug!(node = id, "test server crashed");
        }
    }

    pub fn server(&self, i: usize) -> Option<TestServer> {
        self.servers.read()[i].clone()
    }

    pub fn storage(&self, i: usize) -> &MemoryStorage {
        &self.storages[i]
    }

    pub fn disconnect(&self, i: usize) {
        self.network.disconnect(node_id(i));
    }

    pub fn connect(&self, i: usize) {
        self.network.connect(node_id(i));
    }

    pub fn set_reliable(&self, reliable: bool) {
        self.network.set_reliable(reliable);
    }

    fn live_servers(&self) -> Vec<(usize, TestServer)> {
        self.servers
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.clone().map(|s| (i, s)))
            .collect()
    }

    /// Servers that believe they lead, grouped by term
    pub async fn leaders_by_term(&self) -> BTreeMap<u64, Vec<usize>> {
        let mut leaders: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
        for (i, server) in self.live_servers() {
            let (term, is_leader) = server.raft().state().await;
            if is_leader {
                leaders.entry(term).or_default().push(i);
            }
        }
        leaders
    }

    /// Connected leader with the highest term, if any
    pub async fn leader(&self) -> Option<usize> {
        let mut best: Option<(u64, usize)> = None;
        for (i, server) in self.live_servers() {
            if !self.network.is_connected(node_id(i)) {
                continue;
            }
            let (term, is_leader) = server.raft().state().await;
            if is_leader && best.map_or(true, |(t, _)| term > t) {
                best = Some((term, i));
            }
        }
        best.map(|(_, i)| i)
    }

    /// Poll for a connected leader for up to `timeout`
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(leader) = self.leader().await {
                return Some(leader);
            }
            sleep(Duration::from_millis(50)).await;
        }
        None
    }

    /// Applied database of every live server
    pub async fn databases(&self) -> HashMap<usize, HashMap<String, String>> {
        let mut out = HashMap::new();
        for (i, server) in self.live_servers() {
            out.insert(i, server.data().await);
        }
        out
    }

    pub fn clerk(&self) -> Clerk {
        Clerk::new(self.servers.clone())
    }

    /// Stop every server
    pub fn shutdown(&mut self) {
        for i in 0..self.size() {
            self.crash(i);
        }
    }
}

/// Retrying client.
///
/// Each logical operation gets the next sequence number and is retried with
/// that same `(client_id, seq)` against every server until one gives a
/// terminal answer or `deadline` passes.
pub struct Clerk {
    servers: SharedServers,
    client_id: u64,
    seq: u64,
    leader: usize,
    deadline: Duration,
}

impl Clerk {
    fn new(servers: SharedServers) -> Self {
        Clerk {
            servers,
            client_id: rand::rng().random(),
            seq: 0,
            leader: 0,
            deadline: Duration::from_secs(30),
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Sequence number of the last operation issued
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Value of `key`, or `None` if it does not exist
    pub async fn get(&mut self, key: &str) -> Result<Option<String>, KvError> {
        self.seq += 1;
        let args = GetArgs {
            key: key.to_string(),
            client_id: self.client_id,
            seq: self.seq,
        };
        let result = self
            .retry(|server| {
                let args = args.clone();
                async move { server.get(args).await.map(|reply| reply.value) }
            })
            .await;
        match result {
            Ok(value) => Ok(Some(value)),
            Err(KvError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn put(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        self.put_append(key, value, WriteMode::Put).await
    }

    pub async fn append(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        self.put_append(key, value, WriteMode::Append).await
    }

    async fn put_append(&mut self, key: &str, value: &str, mode: WriteMode) -> Result<(), KvError> {
        self.seq += 1;
        let args = PutAppendArgs {
            key: key.to_string(),
            value: value.to_string(),
            mode,
            client_id: self.client_id,
            seq: self.seq,
        };
        self.retry(|server| {
            let args = args.clone();
            async move { server.put_append(args).await }
        })
        .await
    }

    async fn retry<F, Fut, R>(&mut self, call: F) -> Result<R, KvError>
    where
        F: Fn(TestServer) -> Fut,
        Fut: std::future::Future<Output = Result<R, KvError>>,
    {
        let deadline = Instant::now() + self.deadline;
        loop {
            let count = self.servers.read().len();
            for offset in 0..count {
                let i = (self.leader + offset) % count;
                let Some(server) = self.servers.read()[i].clone() else {
                    continue;
                };
                match call(server).await {
                    Err(e) if e.is_retryable() => {
                        debug!(client = self.client_id, seq = self.seq, server = i, error = %e, "retrying");
                    }
                    result => {
                        self.leader = i;
                        return result;
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(KvError::Timeout);
            }
            sleep(Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[tokio::test(start_paused = true)]
    async fn test_cluster_elects_leader() {
        let mut cluster = TestCluster::new(3);
        let leader = cluster.wait_for_leader(Duration::from_secs(5)).await;
        assert!(leader.is_some());
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clerk_sequence_numbers() {
        let mut cluster = TestCluster::new(3);
        let mut clerk = cluster.clerk();
        clerk.put("a", "1").await.unwrap();
        assert_eq!(clerk.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(clerk.get("b").await.unwrap(), None);
        assert_eq!(clerk.seq(), 3);
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_and_start_keeps_storage() {
        let mut cluster = TestCluster::new(3);
        let mut clerk = cluster.clerk();
        clerk.put("k", "v").await.unwrap();

        cluster.crash(0);
        assert!(cluster.server(0).is_none());
        assert!(cluster.storage(0).state_size() > 0);

        cluster.start(0);
        assert!(cluster.server(0).is_some());
        cluster.shutdown();
    }
}
