//! RaftServer - runs a node's background loops and exposes its public API

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use super::config::RaftConfig;
use super::raft_core::{ApplyMsg, RaftCore, RaftState, RaftStatus};
use super::raft_node::RaftNode;
use crate::storage::StorageError;
use crate::transport::{RpcHandler, Transport};

/// Errors that can occur during Raft operations
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },
    /// State could not be persisted
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Raft server: owns a node until `start` spawns its loops
pub struct RaftServer<T: Transport> {
    node: RaftNode<T>,
    apply_tx: mpsc::Sender<ApplyMsg>,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a server with default timing.
    /// Returns the server and the receiving end of the apply stream.
    pub fn new(core: RaftCore, transport: T) -> (Self, mpsc::Receiver<ApplyMsg>) {
        Self::with_config(core, transport, RaftConfig::default())
    }

    /// Create a server with custom config
    pub fn with_config(
        core: RaftCore,
        transport: T,
        config: RaftConfig,
    ) -> (Self, mpsc::Receiver<ApplyMsg>) {
        // Capacity 1: the apply loop waits for the state machine on every message
        let (apply_tx, apply_rx) = mpsc::channel(1);
        let server = Self {
            node: RaftNode::new(core, transport, config),
            apply_tx,
        };
        (server, apply_rx)
    }

    /// Inbound RPC handler for this node, to register with a transport server
    pub fn rpc_handler(&self) -> Arc<dyn RpcHandler> {
        Arc::new(self.node.clone())
    }

    /// Spawn the election timer and the apply loop, and return a handle
    pub fn start(self) -> RaftHandle<T> {
        let election = tokio::spawn(run_election_timer(self.node.clone()));
        let apply = tokio::spawn(self.node.clone().run_apply_loop(self.apply_tx));

        RaftHandle {
            node: self.node,
            tasks: Arc::new(Mutex::new(vec![election, apply])),
        }
    }
}

/// Start an election whenever no leader has been heard from within a
/// freshly drawn random timeout
async fn run_election_timer<T: Transport + 'static>(node: RaftNode<T>) {
    loop {
        let timeout = node.config().random_election_timeout();
        let deadline = node.shared_core().lock().await.last_heartbeat + timeout;
        sleep_until(deadline).await;

        if node.is_killed() {
            break;
        }

        // last_heartbeat may have moved while we slept
        let timed_out = {
            let core = node.shared_core();
            let core = core.lock().await;
            core.state != RaftState::Leader && Instant::now() >= core.last_heartbeat + timeout
        };
        if timed_out {
            debug!("election timeout elapsed");
            node.run_election().await;
        }
    }
}

/// Handle for interacting with a running RaftServer
pub struct RaftHandle<T: Transport> {
    node: RaftNode<T>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl<T: Transport> Clone for RaftHandle<T> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl<T: Transport + 'static> RaftHandle<T> {
    pub fn id(&self) -> u64 {
        self.node.id()
    }

    /// Append `command` to the log if this node is leader.
    /// Returns the new entry's `(index, term)`; does not wait for commit.
    pub async fn propose(&self, command: String) -> Result<(u64, u64), RaftError> {
        let shared = self.node.shared_core();
        let mut core = shared.lock().await;
        match core.propose(command)? {
            Some(position) => Ok(position),
            None => Err(RaftError::NotLeader {
                leader_hint: core.current_leader,
            }),
        }
    }

    /// Current term and whether this node believes it is leader
    pub async fn state(&self) -> (u64, bool) {
        let shared = self.node.shared_core();
        let core = shared.lock().await;
        (core.current_term, core.is_leader())
    }

    pub async fn is_leader(&self) -> bool {
        self.state().await.1
    }

    /// Compact the log through `index` with a state-machine snapshot
    pub async fn snapshot(&self, index: u64, data: Vec<u8>) -> Result<(), RaftError> {
        let shared = self.node.shared_core();
        let mut core = shared.lock().await;
        core.snapshot(index, data).map_err(|e| {
            error!(node = core.id, index, error = %e, "failed to save snapshot");
            RaftError::from(e)
        })
    }

    /// Size in bytes of the persisted consensus state
    pub async fn raft_state_size(&self) -> usize {
        self.node.shared_core().lock().await.state_size()
    }

    pub async fn status(&self) -> RaftStatus {
        self.node.shared_core().lock().await.status()
    }

    /// Inbound RPC handler for this node
    pub fn rpc_handler(&self) -> Arc<dyn RpcHandler> {
        Arc::new(self.node.clone())
    }

    /// Stop every loop of this node and make it refuse RPCs.
    /// Persistent state is left as it is.
    pub fn shutdown(&self) {
        if self.node.is_killed() {
            return;
        }
        self.node.kill();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("raft node stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.node.is_killed()
    }
}
