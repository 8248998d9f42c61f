//! KvServer - the replicated KV service on top of one Raft node
//!
//! A request is proposed to Raft and then waits on a one-shot slot keyed by
//! the log index it was given. The apply loop executes committed entries in
//! order and fills the slot, provided the entry that landed at that index
//! is still the one the request proposed (same term).
//!
//! Lock order: the KV state lock is always taken before the Raft core lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::config::KvConfig;
use super::kv::{Applied, KvStore};
use super::types::{GetArgs, GetReply, KvError, Op, OpResult, PutAppendArgs};
use crate::core::{ApplyMsg, RaftError, RaftHandle, RaftServer, RaftStatus, NOOP_COMMAND};
use crate::transport::Transport;

/// Result slot of one in-flight request
struct Waiter {
    term: u64,
    tx: oneshot::Sender<OpResult>,
}

#[derive(Default)]
struct KvState {
    store: KvStore,
    waiters: HashMap<u64, Waiter>,
    last_applied: u64,
}

/// Status of one KV server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStatus {
    #[serde(flatten)]
    pub raft: RaftStatus,
    /// Last log index applied to the database
    pub kv_applied_index: u64,
    pub keys: usize,
}

pub struct KvServer<T: Transport> {
    id: u64,
    raft: RaftHandle<T>,
    state: Arc<Mutex<KvState>>,
    config: KvConfig,
    killed: Arc<AtomicBool>,
    apply_task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

impl<T: Transport> Clone for KvServer<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            raft: self.raft.clone(),
            state: self.state.clone(),
            config: self.config.clone(),
            killed: self.killed.clone(),
            apply_task: self.apply_task.clone(),
        }
    }
}

impl<T: Transport + 'static> KvServer<T> {
    /// Start `raft` and the KV apply loop consuming `apply_rx`
    pub fn start(raft: RaftServer<T>, apply_rx: mpsc::Receiver<ApplyMsg>, config: KvConfig) -> Self {
        let raft = raft.start();
        let server = Self {
            id: raft.id(),
            raft,
            state: Arc::new(Mutex::new(KvState::default())),
            config,
            killed: Arc::new(AtomicBool::new(false)),
            apply_task: Arc::new(parking_lot::Mutex::new(None)),
        };

        let task = tokio::spawn(server.clone().run_apply_loop(apply_rx));
        *server.apply_task.lock() = Some(task);
        info!(node = server.id, max_raft_state = ?server.config.max_raft_state, "kv server started");
        server
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying Raft node
    pub fn raft(&self) -> &RaftHandle<T> {
        &self.raft
    }

    pub async fn get(&self, args: GetArgs) -> Result<GetReply, KvError> {
        let value = self.handle(args.into()).await?;
        Ok(GetReply { value })
    }

    pub async fn put_append(&self, args: PutAppendArgs) -> Result<(), KvError> {
        self.handle(args.into()).await.map(|_| ())
    }

    /// Propose `op` and wait for its outcome
    async fn handle(&self, op: Op) -> OpResult {
        if self.is_killed() {
            return Err(KvError::NotLeader);
        }
        let command = op.encode().map_err(|e| {
            error!(node = self.id, error = %e, "failed to encode operation");
            KvError::NotLeader
        })?;

        // The slot must exist before the apply loop can reach `index`
        let (index, term, rx) = {
            let mut state = self.state.lock().await;
            let (index, term) = match self.raft.propose(command).await {
                Ok(position) => position,
                Err(RaftError::NotLeader { .. }) => return Err(KvError::NotLeader),
                Err(e) => {
                    error!(node = self.id, error = %e, "failed to persist proposal");
                    return Err(KvError::NotLeader);
                }
            };
            let (tx, rx) = oneshot::channel();
            if state.waiters.insert(index, Waiter { term, tx }).is_some() {
                debug!(node = self.id, index, "replaced result slot from an earlier term");
            }
            (index, term, rx)
        };
        debug!(
            node = self.id,
            index,
            term,
            client = op.client_id,
            seq = op.seq,
            "proposed operation"
        );

        match timeout(self.config.handle_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Slot was replaced by a later proposal at the same index
            Ok(Err(_)) => Err(KvError::OutdatedLeader),
            Err(_) => {
                let mut state = self.state.lock().await;
                if state.waiters.get(&index).is_some_and(|w| w.term == term) {
                    state.waiters.remove(&index);
                }
                debug!(node = self.id, index, term, "request timed out");
                Err(KvError::Timeout)
            }
        }
    }

    async fn run_apply_loop(self, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
        while let Some(msg) = apply_rx.recv().await {
            if self.is_killed() {
                break;
            }
            let mut state = self.state.lock().await;
            match msg {
                ApplyMsg::Command {
                    index,
                    term,
                    command,
                } => self.apply_command(&mut state, index, term, &command).await,
                ApplyMsg::Snapshot { index, term, data } => {
                    self.install_snapshot(&mut state, index, term, &data)
                }
            }
        }
        debug!(node = self.id, "kv apply loop stopped");
    }

    async fn apply_command(&self, state: &mut KvState, index: u64, term: u64, command: &str) {
        if index <= state.last_applied {
            debug!(node = self.id, index, "skipping entry already covered");
            return;
        }
        state.last_applied = index;

        if command == NOOP_COMMAND {
            self.deliver(state, index, term, None).await;
        } else {
            match Op::decode(command) {
                Ok(op) => {
                    let applied = state.store.apply(&op, term);
                    debug!(
                        node = self.id,
                        index,
                        client = op.client_id,
                        seq = op.seq,
                        ?applied,
                        "applied operation"
                    );
                    match applied {
                        Applied::Executed(result) | Applied::Replayed(result) => {
                            self.deliver(state, index, term, Some(result)).await
                        }
                        Applied::Stale => {}
                    }
                }
                Err(e) => {
                    error!(node = self.id, index, error = %e, "undecodable log entry");
                    self.deliver(state, index, term, None).await;
                }
            }
        }

        let size = self.raft.raft_state_size().await;
        if self.config.should_snapshot(size) {
            self.take_snapshot(state).await;
        }
    }

    /// Hand the outcome at `index` to its waiting request, if any.
    /// `None` means the entry is not the request's operation.
    async fn deliver(&self, state: &mut KvState, index: u64, term: u64, result: Option<OpResult>) {
        let Some(waiter) = state.waiters.remove(&index) else {
            return;
        };
        let reply = match result {
            Some(result) if waiter.term == term && self.raft.is_leader().await => result,
            _ => Err(KvError::OutdatedLeader),
        };
        // The request may have timed out already
        let _ = waiter.tx.send(reply);
    }

    async fn take_snapshot(&self, state: &KvState) {
        let index = state.last_applied;
        let data = match state.store.snapshot(index) {
            Ok(data) => data,
            Err(e) => {
                error!(node = self.id, index, error = %e, "failed to encode snapshot");
                return;
            }
        };
        let bytes = data.len();
        if self.raft.snapshot(index, data).await.is_ok() {
            debug!(node = self.id, index, bytes, "handed snapshot to raft");
        }
    }

    fn install_snapshot(&self, state: &mut KvState, index: u64, term: u64, data: &[u8]) {
        if index <= state.last_applied {
            debug!(
                node = self.id,
                index,
                applied = state.last_applied,
                "ignoring snapshot that is not newer than applied state"
            );
            return;
        }
        let (store, included) = match KvStore::restore(data) {
            Ok(restored) => restored,
            Err(e) => panic!("undecodable snapshot at index {}: {}", index, e),
        };
        if included != index {
            error!(node = self.id, index, included, "snapshot payload index differs from its metadata");
        }

        state.store = store;
        state.last_applied = index;
        // Requests proposed at or below the snapshot can no longer be matched
        state.waiters.retain(|&i, _| i > index);
        info!(
            node = self.id,
            index,
            term,
            keys = state.store.len(),
            "installed snapshot"
        );
    }

    /// Stop this server and its Raft node. Persistent state is kept.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.raft.shutdown();
        if let Some(task) = self.apply_task.lock().take() {
            task.abort();
        }
        info!(node = self.id, "kv server stopped");
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub async fn is_leader(&self) -> bool {
        !self.is_killed() && self.raft.is_leader().await
    }

    /// Copy of the applied database
    pub async fn data(&self) -> HashMap<String, String> {
        self.state.lock().await.store.data()
    }

    pub async fn applied_index(&self) -> u64 {
        self.state.lock().await.last_applied
    }

    pub async fn status(&self) -> KvStatus {
        let state = self.state.lock().await;
        KvStatus {
            raft: self.raft.status().await,
            kv_applied_index: state.last_applied,
            keys: state.store.len(),
        }
    }
}
