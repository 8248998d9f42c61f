//! RaftNode - async driver around `RaftCore`
//!
//! Fans out votes and replication to peers, feeds replies back into the
//! core, and hands committed entries to the state machine. The core lock is
//! never held across a network call; every reply is re-validated by the core
//! against the current term before it has any effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use super::config::RaftConfig;
use super::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, ApplyMsg, InstallSnapshotArgs, InstallSnapshotResult,
    RaftCore, RaftState, ReplicationRequest, RequestVoteArgs, RequestVoteResult,
};
use crate::storage::StorageError;
use crate::transport::{RpcHandler, Transport, TransportError};

/// Shared reference to RaftCore
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// Votes collected for one election, kept apart from the core lock
#[derive(Debug)]
struct ElectionTally {
    term: u64,
    votes: usize,
    won: bool,
}

/// Outcome of one peer call in a replication round
enum PeerReply {
    AppendEntries(AppendEntriesArgs, Result<AppendEntriesResult, TransportError>),
    InstallSnapshot(InstallSnapshotArgs, Result<InstallSnapshotResult, TransportError>),
}

/// High-level Raft node that handles consensus operations
pub struct RaftNode<T: Transport> {
    id: u64,
    core: SharedCore,
    transport: Arc<T>,
    config: RaftConfig,
    killed: Arc<AtomicBool>,
}

impl<T: Transport> Clone for RaftNode<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            core: self.core.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            killed: self.killed.clone(),
        }
    }
}

fn storage_failure(node: u64, err: StorageError) -> TransportError {
    error!(node, error = %err, "failed to persist raft state");
    TransportError::Remote(err.to_string())
}

impl<T: Transport + 'static> RaftNode<T> {
    /// Create a new RaftNode
    pub fn new(core: RaftCore, transport: T, config: RaftConfig) -> Self {
        Self {
            id: core.id,
            core: Arc::new(Mutex::new(core)),
            transport: Arc::new(transport),
            config,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a shared reference to the core
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    /// Stop every loop and refuse further RPCs
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Get current state
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Get commit index
    pub async fn commit_index(&self) -> u64 {
        self.core.lock().await.commit_index
    }

    /// Start an election and request votes from all peers concurrently.
    ///
    /// Each reply is handled by its own task; votes are counted in a tally
    /// guarded by its own lock, and the first task to see a majority
    /// promotes the node.
    pub async fn run_election(&self) {
        if self.is_killed() {
            return;
        }

        let (args, peers, majority) = {
            let mut core = self.core.lock().await;
            if core.state == RaftState::Leader {
                return;
            }
            let args = match core.start_election() {
                Ok(args) => args,
                Err(e) => {
                    error!(node = core.id, error = %e, "failed to persist election start");
                    return;
                }
            };
            (args, core.peers.clone(), core.majority())
        };

        if majority <= 1 {
            self.become_leader(args.term).await;
            return;
        }

        // Starts with our own vote
        let tally = Arc::new(parking_lot::Mutex::new(ElectionTally {
            term: args.term,
            votes: 1,
            won: false,
        }));

        for peer in peers {
            let node = self.clone();
            let args = args.clone();
            let tally = tally.clone();
            tokio::spawn(async move {
                node.request_vote_from(peer, args, tally, majority).await;
            });
        }
    }

    async fn request_vote_from(
        &self,
        peer: u64,
        args: RequestVoteArgs,
        tally: Arc<parking_lot::Mutex<ElectionTally>>,
        majority: usize,
    ) {
        let result = match self.transport.request_vote(peer, args.clone()).await {
            Ok(result) => result,
            Err(e) => {
                debug!(peer, term = args.term, error = %e, "vote request failed");
                return;
            }
        };
        if self.is_killed() {
            return;
        }

        let counted = {
            let mut core = self.core.lock().await;
            match core.handle_request_vote_result(args.term, &result) {
                Ok(counted) => counted,
                Err(e) => {
                    error!(node = core.id, error = %e, "failed to persist term from vote reply");
                    return;
                }
            }
        };
        if !counted {
            return;
        }

        let won = {
            let mut tally = tally.lock();
            tally.votes += 1;
            debug!(peer, term = tally.term, votes = tally.votes, "vote granted");
            if tally.votes >= majority && !tally.won {
                tally.won = true;
                true
            } else {
                false
            }
        };
        if won {
            self.become_leader(args.term).await;
        }
    }

    /// Promote to leader for `term` (if still a candidate in it) and start
    /// the heartbeat loop
    async fn become_leader(&self, term: u64) {
        let promoted = {
            let mut core = self.core.lock().await;
            match core.become_leader(term) {
                Ok(promoted) => promoted,
                Err(e) => {
                    error!(node = core.id, error = %e, "failed to persist leader no-op");
                    false
                }
            }
        };
        if promoted {
            let node = self.clone();
            tokio::spawn(async move { node.run_heartbeats(term).await });
        }
    }

    /// Leader-only loop: one replication round per tick for as long as this
    /// node leads `term`. Rounds are not awaited, so a slow peer never delays
    /// the next tick.
    async fn run_heartbeats(self, term: u64) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.is_killed() {
                break;
            }
            let requests = {
                let mut core = self.core.lock().await;
                if core.state != RaftState::Leader || core.current_term != term {
                    break;
                }
                // Leaders never time out on themselves
                core.last_heartbeat = tokio::time::Instant::now();
                match Self::collect_requests(&core) {
                    Ok(requests) => requests,
                    Err(e) => {
                        error!(node = core.id, error = %e, "failed to load snapshot for replication");
                        continue;
                    }
                }
            };
            let node = self.clone();
            tokio::spawn(async move { node.replicate(requests).await });
        }
        debug!(term, "heartbeat loop stopped");
    }

    fn collect_requests(core: &RaftCore) -> Result<Vec<(u64, ReplicationRequest)>, StorageError> {
        let mut requests = Vec::with_capacity(core.peers.len());
        for &peer in &core.peers {
            if let Some(request) = core.replication_request(peer)? {
                requests.push((peer, request));
            }
        }
        Ok(requests)
    }

    /// Run one replication round immediately (outside the heartbeat schedule)
    pub async fn replicate_now(&self) {
        let requests = {
            let core = self.core.lock().await;
            match Self::collect_requests(&core) {
                Ok(requests) => requests,
                Err(e) => {
                    error!(node = core.id, error = %e, "failed to load snapshot for replication");
                    return;
                }
            }
        };
        self.replicate(requests).await;
    }

    /// Send one request per peer concurrently and apply replies as they arrive
    async fn replicate(&self, requests: Vec<(u64, ReplicationRequest)>) {
        let mut calls: FuturesUnordered<_> = requests
            .into_iter()
            .map(|(peer, request)| {
                let transport = &self.transport;
                async move {
                    match request {
                        ReplicationRequest::AppendEntries(args) => {
                            let result = transport.append_entries(peer, args.clone()).await;
                            (peer, PeerReply::AppendEntries(args, result))
                        }
                        ReplicationRequest::InstallSnapshot(args) => {
                            let result = transport.install_snapshot(peer, args.clone()).await;
                            (peer, PeerReply::InstallSnapshot(args, result))
                        }
                    }
                }
            })
            .collect();

        while let Some((peer, reply)) = calls.next().await {
            if self.is_killed() {
                return;
            }
            let mut core = self.core.lock().await;
            let outcome = match reply {
                PeerReply::AppendEntries(args, Ok(result)) => {
                    core.handle_append_entries_result(peer, &args, &result)
                }
                PeerReply::InstallSnapshot(args, Ok(result)) => {
                    core.handle_install_snapshot_result(peer, &args, &result)
                }
                PeerReply::AppendEntries(_, Err(e)) | PeerReply::InstallSnapshot(_, Err(e)) => {
                    debug!(node = core.id, peer, error = %e, "replication call failed");
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                error!(node = core.id, error = %e, "failed to persist term from replication reply");
            }
        }
    }

    /// Hand committed entries (and installed snapshots) to the state machine
    /// one at a time. Blocks on the channel until each one is accepted.
    pub async fn run_apply_loop(self, apply_tx: mpsc::Sender<ApplyMsg>) {
        let notify = self.core.lock().await.apply_notifier();
        loop {
            if self.is_killed() {
                break;
            }
            let next = self.core.lock().await.next_apply_msg();
            match next {
                Some(msg) => {
                    if apply_tx.send(msg).await.is_err() {
                        warn!("apply channel closed, stopping apply loop");
                        break;
                    }
                }
                None => notify.notified().await,
            }
        }
    }
}

#[async_trait]
impl<T: Transport + 'static> RpcHandler for RaftNode<T> {
    async fn handle_request_vote(
        &self,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        if self.is_killed() {
            return Err(TransportError::ConnectionFailed);
        }
        let mut core = self.core.lock().await;
        core.handle_request_vote(&args)
            .map_err(|e| storage_failure(core.id, e))
    }

    async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        if self.is_killed() {
            return Err(TransportError::ConnectionFailed);
        }
        let mut core = self.core.lock().await;
        core.handle_append_entries(&args)
            .map_err(|e| storage_failure(core.id, e))
    }

    async fn handle_install_snapshot(
        &self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        if self.is_killed() {
            return Err(TransportError::ConnectionFailed);
        }
        let mut core = self.core.lock().await;
        core.handle_install_snapshot(&args)
            .map_err(|e| storage_failure(core.id, e))
    }
}
