//! Raft Consensus Algorithm Implementation
//!
//! This module implements the Raft consensus protocol as described in:
//! "In Search of an Understandable Consensus Algorithm" by Diego Ongaro and John Ousterhout
//!
//! `RaftCore` is synchronous and transport-agnostic. Every handler mutates
//! state, persists it, and only then returns the reply. A failed write undoes
//! the change in memory. Callers hold the core lock for the duration of one
//! call and never across network I/O.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use super::log::LogEntry;
use super::log::RaftLog;
use super::snapshot::{Snapshot, SnapshotMetadata};
use crate::storage::{HardState, Storage, StorageError};

/// Special no-op command appended by leaders on election.
/// This allows committing entries from previous terms indirectly.
pub const NOOP_COMMAND: &str = "NOOP";

/// Raft node states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Follower: Passive state, receives updates from leader
    Follower,
    /// Candidate: Actively seeking votes to become leader
    Candidate,
    /// Leader: Handles all client requests and replicates log
    Leader,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: u64,
    /// Candidate requesting vote
    pub candidate_id: u64,
    /// Index of candidate's last log entry
    pub last_log_index: u64,
    /// Term of candidate's last log entry
    pub last_log_term: u64,
}

/// RequestVote RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Current term, for candidate to update itself
    pub term: u64,
    /// True means candidate received vote
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: u64,
    /// Term of prev_log_index entry
    pub prev_log_term: u64,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: u64,
}

/// AppendEntries RPC results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Current term, for leader to update itself
    pub term: u64,
    /// True if follower contained entry matching prev_log_index and prev_log_term
    pub success: bool,
    /// Term of the follower's entry at prev_log_index.
    /// `None` when the follower has no entry there.
    pub conflict_term: Option<u64>,
    /// First index the follower holds with `conflict_term`, or its last index + 1
    pub conflict_index: u64,
    /// Number of slots missing between the follower's last entry and prev_log_index
    pub conflict_len: u64,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term
    pub term: u64,
    /// Leader's ID
    pub leader_id: u64,
    /// Last log index included in snapshot
    pub last_included_index: u64,
    /// Term of last included entry
    pub last_included_term: u64,
    /// Snapshot data
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    /// Current term, for leader to update itself
    pub term: u64,
}

/// One unit handed from consensus to the state machine, in log order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed log entry
    Command {
        index: u64,
        term: u64,
        command: String,
    },
    /// A snapshot replacing all state through `index`
    Snapshot { index: u64, term: u64, data: Vec<u8> },
}

/// What the leader sends to one peer on a replication tick
#[derive(Debug, Clone)]
pub enum ReplicationRequest {
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

/// Point-in-time view of a node for status endpoints and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: u64,
    pub state: RaftState,
    pub term: u64,
    pub leader: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
}

/// Durable fields as they were before a change
struct Checkpoint {
    current_term: u64,
    voted_for: Option<u64>,
    state: RaftState,
    current_leader: Option<u64>,
    log: Option<RaftLog>,
}

/// Core Raft state machine (sync, transport-agnostic)
pub struct RaftCore {
    // Storage backend for persistent state
    storage: Box<dyn Storage>,

    // Persistent state on all servers (updated on stable storage before responding to RPCs)
    /// Latest term server has seen (initialized to 0 on first boot, increases monotonically)
    pub current_term: u64,
    /// Candidate ID that received vote in current term (or None if none)
    pub voted_for: Option<u64>,
    /// Log entries after the latest snapshot
    pub log: RaftLog,

    // Volatile state on all servers
    /// Index of highest log entry known to be committed (increases monotonically)
    pub commit_index: u64,
    /// Index of highest log entry handed to the state machine (increases monotonically)
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    /// For each server, index of next log entry to send to that server
    pub next_index: HashMap<u64, u64>,
    /// For each server, index of highest log entry known to be replicated on server
    pub match_index: HashMap<u64, u64>,

    // Node-specific state
    /// Unique identifier for this node
    pub id: u64,
    /// Current state of this node
    pub state: RaftState,
    /// IDs of other nodes in the cluster
    pub peers: Vec<u64>,
    /// Current known leader (updated when receiving valid AppendEntries)
    pub current_leader: Option<u64>,
    /// Last time we heard from a valid leader or granted a vote
    pub last_heartbeat: Instant,

    /// Latest durable snapshot, sent to peers that fell behind it
    snapshot: Option<Snapshot>,
    /// Snapshot waiting to be handed to the state machine
    pending_snapshot: Option<Snapshot>,
    /// Signalled whenever there is something new to apply
    apply_notify: Arc<Notify>,
}

impl RaftCore {
    /// Create a new Raft core on top of `storage`.
    ///
    /// The snapshot is loaded first, then term, vote and log. A restored
    /// snapshot is queued as the first message for the state machine.
    pub fn new(id: u64, peers: Vec<u64>, storage: Box<dyn Storage>) -> Result<Self, StorageError> {
        let snapshot = storage.load_snapshot()?;
        let hard_state = storage.load_state()?.unwrap_or_default();

        let metadata = snapshot
            .as_ref()
            .map(|s| s.metadata)
            .unwrap_or_default();
        let log = RaftLog::restore(metadata, hard_state.log);

        // Everything in the snapshot is committed and applied
        let commit_index = metadata.last_included_index;
        let last_applied = metadata.last_included_index;

        if snapshot.is_some() || !log.is_empty() {
            info!(
                node = id,
                term = hard_state.current_term,
                snapshot_index = metadata.last_included_index,
                last_index = log.last_index(),
                "restored persistent state"
            );
        }

        Ok(RaftCore {
            storage,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            log,
            commit_index,
            last_applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            id,
            state: RaftState::Follower,
            peers,
            current_leader: None,
            last_heartbeat: Instant::now(),
            pending_snapshot: snapshot.clone(),
            snapshot,
            apply_notify: Arc::new(Notify::new()),
        })
    }

    /// Handle used by the apply loop to wait for new work
    pub fn apply_notifier(&self) -> Arc<Notify> {
        self.apply_notify.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state == RaftState::Leader
    }

    /// Number of votes (or replicas) that make a strict majority
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last_term()
    }

    /// Size in bytes of the persisted consensus state
    pub fn state_size(&self) -> usize {
        self.storage.state_size()
    }

    pub fn latest_snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id,
            state: self.state,
            term: self.current_term,
            leader: self.current_leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
        }
    }

    // === Persistence helpers ===

    fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
            log: self.log.entries().to_vec(),
        }
    }

    /// Remember term, vote and role before changing them; the log as well
    /// when `with_log` is set
    fn checkpoint(&self, with_log: bool) -> Checkpoint {
        Checkpoint {
            current_term: self.current_term,
            voted_for: self.voted_for,
            state: self.state,
            current_leader: self.current_leader,
            log: with_log.then(|| self.log.clone()),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        self.current_term = checkpoint.current_term;
        self.voted_for = checkpoint.voted_for;
        self.state = checkpoint.state;
        self.current_leader = checkpoint.current_leader;
        if let Some(log) = checkpoint.log {
            self.log = log;
        }
    }

    /// Write term, vote and log together. If the write fails, the state goes
    /// back to `checkpoint`: nothing that is not on disk may be acted upon.
    fn persist(&mut self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        let state = self.hard_state();
        if let Err(e) = self.storage.save_state(&state) {
            warn!(node = self.id, error = %e, "failed to persist state, rolling back");
            self.restore(checkpoint);
            return Err(e);
        }
        Ok(())
    }

    /// Like `persist`, saving `snapshot` in the same step
    fn persist_with_snapshot(
        &mut self,
        snapshot: Snapshot,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError> {
        let state = self.hard_state();
        if let Err(e) = self.storage.save_state_and_snapshot(&state, &snapshot) {
            warn!(node = self.id, error = %e, "failed to persist snapshot, rolling back");
            self.restore(checkpoint);
            return Err(e);
        }
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Adopt a higher term: clear the vote and fall back to follower.
    /// Returns true if anything changed; the caller persists.
    fn observe_term(&mut self, term: u64) -> bool {
        if term <= self.current_term {
            return false;
        }
        let old_state = self.state;
        self.current_term = term;
        self.voted_for = None;
        self.state = RaftState::Follower;
        self.current_leader = None;
        if old_state != RaftState::Follower {
            info!(node = self.id, term, was = ?old_state, "stepped down to follower");
        }
        true
    }

    fn signal_apply(&self) {
        self.apply_notify.notify_one();
    }

    // === Inbound RPCs ===

    /// Handle RequestVote RPC
    pub fn handle_request_vote(
        &mut self,
        args: &RequestVoteArgs,
    ) -> Result<RequestVoteResult, StorageError> {
        // Decline requests with stale term immediately
        if args.term < self.current_term {
            return Ok(RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            });
        }

        let checkpoint = self.checkpoint(false);
        let mut dirty = self.observe_term(args.term);

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(args.candidate_id);
        let vote_granted =
            can_vote && self.log.is_up_to_date(args.last_log_term, args.last_log_index);

        if vote_granted {
            if self.voted_for != Some(args.candidate_id) {
                self.voted_for = Some(args.candidate_id);
                dirty = true;
            }
            self.last_heartbeat = Instant::now();
            debug!(node = self.id, term = self.current_term, candidate = args.candidate_id, "granted vote");
        }

        if dirty {
            self.persist(checkpoint)?;
        }

        Ok(RequestVoteResult {
            term: self.current_term,
            vote_granted,
        })
    }

    /// Handle AppendEntries RPC (heartbeat or log replication)
    pub fn handle_append_entries(
        &mut self,
        args: &AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, StorageError> {
        // Reply false if term < currentTerm, without touching the timer
        if args.term < self.current_term {
            return Ok(AppendEntriesResult {
                term: self.current_term,
                ..Default::default()
            });
        }

        let checkpoint = self.checkpoint(!args.entries.is_empty());
        let mut dirty = self.observe_term(args.term);

        // Valid AppendEntries from current leader - reset election timeout
        if self.state != RaftState::Follower {
            info!(node = self.id, term = self.current_term, leader = args.leader_id, "stepped down to follower");
        }
        self.state = RaftState::Follower;
        self.current_leader = Some(args.leader_id);
        self.last_heartbeat = Instant::now();

        let last_index = self.log.last_index();

        // No entry at prev_log_index
        if args.prev_log_index > last_index {
            if dirty {
                self.persist(checkpoint)?;
            }
            return Ok(AppendEntriesResult {
                term: self.current_term,
                success: false,
                conflict_term: None,
                conflict_index: last_index + 1,
                conflict_len: args.prev_log_index - last_index,
            });
        }

        // Entry at prev_log_index with the wrong term. A prev_log_index inside
        // the snapshot always matches: compacted entries are committed.
        if args.prev_log_index > self.log.snapshot_index() {
            let local_term = self.log.term_at(args.prev_log_index).unwrap_or_default();
            if local_term != args.prev_log_term {
                if dirty {
                    self.persist(checkpoint)?;
                }
                return Ok(AppendEntriesResult {
                    term: self.current_term,
                    success: false,
                    conflict_term: Some(local_term),
                    conflict_index: self.log.first_index_of_term_run(args.prev_log_index),
                    conflict_len: 0,
                });
            }
        }

        if self.log.merge(&args.entries) {
            dirty = true;
            debug!(
                node = self.id,
                term = self.current_term,
                last_index = self.log.last_index(),
                "replicated entries"
            );
        }
        if dirty {
            self.persist(checkpoint)?;
        }

        // If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if args.leader_commit > self.commit_index {
            let last_new = (args.prev_log_index + args.entries.len() as u64).min(self.log.last_index());
            let new_commit = args.leader_commit.min(last_new);
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                self.signal_apply();
            }
        }

        Ok(AppendEntriesResult {
            term: self.current_term,
            success: true,
            ..Default::default()
        })
    }

    /// Handle InstallSnapshot RPC
    pub fn handle_install_snapshot(
        &mut self,
        args: &InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, StorageError> {
        // Reply immediately if term < currentTerm
        if args.term < self.current_term {
            return Ok(InstallSnapshotResult {
                term: self.current_term,
            });
        }

        let mut checkpoint = self.checkpoint(false);
        let dirty = self.observe_term(args.term);
        self.state = RaftState::Follower;
        self.current_leader = Some(args.leader_id);
        self.last_heartbeat = Instant::now();

        // Nothing new: we already hold (and have committed) everything it covers
        if args.last_included_index <= self.log.snapshot_index()
            || args.last_included_index <= self.commit_index
        {
            if dirty {
                self.persist(checkpoint)?;
            }
            return Ok(InstallSnapshotResult {
                term: self.current_term,
            });
        }

        checkpoint.log = Some(self.log.clone());
        self.log
            .compact(args.last_included_index, args.last_included_term);
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: args.last_included_index,
                last_included_term: args.last_included_term,
            },
            data: args.data.clone(),
        };
        self.persist_with_snapshot(snapshot.clone(), checkpoint)?;

        self.commit_index = self.commit_index.max(args.last_included_index);
        info!(
            node = self.id,
            term = self.current_term,
            index = args.last_included_index,
            leader = args.leader_id,
            "installed snapshot"
        );
        self.pending_snapshot = Some(snapshot);
        self.signal_apply();

        Ok(InstallSnapshotResult {
            term: self.current_term,
        })
    }

    // === Elections ===

    /// Start a new election (called when election timeout elapses).
    /// Returns the request to fan out to every peer.
    pub fn start_election(&mut self) -> Result<RequestVoteArgs, StorageError> {
        let checkpoint = self.checkpoint(false);
        self.current_term += 1;
        self.state = RaftState::Candidate;
        self.voted_for = Some(self.id);
        self.current_leader = None;
        // Reset election timer so we don't immediately time out again
        self.last_heartbeat = Instant::now();
        self.persist(checkpoint)?;

        info!(node = self.id, term = self.current_term, "became candidate");

        Ok(RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Process a RequestVote reply for an election held in `election_term`.
    /// Returns true if the reply is a vote that still counts.
    pub fn handle_request_vote_result(
        &mut self,
        election_term: u64,
        result: &RequestVoteResult,
    ) -> Result<bool, StorageError> {
        let checkpoint = self.checkpoint(false);
        if self.observe_term(result.term) {
            self.persist(checkpoint)?;
            return Ok(false);
        }
        Ok(result.vote_granted
            && self.state == RaftState::Candidate
            && self.current_term == election_term)
    }

    /// Become leader for `term` after winning its election.
    ///
    /// Does nothing (returns false) if the node is no longer a candidate in
    /// that term. Otherwise reinitializes replication state and appends a
    /// no-op entry so entries from previous terms can commit.
    pub fn become_leader(&mut self, term: u64) -> Result<bool, StorageError> {
        if self.state != RaftState::Candidate || self.current_term != term {
            return Ok(false);
        }

        let checkpoint = self.checkpoint(true);
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        self.last_heartbeat = Instant::now();
        info!(node = self.id, term = self.current_term, "became leader");

        // Reinitialize next_index and match_index BEFORE appending no-op
        // so the first round carries it
        let next = self.log.last_index() + 1;
        self.next_index = self.peers.iter().map(|&p| (p, next)).collect();
        self.match_index = self.peers.iter().map(|&p| (p, 0)).collect();

        let index = self.log.append(self.current_term, NOOP_COMMAND.to_string());
        self.persist(checkpoint)?;
        debug!(node = self.id, term = self.current_term, index, "appended no-op entry");

        self.advance_commit_index();
        Ok(true)
    }

    // === Client proposals ===

    /// Append `command` if this node is leader.
    /// Returns `(index, term)` of the new entry, or `None` when not leader.
    pub fn propose(&mut self, command: String) -> Result<Option<(u64, u64)>, StorageError> {
        if self.state != RaftState::Leader {
            return Ok(None);
        }

        let checkpoint = self.checkpoint(true);
        let index = self.log.append(self.current_term, command);
        self.persist(checkpoint)?;
        debug!(node = self.id, term = self.current_term, index, "appended entry");

        // A single-node cluster commits on its own
        self.advance_commit_index();
        Ok(Some((index, self.current_term)))
    }

    // === Replication (leader side) ===

    /// Build the next request for `peer`: AppendEntries from its next index,
    /// or InstallSnapshot if that index has been compacted away.
    pub fn replication_request(
        &self,
        peer: u64,
    ) -> Result<Option<ReplicationRequest>, StorageError> {
        if self.state != RaftState::Leader {
            return Ok(None);
        }

        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);

        if next <= self.log.snapshot_index() {
            let Some(snapshot) = &self.snapshot else {
                warn!(node = self.id, peer, "compacted log but no snapshot held");
                return Ok(None);
            };
            return Ok(Some(ReplicationRequest::InstallSnapshot(InstallSnapshotArgs {
                term: self.current_term,
                leader_id: self.id,
                last_included_index: snapshot.metadata.last_included_index,
                last_included_term: snapshot.metadata.last_included_term,
                data: snapshot.data.clone(),
            })));
        }

        let prev_log_index = next - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or_default();
        Ok(Some(ReplicationRequest::AppendEntries(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next),
            leader_commit: self.commit_index,
        })))
    }

    /// Handle an AppendEntries reply from `peer` to the request `args`.
    ///
    /// Replies may arrive late, duplicated or out of order: `match_index`
    /// only grows and `next_index` never drops below `match_index + 1`.
    pub fn handle_append_entries_result(
        &mut self,
        peer: u64,
        args: &AppendEntriesArgs,
        result: &AppendEntriesResult,
    ) -> Result<(), StorageError> {
        let checkpoint = self.checkpoint(false);
        if self.observe_term(result.term) {
            self.persist(checkpoint)?;
            return Ok(());
        }
        if self.state != RaftState::Leader || args.term != self.current_term {
            return Ok(());
        }

        let matched = self.match_index.get(&peer).copied().unwrap_or(0);

        if result.success {
            let replicated = args.prev_log_index + args.entries.len() as u64;
            let matched = matched.max(replicated);
            self.match_index.insert(peer, matched);
            let next = self.next_index.entry(peer).or_insert(1);
            *next = (*next).max(matched + 1);
            self.advance_commit_index();
            return Ok(());
        }

        let backoff = match result.conflict_term {
            None => (args.prev_log_index + 1).saturating_sub(result.conflict_len),
            Some(term) => self
                .log
                .last_index_of_term(term, args.prev_log_index)
                .map(|index| index + 1)
                .unwrap_or(result.conflict_index),
        };
        let next = backoff.max(matched + 1).max(1);
        debug!(node = self.id, peer, next, "append rejected, backing off");
        self.next_index.insert(peer, next);
        Ok(())
    }

    /// Handle an InstallSnapshot reply from `peer` to the request `args`
    pub fn handle_install_snapshot_result(
        &mut self,
        peer: u64,
        args: &InstallSnapshotArgs,
        result: &InstallSnapshotResult,
    ) -> Result<(), StorageError> {
        let checkpoint = self.checkpoint(false);
        if self.observe_term(result.term) {
            self.persist(checkpoint)?;
            return Ok(());
        }
        if self.state != RaftState::Leader || args.term != self.current_term {
            return Ok(());
        }

        let matched = self
            .match_index
            .get(&peer)
            .copied()
            .unwrap_or(0)
            .max(args.last_included_index);
        self.match_index.insert(peer, matched);
        let next = self.next_index.entry(peer).or_insert(1);
        *next = (*next).max(matched + 1);
        self.advance_commit_index();
        Ok(())
    }

    /// Advance commit_index to the largest N replicated on a majority with
    /// `log[N].term == current_term`. Returns true if it moved.
    pub fn advance_commit_index(&mut self) -> bool {
        if self.state != RaftState::Leader {
            return false;
        }

        let majority = self.majority();
        let mut n = self.log.last_index();
        while n > self.commit_index {
            match self.log.term_at(n) {
                Some(term) if term == self.current_term => {}
                // Older terms only commit indirectly
                _ => break,
            }
            let replicas = 1 + self.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= majority {
                debug!(node = self.id, term = self.current_term, index = n, replicas, "committed");
                self.commit_index = n;
                self.signal_apply();
                return true;
            }
            n -= 1;
        }
        false
    }

    // === Compaction and delivery ===

    /// Compact the log through `index` using a state-machine snapshot taken
    /// at that index. Ignored if `index` is already compacted or not yet applied.
    pub fn snapshot(&mut self, index: u64, data: Vec<u8>) -> Result<(), StorageError> {
        if index <= self.log.snapshot_index() || index > self.last_applied {
            return Ok(());
        }
        let Some(term) = self.log.term_at(index) else {
            return Ok(());
        };

        let checkpoint = self.checkpoint(true);
        self.log.compact(index, term);
        let snapshot = Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: index,
                last_included_term: term,
            },
            data,
        };
        self.persist_with_snapshot(snapshot, checkpoint)?;
        info!(node = self.id, term = self.current_term, index, "log compacted");
        Ok(())
    }

    /// Take the next message for the state machine, if any.
    /// A pending snapshot always goes before further commands.
    pub fn next_apply_msg(&mut self) -> Option<ApplyMsg> {
        if let Some(snapshot) = self.pending_snapshot.take() {
            let index = snapshot.metadata.last_included_index;
            self.last_applied = self.last_applied.max(index);
            return Some(ApplyMsg::Snapshot {
                index,
                term: snapshot.metadata.last_included_term,
                data: snapshot.data,
            });
        }

        if self.last_applied >= self.commit_index {
            return None;
        }

        // Entries folded into the snapshot were delivered through it
        if self.last_applied < self.log.snapshot_index() {
            self.last_applied = self.log.snapshot_index();
            if self.last_applied >= self.commit_index {
                return None;
            }
        }

        let index = self.last_applied + 1;
        let entry = self.log.get(index)?;
        let msg = ApplyMsg::Command {
            index,
            term: entry.term,
            command: entry.command.clone(),
        };
        self.last_applied = index;
        Some(msg)
    }
}
