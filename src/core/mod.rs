//! Consensus module
//!
//! - `RaftLog`: indexed log with a compacted prefix
//! - `RaftCore`: synchronous protocol state and RPC handlers
//! - `RaftNode`: async fan-out of elections and replication
//! - `RaftServer` / `RaftHandle`: background loops and the public API

pub mod config;
pub mod log;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;
pub mod snapshot;

pub use config::RaftConfig;
pub use log::{LogEntry, RaftLog};
pub use raft_core::{ApplyMsg, RaftCore, RaftState, RaftStatus, NOOP_COMMAND};
pub use raft_node::{RaftNode, SharedCore};
pub use raft_server::{RaftError, RaftHandle, RaftServer};
pub use snapshot::{Snapshot, SnapshotMetadata};
