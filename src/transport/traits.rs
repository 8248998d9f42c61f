//! Transport abstraction for Raft RPC communication
//!
//! `Transport` is the outbound side used by a node to call its peers.
//! `RpcHandler` is the inbound side a transport delivers calls to.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};

/// Transport abstraction for Raft RPC communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Send an InstallSnapshot RPC to a peer node
    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;
}

/// Receiving end of the Raft RPCs.
///
/// An `Err` means the call had no reply (node stopped, state could not be
/// persisted); the caller treats it like a lost message.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle_request_vote(
        &self,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    async fn handle_install_snapshot(
        &self,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the target node failed, or the message was lost
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("node {0} not found")]
    NodeNotFound(u64),
    /// The peer received the call but did not produce a reply
    #[error("remote error: {0}")]
    Remote(String),
}
