//! In-memory transport implementation for testing
//!
//! `InMemoryNetwork` routes calls between registered `RpcHandler`s in one
//! process. Each node can be disconnected to simulate a partition, and the
//! whole network can be made unreliable: calls are delayed by a random
//! amount and either the request or the reply may be lost.

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{RpcHandler, Transport, TransportError};

/// Upper bound of the random delay added to each call when unreliable
const MAX_UNRELIABLE_DELAY_MS: u64 = 27;
/// How long a call to or from a disconnected node takes to fail
const DISCONNECTED_DELAY_MS: u64 = 20;
/// Probability of losing the request, and separately the reply
const LOSS_PROBABILITY: f64 = 0.1;

/// Request types that can be sent to a node
enum Request {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

enum Response {
    RequestVote(RequestVoteResult),
    AppendEntries(AppendEntriesResult),
    InstallSnapshot(InstallSnapshotResult),
}

#[derive(Default)]
struct NetworkInner {
    handlers: RwLock<HashMap<u64, Arc<dyn RpcHandler>>>,
    disconnected: RwLock<HashSet<u64>>,
    unreliable: AtomicBool,
    rpc_count: AtomicU64,
}

/// Simulated network shared by every node of a test cluster
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route calls addressed to `id` to `handler`, replacing any previous one
    pub fn register(&self, id: u64, handler: Arc<dyn RpcHandler>) {
        self.inner.handlers.write().insert(id, handler);
    }

    /// Stop routing calls to `id`; calls fail with `NodeNotFound`
    pub fn unregister(&self, id: u64) {
        self.inner.handlers.write().remove(&id);
    }

    /// Cut `id` off from every other node
    pub fn disconnect(&self, id: u64) {
        trace!(node = id, "disconnected");
        self.inner.disconnected.write().insert(id);
    }

    /// Undo `disconnect`
    pub fn connect(&self, id: u64) {
        trace!(node = id, "connected");
        self.inner.disconnected.write().remove(&id);
    }

    pub fn is_connected(&self, id: u64) -> bool {
        !self.inner.disconnected.read().contains(&id)
    }

    /// Toggle random delays and message loss for every call
    pub fn set_reliable(&self, reliable: bool) {
        self.inner.unreliable.store(!reliable, Ordering::SeqCst);
    }

    fn is_reliable(&self) -> bool {
        !self.inner.unreliable.load(Ordering::SeqCst)
    }

    /// Number of calls attempted so far
    pub fn rpc_count(&self) -> u64 {
        self.inner.rpc_count.load(Ordering::SeqCst)
    }

    /// Outbound transport for node `id`
    pub fn transport_for(&self, id: u64) -> InMemoryTransport {
        InMemoryTransport {
            from: id,
            network: self.clone(),
        }
    }

    fn link_up(&self, from: u64, to: u64) -> bool {
        let disconnected = self.inner.disconnected.read();
        !disconnected.contains(&from) && !disconnected.contains(&to)
    }

    fn lose_message(&self) -> bool {
        !self.is_reliable() && rand::rng().random_bool(LOSS_PROBABILITY)
    }

    async fn deliver(&self, from: u64, to: u64, request: Request) -> Result<Response, TransportError> {
        self.inner.rpc_count.fetch_add(1, Ordering::SeqCst);

        if !self.link_up(from, to) {
            tokio::time::sleep(Duration::from_millis(DISCONNECTED_DELAY_MS)).await;
            return Err(TransportError::ConnectionFailed);
        }

        let handler = self
            .inner
            .handlers
            .read()
            .get(&to)
            .cloned()
            .ok_or(TransportError::NodeNotFound(to))?;

        if !self.is_reliable() {
            let delay = rand::rng().random_range(0..=MAX_UNRELIABLE_DELAY_MS);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.lose_message() {
            trace!(from, to, "request lost");
            return Err(TransportError::ConnectionFailed);
        }

        let response = match request {
            Request::RequestVote(args) => {
                Response::RequestVote(handler.handle_request_vote(args).await?)
            }
            Request::AppendEntries(args) => {
                Response::AppendEntries(handler.handle_append_entries(args).await?)
            }
            Request::InstallSnapshot(args) => {
                Response::InstallSnapshot(handler.handle_install_snapshot(args).await?)
            }
        };

        // A partition that formed while the handler ran swallows the reply
        if !self.link_up(from, to) || self.lose_message() {
            trace!(from, to, "reply lost");
            return Err(TransportError::ConnectionFailed);
        }
        Ok(response)
    }
}

/// Transport used by one node to reach its peers over an `InMemoryNetwork`
#[derive(Clone)]
pub struct InMemoryTransport {
    from: u64,
    network: InMemoryNetwork,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        match self
            .network
            .deliver(self.from, target, Request::RequestVote(args))
            .await?
        {
            Response::RequestVote(result) => Ok(result),
            _ => Err(TransportError::ConnectionFailed),
        }
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        match self
            .network
            .deliver(self.from, target, Request::AppendEntries(args))
            .await?
        {
            Response::AppendEntries(result) => Ok(result),
            _ => Err(TransportError::ConnectionFailed),
        }
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        match self
            .network
            .deliver(self.from, target, Request::InstallSnapshot(args))
            .await?
        {
            Response::InstallSnapshot(result) => Ok(result),
            _ => Err(TransportError::ConnectionFailed),
        }
    }
}
