//! HTTP transport implementation for Raft RPC
//!
//! Uses axum for the server and reqwest for the client. Bodies are JSON.
//! A handler that produces no reply answers 503 and the caller sees
//! `TransportError::Remote`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::core::raft_core::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::transport::{RpcHandler, Transport, TransportError};

/// HTTP transport for Raft RPC communication
pub struct HttpTransport {
    /// Map of node ID to address (e.g., "127.0.0.1:8001")
    peers: HashMap<u64, String>,
    /// HTTP client with timeout
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a new HTTP transport with peer addresses and a per-request timeout
    pub fn new(peers: HashMap<u64, String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Remote(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpTransport { peers, client })
    }

    async fn post<Req, Resp>(&self, target: u64, path: &str, args: &Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let addr = self
            .peers
            .get(&target)
            .ok_or(TransportError::NodeNotFound(target))?;
        let url = format!("http://{}{}", addr, path);

        let response = self
            .client
            .post(&url)
            .json(args)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::ConnectionFailed
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(peer = target, %status, "rpc rejected");
            return Err(TransportError::Remote(format!("{}: {}", status, body)));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request_vote(
        &self,
        target: u64,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        self.post(target, "/raft/request_vote", &args).await
    }

    async fn append_entries(
        &self,
        target: u64,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        self.post(target, "/raft/append_entries", &args).await
    }

    async fn install_snapshot(
        &self,
        target: u64,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        self.post(target, "/raft/install_snapshot", &args).await
    }
}

/// Shared state for the RPC server
pub type SharedHandler = Arc<dyn RpcHandler>;

/// Create an axum router serving Raft RPCs for `handler`
pub fn create_router(handler: SharedHandler) -> Router {
    Router::new()
        .route("/raft/request_vote", post(handle_request_vote))
        .route("/raft/append_entries", post(handle_append_entries))
        .route("/raft/install_snapshot", post(handle_install_snapshot))
        .with_state(handler)
}

fn reply<T: Serialize>(result: Result<T, TransportError>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn handle_request_vote(
    State(handler): State<SharedHandler>,
    Json(args): Json<RequestVoteArgs>,
) -> Response {
    reply(handler.handle_request_vote(args).await)
}

async fn handle_append_entries(
    State(handler): State<SharedHandler>,
    Json(args): Json<AppendEntriesArgs>,
) -> Response {
    reply(handler.handle_append_entries(args).await)
}

async fn handle_install_snapshot(
    State(handler): State<SharedHandler>,
    Json(args): Json<InstallSnapshotArgs>,
) -> Response {
    reply(handler.handle_install_snapshot(args).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Grants every vote, accepts every append, refuses snapshots
    struct StubHandler;

    #[async_trait]
    impl RpcHandler for StubHandler {
        async fn handle_request_vote(
            &self,
            args: RequestVoteArgs,
        ) -> Result<RequestVoteResult, TransportError> {
            Ok(RequestVoteResult {
                term: args.term,
                vote_granted: true,
            })
        }

        async fn handle_append_entries(
            &self,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesResult, TransportError> {
            Ok(AppendEntriesResult {
                term: args.term,
                success: true,
                ..Default::default()
            })
        }

        async fn handle_install_snapshot(
            &self,
            _args: InstallSnapshotArgs,
        ) -> Result<InstallSnapshotResult, TransportError> {
            Err(TransportError::Remote("node stopped".to_string()))
        }
    }

    async fn start_stub_server() -> String {
        let router = create_router(Arc::new(StubHandler));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    fn transport_to(addr: String) -> HttpTransport {
        HttpTransport::new(HashMap::from([(2, addr)]), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_http_request_vote() {
        let transport = transport_to(start_stub_server().await);
        let args = RequestVoteArgs {
            term: 3,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = transport.request_vote(2, args).await.unwrap();
        assert!(result.vote_granted);
        assert_eq!(result.term, 3);
    }

    #[tokio::test]
    async fn test_http_append_entries() {
        let transport = transport_to(start_stub_server().await);
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let result = transport.append_entries(2, args).await.unwrap();
        assert!(result.success);
        assert_eq!(result.conflict_term, None);
    }

    #[tokio::test]
    async fn test_http_handler_error_is_remote() {
        let transport = transport_to(start_stub_server().await);
        let args = InstallSnapshotArgs {
            term: 1,
            leader_id: 1,
            last_included_index: 5,
            last_included_term: 1,
            data: vec![1, 2, 3],
        };
        let result = transport.install_snapshot(2, args).await;
        assert!(matches!(result, Err(TransportError::Remote(_))));
    }

    #[tokio::test]
    async fn test_http_unreachable_peer() {
        let transport = HttpTransport::new(
            HashMap::from([(2, "127.0.0.1:9".to_string())]),
            Duration::from_millis(100),
        )
        .unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = transport.request_vote(2, args).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectionFailed) | Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_http_node_not_found() {
        let transport = HttpTransport::new(HashMap::new(), Duration::from_secs(5)).unwrap();
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let result = transport.request_vote(2, args).await;
        assert_eq!(result.unwrap_err(), TransportError::NodeNotFound(2));
    }
}
