//! HTTP client API for the KV service
//!
//! - `POST /kv/get` - `GetArgs` in, `GetReply` out
//! - `POST /kv/put_append` - `PutAppendArgs` in, 204 on success
//! - `GET /kv/status` - `KvStatus` of this server
//!
//! Errors come back as `ErrorResponse` with a status code per `KvError`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::state_machine::{GetArgs, GetReply, KvError, KvServer, KvStatus, PutAppendArgs};
use crate::transport::Transport;

/// Error body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: KvError,
    /// Leader hint (node ID) if known, for redirect
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub leader_hint: Option<u64>,
}

pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn status_code(err: &KvError) -> StatusCode {
    match err {
        KvError::NotLeader => StatusCode::SERVICE_UNAVAILABLE,
        KvError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        KvError::OutdatedLeader => StatusCode::CONFLICT,
        KvError::KeyNotFound => StatusCode::NOT_FOUND,
    }
}

async fn api_error<T: Transport + 'static>(kv: &KvServer<T>, error: KvError) -> ApiError {
    let leader_hint = match error {
        KvError::NotLeader => kv.raft().status().await.leader.filter(|&l| l != kv.id()),
        _ => None,
    };
    ApiError {
        status: status_code(&error),
        body: ErrorResponse { error, leader_hint },
    }
}

/// Create an axum router serving the client API of `kv`
pub fn create_client_router<T: Transport + 'static>(kv: KvServer<T>) -> Router {
    Router::new()
        .route("/kv/get", post(handle_get::<T>))
        .route("/kv/put_append", post(handle_put_append::<T>))
        .route("/kv/status", get(handle_status::<T>))
        .with_state(kv)
}

async fn handle_get<T: Transport + 'static>(
    State(kv): State<KvServer<T>>,
    Json(args): Json<GetArgs>,
) -> Result<Json<GetReply>, ApiError> {
    match kv.get(args).await {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => Err(api_error(&kv, e).await),
    }
}

async fn handle_put_append<T: Transport + 'static>(
    State(kv): State<KvServer<T>>,
    Json(args): Json<PutAppendArgs>,
) -> Result<StatusCode, ApiError> {
    match kv.put_append(args).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(api_error(&kv, e).await),
    }
}

async fn handle_status<T: Transport + 'static>(State(kv): State<KvServer<T>>) -> Json<KvStatus> {
    Json(kv.status().await)
}
