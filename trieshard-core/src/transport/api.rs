//! HTTP surface of the manager
//!
//! Every handler forwards to the [`ManagerHandle`] and waits for the event
//! loop's answer; none of them sees cluster state directly.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::coordinator::ManagerHandle;
use crate::error::ManagerError;
use crate::protocol::{
    ClusterSnapshot, HeartbeatAck, OperationId, RegisterWorkerRequest, RegisterWorkerResponse, SplitStatus,
    SplitTrieRequest, SplitTrieRequestAck, SplitTrieResponse, SplitWordResponse,
};
use crate::shutdown::ShutdownSignal;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub handle: ManagerHandle,
}

/// Error body returned by the RPC surface
#[derive(Debug)]
pub enum ApiError {
    Manager(ManagerError),
    UnknownOperation(OperationId),
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        ApiError::Manager(e)
    }
}

/// HTTP status for a manager error
pub fn status_for(error: &ManagerError) -> StatusCode {
    match error {
        ManagerError::Duplicate { .. } => StatusCode::CONFLICT,
        ManagerError::InvalidSplit { .. } | ManagerError::InvalidAddress { .. } => StatusCode::BAD_REQUEST,
        ManagerError::WorkerNotRegistered { .. } => StatusCode::NOT_FOUND,
        ManagerError::Conflict { .. } | ManagerError::NotFound { .. } | ManagerError::Internal { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ManagerError::Unavailable { .. } | ManagerError::ShutdownInProgress => StatusCode::SERVICE_UNAVAILABLE,
        ManagerError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        ManagerError::ConnectionFailed { .. } => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retryable) = match self {
            ApiError::Manager(e) => {
                if e.is_consistency_violation() {
                    error!("Consistency violation surfaced to caller: {}", e);
                }
                (status_for(&e), e.to_string(), e.is_retryable())
            }
            ApiError::UnknownOperation(id) => {
                (StatusCode::NOT_FOUND, format!("Unknown split operation {}", id), false)
            }
        };
        (status, Json(json!({ "error": message, "retryable": retryable }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the router for the manager's RPC surface
pub fn router(handle: ManagerHandle) -> Router {
    Router::new()
        .route("/workers/register", post(register_worker))
        .route("/workers/heartbeat", post(heartbeat_ack))
        .route("/splits", post(split_trie))
        .route("/splits/ack", post(split_ack))
        .route("/splits/:id", get(split_status))
        .route("/route/:word", get(split_word))
        .route("/cluster", get(cluster))
        .route("/metrics", get(|| async { crate::metrics::gather_metrics() }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { handle })
}

/// Serve the RPC surface until shutdown fires
pub async fn serve(listener: TcpListener, handle: ManagerHandle, shutdown: ShutdownSignal) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Manager RPC listening on {}", addr);
    }
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

pub async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkerRequest>,
) -> ApiResult<RegisterWorkerResponse> {
    Ok(Json(state.handle.register_worker(request.address).await?))
}

/// Heartbeat acks are queued; anything wrong with them is only logged
pub async fn heartbeat_ack(State(state): State<AppState>, Json(ack): Json<HeartbeatAck>) -> Result<StatusCode, ApiError> {
    state.handle.heartbeat_ack(ack).await?;
    Ok(StatusCode::OK)
}

pub async fn split_trie(
    State(state): State<AppState>,
    Json(request): Json<SplitTrieRequest>,
) -> ApiResult<SplitTrieResponse> {
    Ok(Json(state.handle.request_split(request).await?))
}

pub async fn split_ack(
    State(state): State<AppState>,
    Json(ack): Json<SplitTrieRequestAck>,
) -> Result<StatusCode, ApiError> {
    debug!("Split ack for {} from {}: {:?}", ack.operation_id, ack.worker_id, ack.status);
    state.handle.split_ack(ack).await?;
    Ok(StatusCode::OK)
}

pub async fn split_status(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<SplitStatus> {
    let operation_id = OperationId(id);
    match state.handle.split_status(operation_id).await? {
        Some(status) => Ok(Json(status)),
        None => Err(ApiError::UnknownOperation(operation_id)),
    }
}

pub async fn split_word(State(state): State<AppState>, Path(word): Path<String>) -> ApiResult<SplitWordResponse> {
    Ok(Json(state.handle.route_word(word).await?))
}

pub async fn cluster(State(state): State<AppState>) -> ApiResult<ClusterSnapshot> {
    Ok(Json(state.handle.snapshot().await?))
}
