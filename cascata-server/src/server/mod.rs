use crate::config::Config;
use crate::telemetry;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use cascata_core::{
    CascataError, ContextStore, EventBus, NodeRole, PeerDirectory, Propagator, Result,
    UpstreamHandle,
};
use std::sync::Arc;
use tokio::net::TcpListener;

mod contexts;
mod internal;
mod stream;
mod types;

pub use types::*;

pub struct ServerState {
    pub store: Arc<ContextStore>,
    pub bus: EventBus,
    pub directory: Arc<dyn PeerDirectory>,
    /// Present on central only; replicas never propagate.
    pub propagator: Option<Arc<Propagator>>,
    /// Upstream the sync loop currently follows; replicas forward writes to
    /// the same node.
    pub upstream_handle: UpstreamHandle,
    pub http_client: reqwest::Client,
    pub config: Config,
}

impl ServerState {
    pub fn role(&self) -> NodeRole {
        self.config.server_type
    }
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/contexts", get(contexts::list_contexts))
        .route("/contexts/stream", get(stream::all_contexts_stream))
        .route(
            "/contexts/:id",
            get(contexts::get_context)
                .put(contexts::put_context)
                .delete(contexts::delete_context),
        )
        .route("/contexts/:id/metadata", get(contexts::get_context_metadata))
        .route("/contexts/:id/stream", get(stream::context_stream))
        .route(
            "/internal/v1/contexts/:id",
            put(internal::internal_put_context).delete(internal::internal_delete_context),
        )
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

pub async fn run_server(state: Arc<ServerState>, listener: TcpListener) -> Result<()> {
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| CascataError::Http(error.to_string()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!("failed to install SIGTERM handler: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

async fn health(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        server_type: state.role().to_string(),
        node_id: state.config.node_id.clone(),
        region_id: state.config.region_id.clone(),
    })
}

async fn status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let contexts = match state.store.count().await {
        Ok(count) => count,
        Err(error) => return error_to_response(error),
    };

    let peers = match state.directory.peers().await {
        Ok(peers) => peers,
        Err(error) => {
            tracing::warn!("peer directory unavailable for status: error={}", error);
            Vec::new()
        }
    };

    let upstream = match state.role() {
        NodeRole::Central => None,
        _ => state
            .upstream_handle
            .get()
            .or_else(|| state.config.central_authority.clone()),
    };

    (
        StatusCode::OK,
        Json(StatusResponse {
            status: "ok".to_string(),
            server_type: state.role().to_string(),
            node_id: state.config.node_id.clone(),
            region_id: state.config.region_id.clone(),
            contexts,
            upstream,
            peers,
        }),
    )
        .into_response()
}

async fn metrics_text() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        telemetry::render(),
    )
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn error_to_response(error: CascataError) -> Response {
    let status = match &error {
        CascataError::NotFound(_) => StatusCode::NOT_FOUND,
        CascataError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        CascataError::Upstream(_) | CascataError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    response_error(status, error.to_string())
}
