//! Internal apply surface.
//!
//! Central pushes propagated changes here. Bodies carry the authoritative
//! metadata, version included; application is idempotent and never
//! republishes, so pushes can be retried or arrive out of order safely.

use super::{error_to_response, response_error, ServerState};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cascata_core::{InternalApplyRequest, InternalApplyResponse};
use std::sync::Arc;

pub(crate) async fn internal_put_context(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request: InternalApplyRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return response_error(
                StatusCode::BAD_REQUEST,
                format!("invalid apply body: {}", error),
            )
        }
    };

    match state
        .store
        .apply_save(&id, &request.context, &request.metadata)
        .await
    {
        Ok(applied) => {
            if applied {
                tracing::debug!(
                    "applied pushed update: context={} version={}",
                    id,
                    request.metadata.version
                );
            }
            (StatusCode::OK, Json(InternalApplyResponse { applied })).into_response()
        }
        Err(error) => error_to_response(error),
    }
}

pub(crate) async fn internal_delete_context(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.apply_delete(&id).await {
        Ok(applied) => {
            if applied {
                tracing::debug!("applied pushed delete: context={}", id);
            }
            (StatusCode::OK, Json(InternalApplyResponse { applied })).into_response()
        }
        Err(error) => error_to_response(error),
    }
}
