use super::{error_to_response, response_error, ListQuery, ServerState};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cascata_core::{
    CascataError, NodeRole, PropagatedChange, SaveContextRequest, SaveContextResponse,
    UpstreamClient,
};
use std::sync::Arc;

pub(crate) async fn list_contexts(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    if query.include_metadata {
        match state.store.list_with_metadata().await {
            Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
            Err(error) => error_to_response(error),
        }
    } else {
        match state.store.list().await {
            Ok(ids) => (StatusCode::OK, Json(ids)).into_response(),
            Err(error) => error_to_response(error),
        }
    }
}

pub(crate) async fn get_context(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get(&id).await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(error) => error_to_response(error),
    }
}

pub(crate) async fn get_context_metadata(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.get_metadata(&id).await {
        Ok(metadata) => (StatusCode::OK, Json(metadata)).into_response(),
        Err(error) => error_to_response(error),
    }
}

pub(crate) async fn put_context(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request: SaveContextRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return response_error(
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {}", error),
            )
        }
    };

    if request.context.is_null() {
        return response_error(StatusCode::BAD_REQUEST, "request body has no context");
    }

    match state.role() {
        NodeRole::Central => save_locally(&state, &id, &request).await,
        _ => forward_save(&state, &id, &request).await,
    }
}

async fn save_locally(state: &ServerState, id: &str, request: &SaveContextRequest) -> Response {
    let metadata = match state
        .store
        .save(id, &request.context, request.metadata.as_ref())
        .await
    {
        Ok(metadata) => metadata,
        Err(error) => {
            if matches!(error, CascataError::Io(_)) {
                tracing::error!("save failed: context={} error={}", id, error);
            }
            return error_to_response(error);
        }
    };

    if let Some(propagator) = &state.propagator {
        propagator.spawn(PropagatedChange::Update {
            context_id: id.to_string(),
            payload: request.context.clone(),
            metadata: metadata.clone(),
        });
    }

    (
        StatusCode::OK,
        Json(SaveContextResponse {
            success: true,
            context_id: id.to_string(),
            metadata,
        }),
    )
        .into_response()
}

/// Writes on non-central nodes are routed to the upstream; the response
/// carries central's authoritative metadata, which is mirrored locally
/// before answering the client.
async fn forward_save(state: &ServerState, id: &str, request: &SaveContextRequest) -> Response {
    let upstream = match upstream_client(state) {
        Ok(upstream) => upstream,
        Err(response) => return response,
    };

    let response = match upstream
        .forward_save(id, &request.context, request.metadata.as_ref())
        .await
    {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!("forwarded save failed: context={} error={}", id, error);
            return error_to_response(error);
        }
    };

    if let Err(error) = state
        .store
        .apply_save(id, &request.context, &response.metadata)
        .await
    {
        // The authoritative write succeeded; the local mirror will converge
        // through the sync loop.
        tracing::warn!("local apply after forward failed: context={} error={}", id, error);
    }

    (StatusCode::OK, Json(response)).into_response()
}

pub(crate) async fn delete_context(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    match state.role() {
        NodeRole::Central => delete_locally(&state, &id).await,
        _ => forward_delete(&state, &id).await,
    }
}

async fn delete_locally(state: &ServerState, id: &str) -> Response {
    if let Err(error) = state.store.delete(id).await {
        if matches!(error, CascataError::Io(_)) {
            tracing::error!("delete failed: context={} error={}", id, error);
        }
        return error_to_response(error);
    }

    if let Some(propagator) = &state.propagator {
        propagator.spawn(PropagatedChange::Delete {
            context_id: id.to_string(),
        });
    }

    (
        StatusCode::OK,
        Json(cascata_core::DeleteContextResponse { success: true }),
    )
        .into_response()
}

async fn forward_delete(state: &ServerState, id: &str) -> Response {
    let upstream = match upstream_client(state) {
        Ok(upstream) => upstream,
        Err(response) => return response,
    };

    if let Err(error) = upstream.forward_delete(id).await {
        if !matches!(error, CascataError::NotFound(_)) {
            tracing::warn!("forwarded delete failed: context={} error={}", id, error);
        }
        return error_to_response(error);
    }

    if let Err(error) = state.store.apply_delete(id).await {
        tracing::warn!(
            "local apply after forwarded delete failed: context={} error={}",
            id,
            error
        );
    }

    (
        StatusCode::OK,
        Json(cascata_core::DeleteContextResponse { success: true }),
    )
        .into_response()
}

fn upstream_client(state: &ServerState) -> std::result::Result<UpstreamClient, Response> {
    let url = state
        .upstream_handle
        .get()
        .or_else(|| state.config.central_authority.clone());

    match url {
        Some(url) => Ok(UpstreamClient::with_client(state.http_client.clone(), url)),
        None => Err(response_error(
            StatusCode::BAD_GATEWAY,
            "no upstream available for write forwarding",
        )),
    }
}
