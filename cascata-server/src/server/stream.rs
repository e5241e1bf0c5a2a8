//! Event-stream endpoints.
//!
//! Every subscriber gets its own worker task holding a bus cursor; the
//! worker forwards events as `data: <JSON>` chunks, pings on a fixed cadence
//! so idle middleboxes keep the connection open, and tears itself down when
//! the client goes away or the cursor overflows.

use super::{response_error, ServerState, StreamQuery};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use cascata_core::{
    validate_context_id, BusMessage, ContextEvent, EventSubscriber, StreamEnvelope,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_BUFFER: usize = 32;

pub(crate) async fn all_contexts_stream(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<StreamQuery>,
) -> Response {
    tracing::info!(
        "stream subscriber connected: server_type={} node_id={}",
        query.server_type.as_deref().unwrap_or("-"),
        query.node_id.as_deref().unwrap_or("-")
    );

    serve_stream(&state, None)
}

pub(crate) async fn context_stream(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Response {
    if let Err(error) = validate_context_id(&id) {
        return response_error(StatusCode::BAD_REQUEST, error.to_string());
    }

    serve_stream(&state, Some(id))
}

fn serve_stream(state: &ServerState, filter: Option<String>) -> Response {
    let subscriber = state.bus.subscribe();
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(OUTBOUND_BUFFER);

    tokio::spawn(stream_worker(subscriber, tx, filter));

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

    response
}

async fn stream_worker(
    subscriber: EventSubscriber,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    filter: Option<String>,
) {
    metrics::gauge!("cascata_stream_subscribers").increment(1.0);
    forward_events(subscriber, tx, filter).await;
    metrics::gauge!("cascata_stream_subscribers").decrement(1.0);
}

async fn forward_events(
    mut subscriber: EventSubscriber,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    filter: Option<String>,
) {
    if !send_envelope(&tx, &StreamEnvelope::connected()).await {
        return;
    }

    let mut ping = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately; the connected frame covers it.
    ping.tick().await;

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if !send_envelope(&tx, &StreamEnvelope::ping()).await {
                    return;
                }
            }
            message = subscriber.recv() => {
                match message {
                    None => return,
                    Some(BusMessage::Overflowed { skipped }) => {
                        tracing::warn!(
                            "stream subscriber overflowed: skipped={}; asking client to resync",
                            skipped
                        );
                        metrics::counter!("cascata_stream_overflows_total").increment(1);
                        let _ = send_envelope(&tx, &StreamEnvelope::resync()).await;
                        return;
                    }
                    Some(BusMessage::Event(event)) => {
                        if let Some(wanted) = &filter {
                            if event.context_id() != wanted {
                                continue;
                            }
                        }

                        let closing =
                            filter.is_some() && matches!(event, ContextEvent::Deleted { .. });

                        if !send_envelope(&tx, &StreamEnvelope::from_event(&event)).await {
                            return;
                        }

                        // A per-context stream ends with the context.
                        if closing {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn send_envelope(
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    envelope: &StreamEnvelope,
) -> bool {
    let frame = match envelope.to_frame() {
        Ok(frame) => frame,
        Err(error) => {
            tracing::error!("failed to encode stream envelope: {}", error);
            return true;
        }
    };

    tx.send(Ok(Bytes::from(frame))).await.is_ok()
}
