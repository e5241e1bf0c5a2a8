//! Replica synchronization.
//!
//! Non-central nodes run one long-lived sync task: discover the upstream,
//! catch up by listing everything it has, then hold its event stream open
//! and mirror changes as they are announced. A stream error, an explicit
//! `resync`, or a quiet connection sends the loop back through catch-up;
//! repeated upstream failures back off exponentially, capped at ten times
//! the configured interval.

use crate::bus::{StreamEnvelope, StreamEventKind};
use crate::error::{CascataError, Result};
use crate::peers::{discover_upstream, NodeRole, PeerDirectory};
use crate::store::ContextStore;
use crate::upstream::UpstreamClient;
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

const BACKOFF_CAP_MULTIPLIER: u32 = 10;

/// Address of the currently discovered upstream, shared with the request
/// router so client writes can be forwarded to the same node the sync loop
/// follows.
#[derive(Clone, Default)]
pub struct UpstreamHandle {
    inner: Arc<RwLock<Option<String>>>,
}

impl UpstreamHandle {
    pub fn set(&self, url: String) {
        *self.inner.write() = Some(url);
    }

    pub fn get(&self) -> Option<String> {
        self.inner.read().clone()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub role: NodeRole,
    pub node_id: String,
    pub region_id: String,
    /// Statically configured upstream URL, used when discovery yields
    /// nothing.
    pub fallback_upstream: Option<String>,
    pub sync_interval: Duration,
}

enum StreamExit {
    Reconcile,
}

enum EnvelopeOutcome {
    Continue,
    Reconcile,
}

pub struct ReplicaSync {
    store: Arc<ContextStore>,
    directory: Arc<dyn PeerDirectory>,
    config: SyncConfig,
    handle: UpstreamHandle,
    client: reqwest::Client,
}

impl ReplicaSync {
    pub fn new(
        store: Arc<ContextStore>,
        directory: Arc<dyn PeerDirectory>,
        config: SyncConfig,
        handle: UpstreamHandle,
    ) -> Self {
        Self {
            store,
            directory,
            config,
            handle,
            client: reqwest::Client::new(),
        }
    }

    pub async fn run(self) {
        if self.config.role == NodeRole::Central {
            tracing::warn!("sync loop started on a central node; nothing to do");
            return;
        }

        let mut failures: u32 = 0;

        loop {
            match self.cycle().await {
                Ok(()) => {
                    failures = 0;
                }
                Err(error) => {
                    failures += 1;
                    let delay = backoff_delay(self.config.sync_interval, failures);
                    tracing::warn!(
                        "sync cycle failed: error={} consecutive_failures={} retry_in={:?}",
                        error,
                        failures,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One pass through the state machine: discover, then alternate
    /// catch-up and streaming until the connection fails.
    async fn cycle(&self) -> Result<()> {
        let upstream = self.discover().await?;

        loop {
            let applied = self.catchup(&upstream).await?;
            metrics::counter!("cascata_sync_cycles_total").increment(1);
            tracing::info!(
                "catch-up complete: upstream={} applied={}",
                upstream.base_url(),
                applied
            );

            match self.stream(&upstream).await? {
                StreamExit::Reconcile => continue,
            }
        }
    }

    async fn discover(&self) -> Result<UpstreamClient> {
        let discovered =
            match discover_upstream(self.directory.as_ref(), self.config.role, &self.config.region_id)
                .await
            {
                Ok(found) => found,
                Err(error) => {
                    tracing::warn!("peer discovery failed: error={}", error);
                    None
                }
            };

        let url = discovered
            .or_else(|| self.config.fallback_upstream.clone())
            .ok_or_else(|| {
                CascataError::Upstream("no upstream discovered and no fallback configured".to_string())
            })?;

        self.handle.set(url.clone());
        tracing::info!("using upstream: url={}", url);

        Ok(UpstreamClient::with_client(self.client.clone(), url))
    }

    /// Pull everything the upstream has and apply whatever is strictly newer
    /// than the local copy.
    async fn catchup(&self, upstream: &UpstreamClient) -> Result<usize> {
        let entries = upstream
            .list_with_metadata()
            .await
            .map_err(|error| CascataError::Upstream(error.to_string()))?;

        let mut applied = 0usize;

        for entry in entries {
            let local_version = match self.store.get_metadata(&entry.id).await {
                Ok(metadata) => Some(metadata.version),
                Err(CascataError::NotFound(_)) => None,
                Err(error) => return Err(error),
            };

            let newer = local_version
                .map(|version| entry.metadata.version > version)
                .unwrap_or(true);
            if !newer {
                continue;
            }

            let payload = match upstream.fetch_context(&entry.id).await {
                Ok(payload) => payload,
                // Deleted upstream between the listing and the fetch.
                Err(CascataError::NotFound(_)) => continue,
                Err(error) => return Err(CascataError::Upstream(error.to_string())),
            };

            if self.store.apply_save(&entry.id, &payload, &entry.metadata).await? {
                applied += 1;
                metrics::counter!("cascata_sync_applied_total").increment(1);
            }
        }

        Ok(applied)
    }

    async fn stream(&self, upstream: &UpstreamClient) -> Result<StreamExit> {
        let response = upstream
            .open_stream(self.config.role.as_str(), &self.config.node_id)
            .await
            .map_err(|error| CascataError::Upstream(error.to_string()))?;

        let mut body = response.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = match tokio::time::timeout(self.config.sync_interval, body.next()).await {
                // Quiet past the ping cadence means the connection is dead.
                Err(_) => {
                    tracing::info!(
                        "stream idle for {:?}; reconciling",
                        self.config.sync_interval
                    );
                    return Ok(StreamExit::Reconcile);
                }
                Ok(None) => {
                    return Err(CascataError::Upstream(format!(
                        "stream closed by upstream {}",
                        upstream.base_url()
                    )))
                }
                Ok(Some(Err(error))) => {
                    return Err(CascataError::Upstream(format!("stream error: {}", error)))
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(index) = buffer.find('\n') {
                let line: String = buffer.drain(..=index).collect();

                let envelope = match StreamEnvelope::parse_line(&line) {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => continue,
                    Err(error) => {
                        tracing::warn!("undecodable stream line: error={}", error);
                        continue;
                    }
                };

                match self.handle_envelope(upstream, envelope).await? {
                    EnvelopeOutcome::Continue => {}
                    EnvelopeOutcome::Reconcile => return Ok(StreamExit::Reconcile),
                }
            }
        }
    }

    async fn handle_envelope(
        &self,
        upstream: &UpstreamClient,
        envelope: StreamEnvelope,
    ) -> Result<EnvelopeOutcome> {
        match envelope.event {
            StreamEventKind::Connected => {
                tracing::info!("subscribed to upstream stream: url={}", upstream.base_url());
            }
            StreamEventKind::Ping => {}
            StreamEventKind::Resync => {
                tracing::warn!("upstream requested resync; reconciling");
                return Ok(EnvelopeOutcome::Reconcile);
            }
            StreamEventKind::Update => {
                let (id, metadata) = match (envelope.context_id, envelope.metadata) {
                    (Some(id), Some(metadata)) => (id, metadata),
                    _ => {
                        tracing::warn!("update event missing contextId or metadata");
                        return Ok(EnvelopeOutcome::Continue);
                    }
                };

                let payload = match upstream.fetch_context(&id).await {
                    Ok(payload) => payload,
                    Err(CascataError::NotFound(_)) => return Ok(EnvelopeOutcome::Continue),
                    Err(error) => return Err(CascataError::Upstream(error.to_string())),
                };

                if self.store.apply_save(&id, &payload, &metadata).await? {
                    metrics::counter!("cascata_sync_applied_total").increment(1);
                    tracing::debug!("applied update: context={} version={}", id, metadata.version);
                }
            }
            StreamEventKind::Delete => {
                let id = match envelope.context_id {
                    Some(id) => id,
                    None => {
                        tracing::warn!("delete event missing contextId");
                        return Ok(EnvelopeOutcome::Continue);
                    }
                };

                if self.store.apply_delete(&id).await? {
                    tracing::debug!("applied delete: context={}", id);
                }
            }
        }

        Ok(EnvelopeOutcome::Continue)
    }
}

fn backoff_delay(base: Duration, consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(8);
    let multiplier = 2u32.saturating_pow(exponent).min(BACKOFF_CAP_MULTIPLIER);
    base * multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::context::{ContextEntry, ContextMetadata};
    use crate::peers::StaticPeerDirectory;
    use crate::store::StoreOptions;
    use axum::extract::Path;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 2), base * 2);
        assert_eq!(backoff_delay(base, 3), base * 4);
        assert_eq!(backoff_delay(base, 4), base * 8);
        assert_eq!(backoff_delay(base, 5), base * 10);
        assert_eq!(backoff_delay(base, 20), base * 10);
    }

    fn meta(version: u64, size: u64) -> ContextMetadata {
        ContextMetadata {
            version,
            last_modified: chrono::Utc::now(),
            size,
            extra: serde_json::Map::new(),
        }
    }

    /// Minimal upstream: a fixed set of contexts behind the two read routes
    /// catch-up uses.
    async fn spawn_mock_upstream(contexts: HashMap<String, (Value, ContextMetadata)>) -> String {
        let listing: Vec<ContextEntry> = contexts
            .iter()
            .map(|(id, (_, metadata))| ContextEntry {
                id: id.clone(),
                metadata: metadata.clone(),
            })
            .collect();

        let by_id = Arc::new(contexts);

        let app = Router::new()
            .route(
                "/contexts",
                get(move || {
                    let listing = listing.clone();
                    async move { Json(listing) }
                }),
            )
            .route(
                "/contexts/:id",
                get(move |Path(id): Path<String>| {
                    let by_id = by_id.clone();
                    async move {
                        match by_id.get(&id) {
                            Some((payload, _)) => Ok(Json(payload.clone())),
                            None => Err(axum::http::StatusCode::NOT_FOUND),
                        }
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{}", addr)
    }

    fn replica(store: Arc<ContextStore>, upstream: String) -> ReplicaSync {
        ReplicaSync::new(
            store,
            Arc::new(StaticPeerDirectory::default()),
            SyncConfig {
                role: NodeRole::Regional,
                node_id: "r1".to_string(),
                region_id: "eu".to_string(),
                fallback_upstream: Some(upstream),
                sync_interval: Duration::from_millis(200),
            },
            UpstreamHandle::default(),
        )
    }

    #[tokio::test]
    async fn test_catchup_applies_newer_versions_only() {
        let payload = json!({"x": 1});
        let size = serde_json::to_vec(&payload).unwrap().len() as u64;

        let mut contexts = HashMap::new();
        contexts.insert("fresh".to_string(), (payload.clone(), meta(3, size)));
        contexts.insert("stale".to_string(), (payload.clone(), meta(1, size)));
        let upstream_url = spawn_mock_upstream(contexts).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ContextStore::open(dir.path(), EventBus::default(), StoreOptions::default()).unwrap(),
        );

        // Local already holds "stale" at a higher version than upstream.
        store
            .apply_save("stale", &json!({"x": 9}), &meta(2, size))
            .await
            .unwrap();

        let sync = replica(store.clone(), upstream_url);
        let upstream = sync.discover().await.unwrap();

        let applied = sync.catchup(&upstream).await.unwrap();
        assert_eq!(applied, 1);

        assert_eq!(store.get("fresh").await.unwrap(), payload);
        assert_eq!(store.get_metadata("fresh").await.unwrap().version, 3);

        // The subordinate copy of "stale" is left alone.
        assert_eq!(store.get("stale").await.unwrap(), json!({"x": 9}));

        // A second pass finds nothing new.
        assert_eq!(sync.catchup(&upstream).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_update_envelope_fetches_and_applies() {
        let payload = json!({"y": 7});
        let size = serde_json::to_vec(&payload).unwrap().len() as u64;

        let mut contexts = HashMap::new();
        contexts.insert("c1".to_string(), (payload.clone(), meta(2, size)));
        let upstream_url = spawn_mock_upstream(contexts).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ContextStore::open(dir.path(), EventBus::default(), StoreOptions::default()).unwrap(),
        );

        let sync = replica(store.clone(), upstream_url);
        let upstream = sync.discover().await.unwrap();

        let envelope = StreamEnvelope {
            event: StreamEventKind::Update,
            context_id: Some("c1".to_string()),
            metadata: Some(meta(2, size)),
            timestamp: chrono::Utc::now(),
        };
        assert!(matches!(
            sync.handle_envelope(&upstream, envelope).await.unwrap(),
            EnvelopeOutcome::Continue
        ));

        assert_eq!(store.get("c1").await.unwrap(), payload);
        assert_eq!(store.get_metadata("c1").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_delete_envelope_removes_locally() {
        let upstream_url = spawn_mock_upstream(HashMap::new()).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ContextStore::open(dir.path(), EventBus::default(), StoreOptions::default()).unwrap(),
        );
        store
            .apply_save("c1", &json!(1), &meta(1, 1))
            .await
            .unwrap();

        let sync = replica(store.clone(), upstream_url);
        let upstream = sync.discover().await.unwrap();

        let envelope = StreamEnvelope {
            event: StreamEventKind::Delete,
            context_id: Some("c1".to_string()),
            metadata: None,
            timestamp: chrono::Utc::now(),
        };
        sync.handle_envelope(&upstream, envelope).await.unwrap();

        assert!(matches!(
            store.get("c1").await,
            Err(CascataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resync_envelope_triggers_reconcile() {
        let upstream_url = spawn_mock_upstream(HashMap::new()).await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ContextStore::open(dir.path(), EventBus::default(), StoreOptions::default()).unwrap(),
        );

        let sync = replica(store, upstream_url);
        let upstream = sync.discover().await.unwrap();

        let outcome = sync
            .handle_envelope(&upstream, StreamEnvelope::resync())
            .await
            .unwrap();
        assert!(matches!(outcome, EnvelopeOutcome::Reconcile));
    }
}
