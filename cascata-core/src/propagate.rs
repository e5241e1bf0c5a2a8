//! Central fan-out.
//!
//! Connected replicas learn about changes through the event stream; direct
//! pushes cover regionals that have not opened a stream yet (fresh nodes,
//! nodes sitting in reconnect backoff). Fan-out is best-effort: per-peer
//! failures are logged and counted, and the originating request has already
//! succeeded by the time any push happens.

use crate::context::ContextMetadata;
use crate::peers::{PeerDirectory, PeerInfo, TAG_REGIONAL};
use crate::upstream::UpstreamClient;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum PropagatedChange {
    Update {
        context_id: String,
        payload: Value,
        metadata: ContextMetadata,
    },
    Delete {
        context_id: String,
    },
}

impl PropagatedChange {
    fn context_id(&self) -> &str {
        match self {
            PropagatedChange::Update { context_id, .. } => context_id,
            PropagatedChange::Delete { context_id } => context_id,
        }
    }
}

pub struct Propagator {
    directory: Arc<dyn PeerDirectory>,
    client: reqwest::Client,
}

impl Propagator {
    pub fn new(directory: Arc<dyn PeerDirectory>) -> Self {
        Self {
            directory,
            client: reqwest::Client::new(),
        }
    }

    /// Queue a change for delivery to every regional peer. Returns
    /// immediately; the fan-out runs in its own task.
    pub fn spawn(self: &Arc<Self>, change: PropagatedChange) {
        let propagator = Arc::clone(self);
        tokio::spawn(async move {
            propagator.fan_out(change).await;
        });
    }

    pub async fn fan_out(&self, change: PropagatedChange) {
        let peers = match self.directory.peers().await {
            Ok(peers) => peers,
            Err(error) => {
                tracing::warn!(
                    "peer discovery failed during fan-out: context={} error={}",
                    change.context_id(),
                    error
                );
                metrics::counter!("cascata_propagation_failures_total").increment(1);
                return;
            }
        };

        let regionals: Vec<PeerInfo> = peers
            .into_iter()
            .filter(|peer| peer.online && peer.has_tag(TAG_REGIONAL))
            .collect();

        if regionals.is_empty() {
            tracing::debug!(
                "no regional peers to propagate to: context={}",
                change.context_id()
            );
            return;
        }

        let pushes = regionals.iter().map(|peer| self.push_to_peer(peer, &change));
        let results = join_all(pushes).await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            tracing::warn!(
                "propagation partially failed: context={} peers={} failed={}",
                change.context_id(),
                regionals.len(),
                failed
            );
        } else {
            tracing::debug!(
                "propagated: context={} peers={}",
                change.context_id(),
                regionals.len()
            );
        }
    }

    async fn push_to_peer(&self, peer: &PeerInfo, change: &PropagatedChange) -> crate::Result<()> {
        let client = UpstreamClient::with_client(self.client.clone(), peer.base_url());

        let result = match change {
            PropagatedChange::Update {
                context_id,
                payload,
                metadata,
            } => client
                .push_update(context_id, payload, metadata)
                .await
                .map(|_| ()),
            PropagatedChange::Delete { context_id } => {
                client.push_delete(context_id).await.map(|_| ())
            }
        };

        if let Err(error) = &result {
            tracing::warn!(
                "push to regional failed: peer={} context={} error={}",
                peer.name,
                change.context_id(),
                error
            );
            metrics::counter!("cascata_propagation_failures_total").increment(1);
        }

        result
    }
}
