//! Peer discovery.
//!
//! Nodes find each other through the private overlay network; the core only
//! consumes a directory of `{name, address, tags, online}` records. The
//! production implementation queries the overlay daemon's local API, tests
//! and single-node deployments use a static list.

use crate::error::{CascataError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const TAG_CENTRAL: &str = "central";
pub const TAG_REGIONAL: &str = "regional";
pub const TAG_CACHE: &str = "cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Central,
    Regional,
    Cache,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Central => TAG_CENTRAL,
            NodeRole::Regional => TAG_REGIONAL,
            NodeRole::Cache => TAG_CACHE,
        }
    }

    /// Tag of the tier this role subscribes to. Central has no upstream.
    pub fn upstream_tag(&self) -> Option<&'static str> {
        match self {
            NodeRole::Central => None,
            NodeRole::Regional => Some(TAG_CENTRAL),
            NodeRole::Cache => Some(TAG_REGIONAL),
        }
    }
}

impl FromStr for NodeRole {
    type Err = CascataError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            TAG_CENTRAL => Ok(NodeRole::Central),
            TAG_REGIONAL => Ok(NodeRole::Regional),
            TAG_CACHE => Ok(NodeRole::Cache),
            other => Err(CascataError::Config(format!(
                "invalid server type '{}': expected central, regional, or cache",
                other
            ))),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    /// `host:port` of the peer's context API.
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub online: bool,
}

impl PeerInfo {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|candidate| candidate == tag)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.address)
    }
}

/// Directory of currently known peers.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn peers(&self) -> Result<Vec<PeerInfo>>;
}

/// Pick the upstream for `role`: a peer carrying the upstream tier's tag,
/// preferring one that also carries the node's region tag. Returns the peer's
/// base URL, or `None` when discovery yields nothing (callers fall back to
/// the configured upstream URL).
pub async fn discover_upstream(
    directory: &dyn PeerDirectory,
    role: NodeRole,
    region_id: &str,
) -> Result<Option<String>> {
    let tag = match role.upstream_tag() {
        Some(tag) => tag,
        None => return Ok(None),
    };

    let peers = directory.peers().await?;
    let mut candidates: Vec<&PeerInfo> = peers
        .iter()
        .filter(|peer| peer.online && peer.has_tag(tag))
        .collect();

    if role == NodeRole::Cache {
        if let Some(regional) = candidates.iter().find(|peer| peer.has_tag(region_id)) {
            return Ok(Some(regional.base_url()));
        }
    }

    candidates.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(candidates.first().map(|peer| peer.base_url()))
}

/// Fixed peer list, for configuration-driven wiring and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerDirectory {
    peers: Vec<PeerInfo>,
}

impl StaticPeerDirectory {
    pub fn new(peers: Vec<PeerInfo>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl PeerDirectory for StaticPeerDirectory {
    async fn peers(&self) -> Result<Vec<PeerInfo>> {
        Ok(self.peers.clone())
    }
}

/// Directory backed by the overlay daemon's local HTTP API.
pub struct OverlayPeerDirectory {
    client: reqwest::Client,
    endpoint: String,
}

impl OverlayPeerDirectory {
    pub fn new(socket_addr: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("http://{}/v0/peers", socket_addr),
        }
    }
}

#[async_trait]
impl PeerDirectory for OverlayPeerDirectory {
    async fn peers(&self) -> Result<Vec<PeerInfo>> {
        let response = self
            .client
            .get(&self.endpoint)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await
            .map_err(|error| CascataError::Http(format!("overlay query failed: {}", error)))?;

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "overlay returned status {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|error| CascataError::Http(format!("invalid overlay peer list: {}", error)))
    }
}
