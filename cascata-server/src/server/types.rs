use cascata_core::PeerInfo;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub server_type: String,
    pub node_id: String,
    pub region_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: String,
    pub server_type: String,
    pub node_id: String,
    pub region_id: String,
    pub contexts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default, rename = "includeMetadata")]
    pub include_metadata: bool,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default, rename = "serverType")]
    pub server_type: Option<String>,
    #[serde(default, rename = "nodeId")]
    pub node_id: Option<String>,
}
