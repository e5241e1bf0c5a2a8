//! HTTP client for another cascata node.
//!
//! Used by replicas to catch up with and stream from their upstream, by
//! replicas to forward client writes toward central, and by central to push
//! propagated changes into regionals.

use crate::context::{ContextEntry, ContextMetadata};
use crate::error::{CascataError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Per-peer budget for propagation pushes; fan-out is best-effort.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
pub struct SaveContextRequest {
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveContextResponse {
    pub success: bool,
    pub context_id: String,
    pub metadata: ContextMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteContextResponse {
    pub success: bool,
}

/// Body of an internal apply push: payload plus the authoritative metadata,
/// version included.
#[derive(Debug, Serialize, Deserialize)]
pub struct InternalApplyRequest {
    pub context: Value,
    pub metadata: ContextMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InternalApplyResponse {
    pub applied: bool,
}

#[derive(Clone)]
pub struct UpstreamClient {
    base_url: String,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn list_with_metadata(&self) -> Result<Vec<ContextEntry>> {
        let url = format!("{}/contexts?includeMetadata=true", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "listing failed: status={} upstream={}",
                response.status(),
                self.base_url
            )));
        }

        response
            .json()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))
    }

    pub async fn fetch_context(&self, id: &str) -> Result<Value> {
        let url = format!("{}/contexts/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CascataError::NotFound(id.to_string()));
        }

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "context fetch failed: status={} context={}",
                response.status(),
                id
            )));
        }

        response
            .json()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))
    }

    /// Open the upstream's all-contexts event stream. The response stays
    /// open indefinitely; no overall timeout is applied.
    pub async fn open_stream(&self, server_type: &str, node_id: &str) -> Result<reqwest::Response> {
        let url = format!(
            "{}/contexts/stream?serverType={}&nodeId={}",
            self.base_url, server_type, node_id
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "stream open failed: status={} upstream={}",
                response.status(),
                self.base_url
            )));
        }

        Ok(response)
    }

    /// Forward a client write toward central and return the authoritative
    /// metadata.
    pub async fn forward_save(
        &self,
        id: &str,
        payload: &Value,
        extra: Option<&Map<String, Value>>,
    ) -> Result<SaveContextResponse> {
        let url = format!("{}/contexts/{}", self.base_url, id);
        let body = SaveContextRequest {
            context: payload.clone(),
            metadata: extra.cloned(),
        };

        let response = self
            .client
            .put(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(CascataError::InvalidRequest(format!(
                "rejected by upstream: context={}",
                id
            )));
        }

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "forwarded save failed: status={} context={}",
                response.status(),
                id
            )));
        }

        response
            .json()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))
    }

    pub async fn forward_delete(&self, id: &str) -> Result<()> {
        let url = format!("{}/contexts/{}", self.base_url, id);
        let response = self
            .client
            .delete(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CascataError::NotFound(id.to_string()));
        }

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "forwarded delete failed: status={} context={}",
                response.status(),
                id
            )));
        }

        Ok(())
    }

    /// Push an authoritative update into a peer (apply-from-upstream).
    pub async fn push_update(
        &self,
        id: &str,
        payload: &Value,
        metadata: &ContextMetadata,
    ) -> Result<bool> {
        let url = format!("{}/internal/v1/contexts/{}", self.base_url, id);
        let body = InternalApplyRequest {
            context: payload.clone(),
            metadata: metadata.clone(),
        };

        let response = self
            .client
            .put(&url)
            .timeout(PUSH_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "push failed: status={} context={} peer={}",
                response.status(),
                id,
                self.base_url
            )));
        }

        let payload: InternalApplyResponse = response
            .json()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;
        Ok(payload.applied)
    }

    pub async fn push_delete(&self, id: &str) -> Result<bool> {
        let url = format!("{}/internal/v1/contexts/{}", self.base_url, id);
        let response = self
            .client
            .delete(&url)
            .timeout(PUSH_TIMEOUT)
            .send()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;

        if !response.status().is_success() {
            return Err(CascataError::Http(format!(
                "push delete failed: status={} context={} peer={}",
                response.status(),
                id,
                self.base_url
            )));
        }

        let payload: InternalApplyResponse = response
            .json()
            .await
            .map_err(|error| CascataError::Http(error.to_string()))?;
        Ok(payload.applied)
    }
}
