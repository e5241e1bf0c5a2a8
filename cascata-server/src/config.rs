use cascata_core::{CascataError, NodeRole, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration, read from the environment. Every field has a
/// default so a bare `cascata serve` starts a central node on port 3000.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_server_type")]
    pub server_type: NodeRole,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_region_id")]
    pub region_id: String,

    /// Fallback upstream URL when peer discovery yields nothing.
    #[serde(default)]
    pub central_authority: Option<String>,

    /// Replica reconcile interval in milliseconds.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// Payload cache entry lifetime in milliseconds; 0 disables expiry.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,

    /// Local API address of the overlay daemon, when peer discovery runs
    /// over the overlay.
    #[serde(default)]
    pub overlay_socket: Option<String>,
}

fn default_server_type() -> NodeRole {
    NodeRole::Central
}

fn default_port() -> u16 {
    3000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_region_id() -> String {
    "global".to_string()
}

fn default_sync_interval() -> u64 {
    60_000
}

fn default_cache_ttl() -> u64 {
    300_000
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::Environment::default().try_parsing(true))
            .build()
            .map_err(|error| CascataError::Config(error.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|error| CascataError::Config(error.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(CascataError::Config("node_id cannot be empty".to_string()));
        }

        if self.server_type != NodeRole::Central
            && self.central_authority.is_none()
            && self.overlay_socket.is_none()
        {
            return Err(CascataError::Config(format!(
                "{} node has neither an overlay socket nor a central authority URL; \
                 it would never find an upstream",
                self.server_type
            )));
        }

        Ok(())
    }

    pub fn sync_interval_duration(&self) -> Duration {
        Duration::from_millis(self.sync_interval.max(1))
    }

    pub fn cache_ttl_duration(&self) -> Option<Duration> {
        (self.cache_ttl > 0).then(|| Duration::from_millis(self.cache_ttl))
    }

    pub fn bind_addr(&self) -> (&'static str, u16) {
        ("0.0.0.0", self.port)
    }
}
