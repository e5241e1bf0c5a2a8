#![allow(dead_code)]

use cascata_core::{
    ContextStore, EventBus, NodeRole, PeerDirectory, PeerInfo, Propagator, ReplicaSync,
    StaticPeerDirectory, StoreOptions, SyncConfig, UpstreamHandle,
};
use cascata_server::config::Config;
use cascata_server::server::{build_router, ServerState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

pub struct NodeOptions {
    pub role: NodeRole,
    pub central_authority: Option<String>,
    pub peers: Vec<PeerInfo>,
    pub sync_interval_ms: u64,
}

impl NodeOptions {
    pub fn central() -> Self {
        Self {
            role: NodeRole::Central,
            central_authority: None,
            peers: Vec::new(),
            sync_interval_ms: 60_000,
        }
    }

    pub fn regional(central_url: &str) -> Self {
        Self {
            role: NodeRole::Regional,
            central_authority: Some(central_url.to_string()),
            peers: Vec::new(),
            sync_interval_ms: 200,
        }
    }
}

pub struct TestNode {
    pub addr: SocketAddr,
    pub base_url: String,
    _data_dir: tempfile::TempDir,
}

pub async fn spawn_node(options: NodeOptions) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    spawn_node_on(listener, options).await
}

/// Spawn on a pre-bound listener, so a node's address can be handed to its
/// peers before the node itself is up.
pub async fn spawn_node_on(listener: TcpListener, options: NodeOptions) -> TestNode {
    let addr = listener.local_addr().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    let config = Config {
        server_type: options.role,
        port: addr.port(),
        data_dir: PathBuf::from(data_dir.path()),
        node_id: uuid::Uuid::new_v4().to_string(),
        region_id: "global".to_string(),
        central_authority: options.central_authority.clone(),
        sync_interval: options.sync_interval_ms,
        cache_ttl: 0,
        overlay_socket: None,
    };

    let bus = EventBus::default();
    let store = Arc::new(
        ContextStore::open(
            data_dir.path(),
            bus.clone(),
            StoreOptions {
                cache_capacity: 100,
                cache_ttl: None,
            },
        )
        .unwrap(),
    );

    let directory: Arc<dyn PeerDirectory> = Arc::new(StaticPeerDirectory::new(options.peers));

    let propagator = match options.role {
        NodeRole::Central => Some(Arc::new(Propagator::new(directory.clone()))),
        _ => None,
    };

    let upstream_handle = UpstreamHandle::default();

    if options.role != NodeRole::Central {
        let sync = ReplicaSync::new(
            store.clone(),
            directory.clone(),
            SyncConfig {
                role: options.role,
                node_id: config.node_id.clone(),
                region_id: config.region_id.clone(),
                fallback_upstream: options.central_authority,
                sync_interval: Duration::from_millis(options.sync_interval_ms),
            },
            upstream_handle.clone(),
        );
        tokio::spawn(sync.run());
    }

    let state = Arc::new(ServerState {
        store,
        bus,
        directory,
        propagator,
        upstream_handle,
        http_client: reqwest::Client::new(),
        config,
    });

    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestNode {
        addr,
        base_url: format!("http://{}", addr),
        _data_dir: data_dir,
    }
}

pub fn regional_peer(name: &str, addr: SocketAddr) -> PeerInfo {
    PeerInfo {
        name: name.to_string(),
        address: addr.to_string(),
        tags: vec!["regional".to_string()],
        online: true,
    }
}

/// Poll until `check` passes or the deadline expires.
pub async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if started.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
