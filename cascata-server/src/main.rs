use cascata_core::{
    ContextStore, EventBus, NodeRole, OverlayPeerDirectory, PeerDirectory, Propagator, ReplicaSync,
    StaticPeerDirectory, StoreOptions, SyncConfig, UpstreamHandle, DEFAULT_CACHE_CAPACITY,
};
use cascata_server::config::Config;
use cascata_server::server::{run_server, ServerState};
use cascata_server::telemetry;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "cascata")]
#[command(about = "Tiered replicating context store for agent workloads")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node. Configuration comes from the environment; flags override.
    Serve {
        /// Node role: central, regional, or cache
        #[arg(long)]
        server_type: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long)]
        node_id: Option<String>,

        #[arg(long)]
        region_id: Option<String>,

        /// Fallback upstream URL for replicas
        #[arg(long)]
        central_authority: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    telemetry::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            server_type,
            port,
            data_dir,
            node_id,
            region_id,
            central_authority,
        } => {
            let mut config = match Config::from_env() {
                Ok(config) => config,
                Err(error) => {
                    tracing::error!("invalid configuration: {}", error);
                    std::process::exit(1);
                }
            };

            if let Some(raw) = server_type {
                config.server_type = match raw.parse::<NodeRole>() {
                    Ok(role) => role,
                    Err(error) => {
                        tracing::error!("{}", error);
                        std::process::exit(2);
                    }
                };
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            if let Some(region_id) = region_id {
                config.region_id = region_id;
            }
            if let Some(central_authority) = central_authority {
                config.central_authority = Some(central_authority);
            }

            if let Err(error) = config.validate() {
                tracing::error!("invalid configuration: {}", error);
                std::process::exit(1);
            }

            run_node(config).await;
        }
    }
}

async fn run_node(config: Config) {
    tracing::info!(
        "starting cascata node: role={} node_id={} region={} port={}",
        config.server_type,
        config.node_id,
        config.region_id,
        config.port
    );

    let bus = EventBus::default();

    let store = match ContextStore::open(
        &config.data_dir,
        bus.clone(),
        StoreOptions {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: config.cache_ttl_duration(),
        },
    ) {
        Ok(store) => Arc::new(store),
        Err(error) => {
            tracing::error!(
                "failed to open data directory {:?}: {}",
                config.data_dir,
                error
            );
            std::process::exit(1);
        }
    };

    let directory: Arc<dyn PeerDirectory> = match &config.overlay_socket {
        Some(socket) => {
            tracing::info!("peer discovery via overlay: socket={}", socket);
            Arc::new(OverlayPeerDirectory::new(socket))
        }
        None => Arc::new(StaticPeerDirectory::default()),
    };

    let propagator = match config.server_type {
        NodeRole::Central => Some(Arc::new(Propagator::new(directory.clone()))),
        _ => None,
    };

    let upstream_handle = UpstreamHandle::default();

    if config.server_type != NodeRole::Central {
        let sync = ReplicaSync::new(
            store.clone(),
            directory.clone(),
            SyncConfig {
                role: config.server_type,
                node_id: config.node_id.clone(),
                region_id: config.region_id.clone(),
                fallback_upstream: config.central_authority.clone(),
                sync_interval: config.sync_interval_duration(),
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
        config: config.clone(),
    });

    let listener = match TcpListener::bind(config.bind_addr()).await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!("failed to bind port {}: {}", config.port, error);
            std::process::exit(1);
        }
    };

    tracing::info!("listening on 0.0.0.0:{}", config.port);

    if let Err(error) = run_server(state, listener).await {
        tracing::error!("server error: {}", error);
        std::process::exit(1);
    }

    tracing::info!("shutdown complete");
}
