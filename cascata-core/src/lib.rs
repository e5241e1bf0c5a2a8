//! Cascata Core - replication and consistency subsystem for the tiered
//! context store.

pub mod bus;
pub mod context;
pub mod error;
pub mod peers;
pub mod propagate;
pub mod store;
pub mod sync;
pub mod upstream;

pub use bus::{BusMessage, ContextEvent, EventBus, EventSubscriber, StreamEnvelope, StreamEventKind};
pub use context::{validate_context_id, ContextEntry, ContextMetadata};
pub use error::{CascataError, Result};
pub use peers::{
    discover_upstream, NodeRole, OverlayPeerDirectory, PeerDirectory, PeerInfo,
    StaticPeerDirectory, TAG_CACHE, TAG_CENTRAL, TAG_REGIONAL,
};
pub use propagate::{PropagatedChange, Propagator};
pub use store::{ContextStore, StoreOptions, DEFAULT_CACHE_CAPACITY};
pub use sync::{ReplicaSync, SyncConfig, UpstreamHandle};
pub use upstream::{
    DeleteContextResponse, InternalApplyRequest, InternalApplyResponse, SaveContextRequest,
    SaveContextResponse, UpstreamClient,
};
