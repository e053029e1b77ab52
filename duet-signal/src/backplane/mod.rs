//! Cross-process backplane.
//!
//! Hub processes share state only through this interface:
//!
//! ```text
//!  Node A                               Node B
//! ┌──────────────┐   publish()     ┌──────────────┐
//! │ Registry     │ ──────────────► │ inbound loop │ ─► local connections
//! │ (LocalView)  │ ◄────────────── │              │
//! └──────────────┘  fetch_remote() └──────────────┘
//!       ▲          (bounded fan-out,        │
//!       └────────── answered by LocalView) ─┘
//! ```
//!
//! `publish` is fire-and-forget. `fetch_remote` is the only call that waits
//! on other processes; callers must wrap it in a timeout and be ready to fall
//! back to their local view (see [`ClusterDirectory`](crate::directory::ClusterDirectory)).

pub mod memory;
pub mod mesh;

use std::sync::Weak;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::protocol::{ConnId, HolderInfo, Identity, MetricKind, NodeId, RoomId};

pub use memory::{MemoryBackplane, MemoryCluster};
pub use mesh::{MeshBackplane, MeshConfig, MeshFrame};

/// Buffered inbound messages per node before slow consumers start lagging.
pub const INBOX_CAPACITY: usize = 1024;

/// Whether a registry row is a claim in progress or an accepted endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    Pending,
    Live,
}

/// A registry row as exchanged between processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub identity: Identity,
    pub display_name: String,
    pub connected_at: u64,
    pub node: NodeId,
    pub conn_id: ConnId,
    pub room: Option<RoomId>,
    pub state: ClaimState,
}

impl EndpointRecord {
    /// Total order over competing claims: earlier connection wins, ties are
    /// broken by node then connection id.
    pub fn claim_key(&self) -> (u64, NodeId, ConnId) {
        (self.connected_at, self.node, self.conn_id)
    }

    pub fn is_live(&self) -> bool {
        self.state == ClaimState::Live
    }

    pub fn holder_info(&self) -> HolderInfo {
        HolderInfo {
            identity: self.identity.clone(),
            display_name: self.display_name.clone(),
            node: self.node,
            connected_at: self.connected_at,
        }
    }
}

/// Messages fanned out to every other process.
///
/// Payloads that are JSON on the client wire (events, samples) travel
/// pre-encoded as strings so that every frame stays bincode-friendly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackplaneMessage {
    /// Some process's registry changed; recompute presence.
    PresenceChanged,
    /// Identity-addressed delivery of an encoded [`ServerEvent`](crate::protocol::ServerEvent).
    Deliver { to: Identity, frame: String },
    /// `identity` (owned by the receiver) was joined into `room_id`.
    RoomAssigned {
        identity: Identity,
        room_id: RoomId,
        members: Vec<Identity>,
    },
    /// `departed` left `room_id`; notify `identity`, then clear its room.
    RoomReleased {
        identity: Identity,
        room_id: RoomId,
        departed: Identity,
    },
    /// Replicated metrics sample; `value` is JSON text.
    Sample {
        identity: Identity,
        kind: MetricKind,
        ts: u64,
        value: String,
    },
    /// Replicated latest battery reading; `value` is JSON text.
    Battery { identity: Identity, value: String },
}

/// A message together with the process that published it.
#[derive(Debug, Clone, PartialEq)]
pub struct BackplaneEnvelope {
    pub origin: NodeId,
    pub message: BackplaneMessage,
}

/// Backplane failures. Never user-visible.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackplaneError {
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backplane closed")]
    Closed,
}

/// The local registry as seen by remote fan-out queries.
pub trait LocalView: Send + Sync {
    fn records(&self) -> BoxFuture<'_, Vec<EndpointRecord>>;
}

/// Publish/subscribe plus bounded query fan-out across hub processes.
pub trait Backplane: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Install the view answering other processes' fan-out queries.
    fn attach(&self, view: Weak<dyn LocalView>);

    /// Fire-and-forget fan-out to every other process.
    fn publish(&self, message: BackplaneMessage);

    /// Messages published by other processes.
    fn subscribe(&self) -> broadcast::Receiver<BackplaneEnvelope>;

    /// Registry rows of every other reachable process. May block on network
    /// I/O; callers bound it with a timeout.
    fn fetch_remote(&self) -> BoxFuture<'_, Result<Vec<EndpointRecord>, BackplaneError>>;

    /// Whether other processes can exist at all.
    fn is_clustered(&self) -> bool {
        true
    }
}

/// Single-process deployment: nothing to fan out to.
pub struct NullBackplane {
    node_id: NodeId,
    inbox: broadcast::Sender<BackplaneEnvelope>,
}

impl NullBackplane {
    pub fn new(node_id: NodeId) -> Self {
        let (inbox, _) = broadcast::channel(1);
        Self { node_id, inbox }
    }
}

impl Backplane for NullBackplane {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn attach(&self, _view: Weak<dyn LocalView>) {}

    fn publish(&self, _message: BackplaneMessage) {}

    fn subscribe(&self) -> broadcast::Receiver<BackplaneEnvelope> {
        self.inbox.subscribe()
    }

    fn fetch_remote(&self) -> BoxFuture<'_, Result<Vec<EndpointRecord>, BackplaneError>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn is_clustered(&self) -> bool {
        false
    }
}
