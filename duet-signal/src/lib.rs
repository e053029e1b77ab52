//! # duet-signal: Signaling hub for paired endpoints
//!
//! Endpoints (a headset and its desk console, say) connect over WebSocket,
//! claim a stable identity, get paired into two-member rooms and exchange
//! WebRTC negotiation, control commands, chat, telemetry and transcripts
//! through the hub. Several hub processes can share one logical registry
//! through a backplane.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐    Backplane    ┌──────────────┐
//! │ SignalClient │ ◄────────────────► │ SignalServer │ ◄─────────────► │ other hubs   │
//! │ (Session)    │    JSON events     │     Hub      │  bincode frames │              │
//! └──────────────┘                    └──────┬───────┘                 └──────────────┘
//!                                            │
//!                 ┌──────────────┬───────────┼─────────────┬──────────────┐
//!                 ▼              ▼           ▼             ▼              ▼
//!          IdentityArbiter  PairingManager  SignalRouter  MetricsStore  NotePipeline
//!                 │              │           │
//!                 └──────────────┴───────────┴──► ClusterDirectory ──► ConnectionRegistry
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Wire events and shared value types
//! - [`registry`]: Process-local identity → connection map
//! - [`backplane`]: Cross-process fan-out (in-memory cluster, WebSocket mesh)
//! - [`directory`]: Cluster-wide view over registry + backplane
//! - [`arbiter`]: Single-winner identity claims
//! - [`pairing`]: Allow-listed two-member rooms
//! - [`router`]: Signal / control / chat delivery
//! - [`metrics`]: Windowed telemetry and quality history
//! - [`chat`]: Bounded chat history replayed on join
//! - [`notes`]: Transcript → clinical note consumer
//! - [`session`]: Client connection state machine
//! - [`client`]: WebSocket client driver
//! - [`hub`]: Per-process coordinator
//! - [`server`]: WebSocket server
//! - [`config`]: File + environment configuration

pub mod arbiter;
pub mod backplane;
pub mod chat;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod metrics;
pub mod notes;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use backplane::{
    Backplane, BackplaneError, BackplaneMessage, MemoryBackplane, MemoryCluster, MeshBackplane,
    MeshConfig, NullBackplane,
};
pub use client::{ClientNotification, SignalClient};
pub use config::{ConfigError, HubConfig};
pub use error::HubError;
pub use hub::{Flow, Hub};
pub use notes::{MedicationLookup, NotePipeline, NoteTransformer};
pub use pairing::PairingTable;
pub use protocol::{
    ClientEvent, Envelope, EnvelopeKind, Identity, MetricKind, ProtocolError, RoomId, Sample,
    ServerEvent,
};
pub use router::RouteStats;
pub use server::{ServerStats, SignalServer};
pub use session::{ConnectionState, Session, SessionConfig};
