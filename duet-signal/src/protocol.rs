//! JSON wire protocol between endpoints and the hub.
//!
//! Every WebSocket text frame carries exactly one event:
//! ```text
//! { "event": "<snake_case name>", "data": <payload> }
//! ```
//!
//! Client→server events are [`ClientEvent`], server→client events are
//! [`ServerEvent`]. Both are closed sum types, so dispatch on the event name
//! is exhaustive at compile time.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Process (hub node) identifier.
pub type NodeId = Uuid;

/// Per-connection identifier, unique across the cluster.
pub type ConnId = Uuid;

/// Wall-clock time in milliseconds since UNIX epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stable opaque name of one logical endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room identifier. A pure function of the two member identities, so every
/// process derives the same id for the same pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn for_pair(a: &Identity, b: &Identity) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("pair:{lo}:{hi}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who currently holds a contested identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderInfo {
    pub identity: Identity,
    pub display_name: String,
    pub node: NodeId,
    pub connected_at: u64,
}

/// One row of the presence snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub identity: Identity,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<Value>,
}

/// An occupied pair, as reported by `room_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairEntry {
    pub a: Identity,
    pub b: Identity,
}

/// Routed message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Offer,
    Answer,
    IceCandidate,
    Chat,
    Control,
    Telemetry,
    Quality,
}

/// One routed message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub from: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Identity>,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from: Identity, to: Option<Identity>, payload: Value) -> Self {
        Self {
            kind,
            from,
            to,
            payload,
        }
    }

    /// Wrap the envelope in the server event its kind is delivered as.
    pub fn into_event(self) -> ServerEvent {
        match self.kind {
            EnvelopeKind::Offer
            | EnvelopeKind::Answer
            | EnvelopeKind::IceCandidate
            | EnvelopeKind::Telemetry
            | EnvelopeKind::Quality => ServerEvent::Signal(self),
            EnvelopeKind::Control => ServerEvent::Control(self),
            EnvelopeKind::Chat => ServerEvent::Message(self),
        }
    }
}

/// Which metrics series a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Telemetry,
    Quality,
}

/// A timestamped metrics sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Epoch milliseconds.
    pub ts: u64,
    pub value: Value,
}

impl Sample {
    pub fn new(ts: u64, value: Value) -> Self {
        Self { ts, value }
    }

    /// Build a sample from a client payload, honouring a numeric `ts` field
    /// when present and falling back to `now`. A `ts` in the future is
    /// clamped to `now`.
    pub fn from_payload(value: Value, now: u64) -> Self {
        let ts = value
            .get("ts")
            .and_then(Value::as_u64)
            .map_or(now, |ts| ts.min(now));
        Self { ts, value }
    }
}

/// Fixed-shape note produced from a finalized transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteSections {
    pub subjective: String,
    pub objective: String,
    pub assessment: String,
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationCheck {
    pub name: String,
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NoteResult {
    Ready {
        sections: NoteSections,
        medications: Vec<MedicationCheck>,
    },
    Degraded {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalNote {
    pub from: Identity,
    pub result: NoteResult,
}

/// Events sent by endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Claim an identity and enter the registry.
    #[serde(alias = "identify")]
    Join {
        identity: Identity,
        #[serde(default)]
        display_name: String,
    },
    RequestDeviceList,
    PairWith {
        peer_id: Identity,
    },
    Signal {
        kind: EnvelopeKind,
        #[serde(default)]
        to: Option<Identity>,
        #[serde(default)]
        payload: Value,
    },
    Control {
        command: String,
        #[serde(default)]
        to: Option<Identity>,
        #[serde(default)]
        args: Value,
    },
    Message {
        #[serde(default)]
        to: Option<Identity>,
        text: String,
    },
    Telemetry(Value),
    Battery(Value),
    WebrtcQuality(Value),
    MetricsSubscribe {
        identity: Identity,
    },
    MetricsUnsubscribe {
        identity: Identity,
    },
    Transcript {
        text: String,
        #[serde(default)]
        is_final: bool,
    },
}

impl ClientEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Events sent by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    DeviceList(Vec<DeviceEntry>),
    /// Terminal identity rejection.
    DuplicateId {
        identity: Identity,
        holder: HolderInfo,
    },
    /// Recoverable same-node re-claim; the connection is closed afterwards.
    IdentityConflict {
        identity: Identity,
    },
    PairError {
        peer_id: Identity,
        reason: String,
    },
    RoomJoined {
        room_id: RoomId,
        members: Vec<Identity>,
    },
    PeerLeft {
        identity: Identity,
        room_id: RoomId,
    },
    RoomUpdate {
        pairs: Vec<PairEntry>,
    },
    Signal(Envelope),
    Control(Envelope),
    Message(Envelope),
    MessageHistory(Vec<Envelope>),
    MetricsSnapshot {
        identity: Identity,
        telemetry: Vec<Sample>,
        quality: Vec<Sample>,
    },
    MetricsUpdate {
        identity: Identity,
        kind: MetricKind,
        sample: Sample,
    },
    Transcript {
        from: Identity,
        text: String,
        is_final: bool,
    },
    ClinicalNote(ClinicalNote),
}

impl ServerEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceList(_) => "device_list",
            Self::DuplicateId { .. } => "duplicate_id",
            Self::IdentityConflict { .. } => "identity_conflict",
            Self::PairError { .. } => "pair_error",
            Self::RoomJoined { .. } => "room_joined",
            Self::PeerLeft { .. } => "peer_left",
            Self::RoomUpdate { .. } => "room_update",
            Self::Signal(_) => "signal",
            Self::Control(_) => "control",
            Self::Message(_) => "message",
            Self::MessageHistory(_) => "message_history",
            Self::MetricsSnapshot { .. } => "metrics_snapshot",
            Self::MetricsUpdate { .. } => "metrics_update",
            Self::Transcript { .. } => "transcript",
            Self::ClinicalNote(_) => "clinical_note",
        }
    }
}

/// Codec and transport errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
}
