//! Hub error taxonomy.
//!
//! Identity and pairing errors are reported to the originating connection
//! only. Routing and arbiter errors never reach end users; they show up in
//! logs and [`ServerStats`](crate::server::ServerStats) counters.

use crate::protocol::{HolderInfo, Identity};

/// Errors raised by the hub's identity, pairing and routing services.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    /// Same identity already registered in this process. Recoverable: the
    /// client is expected to reconnect once the stale entry is gone.
    #[error("identity '{0}' is already registered on this node")]
    IdentityConflictLocal(Identity),

    /// Identity is held by a live connection elsewhere in the cluster.
    /// Terminal for the requester until it explicitly reconnects.
    #[error("identity '{identity}' is already held by node {}", holder.node)]
    DuplicateIdentity {
        identity: Identity,
        holder: HolderInfo,
    },

    #[error("pairing '{identity}' with '{peer}' is not allowed")]
    PairNotAllowed { identity: Identity, peer: Identity },

    #[error("peer '{0}' is not connected")]
    PeerUnavailable(Identity),

    #[error("room for '{identity}' and '{peer}' is occupied")]
    RoomFull { identity: Identity, peer: Identity },

    /// No destination for an envelope. Dropped silently.
    #[error("no route for envelope from '{0}'")]
    RoutingFailed(Identity),

    /// Cluster fan-out exceeded its deadline; callers degrade to the local view.
    #[error("cluster fan-out timed out after {0} ms")]
    ArbiterTimeout(u64),

    #[error("backplane error: {0}")]
    Backplane(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl HubError {
    /// Whether this error should be shown to the originating connection.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Self::IdentityConflictLocal(_)
                | Self::DuplicateIdentity { .. }
                | Self::PairNotAllowed { .. }
                | Self::PeerUnavailable(_)
                | Self::RoomFull { .. }
        )
    }
}
