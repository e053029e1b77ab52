//! Connection registry: identity → live connection, for this process only.
//!
//! The registry is the single owner of the identity map. It exposes atomic
//! operations (register / activate / unregister / set_room) and never hands
//! out the map itself. Every mutation bumps the local [`PresenceSignal`] and
//! publishes [`BackplaneMessage::PresenceChanged`] so other processes refresh
//! their device lists too.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch, RwLock};

use crate::backplane::{Backplane, BackplaneMessage, ClaimState, EndpointRecord, LocalView};
use crate::error::HubError;
use crate::protocol::{now_ms, ConnId, Identity, NodeId, RoomId, ServerEvent};

/// Outbound event channel of one connection task.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

/// One connected endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub identity: Identity,
    pub display_name: String,
    /// Epoch milliseconds when the claim was made.
    pub connected_at: u64,
    /// Owning process.
    pub node: NodeId,
    pub room: Option<RoomId>,
}

impl Endpoint {
    pub fn new(identity: Identity, display_name: impl Into<String>, node: NodeId) -> Self {
        let display_name = display_name.into();
        let display_name = if display_name.is_empty() {
            identity.to_string()
        } else {
            display_name
        };
        Self {
            identity,
            display_name,
            connected_at: now_ms(),
            node,
            room: None,
        }
    }
}

struct Entry {
    endpoint: Endpoint,
    conn_id: ConnId,
    state: ClaimState,
    tx: EventSender,
}

impl Entry {
    fn record(&self) -> EndpointRecord {
        EndpointRecord {
            identity: self.endpoint.identity.clone(),
            display_name: self.endpoint.display_name.clone(),
            connected_at: self.endpoint.connected_at,
            node: self.endpoint.node,
            conn_id: self.conn_id,
            room: self.endpoint.room.clone(),
            state: self.state,
        }
    }
}

/// Coalescable "presence changed" notification.
///
/// A counter behind a watch channel: bursts of bumps collapse into one
/// wake-up of whoever is watching.
#[derive(Clone)]
pub struct PresenceSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl PresenceSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn bump(&self) {
        self.tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

impl Default for PresenceSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-local identity → connection map.
pub struct ConnectionRegistry {
    backplane: Arc<dyn Backplane>,
    entries: RwLock<HashMap<Identity, Entry>>,
    presence: PresenceSignal,
}

impl ConnectionRegistry {
    /// Create the registry and install it as the backplane's local view.
    pub fn new(backplane: Arc<dyn Backplane>) -> Arc<Self> {
        let registry = Arc::new(Self {
            backplane: backplane.clone(),
            entries: RwLock::new(HashMap::new()),
            presence: PresenceSignal::new(),
        });
        let view: Arc<dyn LocalView> = registry.clone();
        backplane.attach(Arc::downgrade(&view));
        registry
    }

    pub fn node_id(&self) -> NodeId {
        self.backplane.node_id()
    }

    pub fn presence(&self) -> PresenceSignal {
        self.presence.clone()
    }

    fn changed(&self) {
        self.presence.bump();
        self.backplane.publish(BackplaneMessage::PresenceChanged);
    }

    /// Record a pending claim. Fails if the identity is already present in
    /// this process, pending or live.
    pub async fn register(
        &self,
        endpoint: Endpoint,
        conn_id: ConnId,
        tx: EventSender,
    ) -> Result<(), HubError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&endpoint.identity) {
            return Err(HubError::IdentityConflictLocal(endpoint.identity));
        }
        log::debug!("Pending claim for '{}' ({conn_id})", endpoint.identity);
        entries.insert(
            endpoint.identity.clone(),
            Entry {
                endpoint,
                conn_id,
                state: ClaimState::Pending,
                tx,
            },
        );
        Ok(())
    }

    /// Promote a pending claim to live. Returns false if the claim is gone.
    pub async fn activate(&self, identity: &Identity, conn_id: ConnId) -> bool {
        let activated = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(identity) {
                Some(entry) if entry.conn_id == conn_id => {
                    entry.state = ClaimState::Live;
                    true
                }
                _ => false,
            }
        };
        if activated {
            log::info!("Endpoint '{identity}' is live on node {}", self.node_id());
            self.changed();
        }
        activated
    }

    /// Remove the entry owned by `conn_id`. Idempotent; a newer connection
    /// holding the same identity is left alone.
    pub async fn unregister(&self, identity: &Identity, conn_id: ConnId) -> Option<Endpoint> {
        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(identity) {
                Some(entry) if entry.conn_id == conn_id => {
                    entries.remove(identity).map(|entry| entry.endpoint)
                }
                _ => None,
            }
        };
        if removed.is_some() {
            log::debug!("Unregistered '{identity}' ({conn_id})");
            self.changed();
        }
        removed
    }

    /// Set or clear the room of a local live endpoint.
    pub async fn set_room(&self, identity: &Identity, room: Option<RoomId>) -> bool {
        let updated = {
            let mut entries = self.entries.write().await;
            match entries.get_mut(identity) {
                Some(entry) if entry.state == ClaimState::Live => {
                    entry.endpoint.room = room;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.changed();
        }
        updated
    }

    pub async fn room_of(&self, identity: &Identity) -> Option<RoomId> {
        let entries = self.entries.read().await;
        entries
            .get(identity)
            .filter(|entry| entry.state == ClaimState::Live)
            .and_then(|entry| entry.endpoint.room.clone())
    }

    pub async fn is_live(&self, identity: &Identity) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(identity)
            .is_some_and(|entry| entry.state == ClaimState::Live)
    }

    pub async fn is_local(&self, identity: &Identity) -> bool {
        self.entries.read().await.contains_key(identity)
    }

    /// Queue an event for a local live endpoint. False if it is not here.
    pub async fn send(&self, identity: &Identity, event: ServerEvent) -> bool {
        let entries = self.entries.read().await;
        match entries.get(identity) {
            Some(entry) if entry.state == ClaimState::Live => entry.tx.send(event).is_ok(),
            _ => false,
        }
    }

    /// Queue an event for every local live endpoint. Returns the count reached.
    pub async fn broadcast(&self, event: &ServerEvent) -> usize {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| entry.state == ClaimState::Live)
            .filter(|entry| entry.tx.send(event.clone()).is_ok())
            .count()
    }

    pub async fn live_endpoints(&self) -> Vec<Endpoint> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| entry.state == ClaimState::Live)
            .map(|entry| entry.endpoint.clone())
            .collect()
    }

    /// Every local row, pending claims included.
    pub async fn records(&self) -> Vec<EndpointRecord> {
        let entries = self.entries.read().await;
        entries.values().map(Entry::record).collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl LocalView for ConnectionRegistry {
    fn records(&self) -> BoxFuture<'_, Vec<EndpointRecord>> {
        Box::pin(ConnectionRegistry::records(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::{MemoryCluster, NullBackplane};
    use uuid::Uuid;

    fn registry() -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(Arc::new(NullBackplane::new(Uuid::new_v4())))
    }

    fn endpoint(reg: &ConnectionRegistry, identity: &str) -> Endpoint {
        Endpoint::new(Identity::from(identity), "", reg.node_id())
    }

    #[tokio::test]
    async fn test_register_conflicts_while_pending() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.register(endpoint(&reg, "glass"), Uuid::new_v4(), tx.clone())
            .await
            .unwrap();
        let err = reg
            .register(endpoint(&reg, "glass"), Uuid::new_v4(), tx)
            .await
            .unwrap_err();
        assert_eq!(err, HubError::IdentityConflictLocal(Identity::from("glass")));
    }

    #[tokio::test]
    async fn test_pending_is_not_live_until_activated() {
        let reg = registry();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        let id = Identity::from("glass");
        reg.register(endpoint(&reg, "glass"), conn, tx).await.unwrap();

        assert!(!reg.is_live(&id).await);
        assert!(!reg.send(&id, ServerEvent::DeviceList(vec![])).await);
        assert!(reg.live_endpoints().await.is_empty());
        assert_eq!(reg.records().await[0].state, ClaimState::Pending);

        assert!(reg.activate(&id, conn).await);
        assert!(reg.is_live(&id).await);
        assert!(reg.send(&id, ServerEvent::DeviceList(vec![])).await);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unregister_only_removes_owner() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let owner = Uuid::new_v4();
        let id = Identity::from("glass");
        reg.register(endpoint(&reg, "glass"), owner, tx).await.unwrap();

        assert!(reg.unregister(&id, Uuid::new_v4()).await.is_none());
        assert_eq!(reg.len().await, 1);
        assert!(reg.unregister(&id, owner).await.is_some());
        assert!(reg.unregister(&id, owner).await.is_none());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_mutations_bump_presence() {
        let reg = registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        let id = Identity::from("glass");
        let start = reg.presence().generation();

        reg.register(endpoint(&reg, "glass"), conn, tx).await.unwrap();
        reg.activate(&id, conn).await;
        let room = RoomId::for_pair(&id, &Identity::from("desk"));
        reg.set_room(&id, Some(room.clone())).await;
        assert_eq!(reg.room_of(&id).await, Some(room));
        reg.unregister(&id, conn).await;

        assert_eq!(reg.presence().generation(), start + 3);
    }

    #[tokio::test]
    async fn test_mutations_publish_presence_changed() {
        let cluster = MemoryCluster::new();
        let reg = ConnectionRegistry::new(cluster.join(Uuid::new_v4()));
        let other = cluster.join(Uuid::new_v4());
        let mut inbox = other.subscribe();

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        reg.register(endpoint(&reg, "glass"), conn, tx).await.unwrap();
        reg.activate(&Identity::from("glass"), conn).await;

        let got = inbox.recv().await.unwrap();
        assert_eq!(got.message, BackplaneMessage::PresenceChanged);
    }

    #[tokio::test]
    async fn test_registry_answers_remote_queries() {
        let cluster = MemoryCluster::new();
        let a = ConnectionRegistry::new(cluster.join(Uuid::new_v4()));
        let b_backplane = cluster.join(Uuid::new_v4());
        let _b = ConnectionRegistry::new(b_backplane.clone());

        let (tx, _rx) = mpsc::unbounded_channel();
        a.register(endpoint(&a, "glass"), Uuid::new_v4(), tx).await.unwrap();

        let seen = b_backplane.fetch_remote().await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].node, a.node_id());
    }

    #[test]
    fn test_display_name_defaults_to_identity() {
        let ep = Endpoint::new(Identity::from("desk-1"), "", Uuid::new_v4());
        assert_eq!(ep.display_name, "desk-1");
    }
}
