//! The signaling hub: one per process.
//!
//! Transport-agnostic. A connection task calls [`Hub::connect`] with its
//! outbound channel, feeds every decoded [`ClientEvent`] to [`Hub::handle`],
//! and calls [`Hub::disconnect`] when the socket goes away.
//!
//! ```text
//!  ClientEvent ──► Hub::handle ─┬─ join      ──► IdentityArbiter ──► PairingManager::auto_pair
//!                               ├─ pair_with ──► PairingManager
//!                               ├─ signal / control / message ──► SignalRouter
//!                               ├─ telemetry / battery / quality ──► MetricsStore
//!                               └─ transcript ──► NotePipeline (spawned)
//!
//!  background: presence loop (coalesced device_list + room_update)
//!              backplane inbound loop (deliveries, room changes, replicated metrics)
//!              metrics sweep
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::json;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::arbiter::IdentityArbiter;
use crate::backplane::{Backplane, BackplaneEnvelope, BackplaneMessage};
use crate::chat::ChatHistory;
use crate::config::HubConfig;
use crate::directory::{ClaimView, ClusterDirectory};
use crate::error::HubError;
use crate::metrics::MetricsStore;
use crate::notes::NotePipeline;
use crate::pairing::{PairingManager, PairingTable};
use crate::protocol::{
    now_ms, ClientEvent, ClinicalNote, ConnId, DeviceEntry, Envelope, EnvelopeKind, Identity,
    MetricKind, NodeId, Sample, ServerEvent,
};
use crate::registry::{ConnectionRegistry, Endpoint, EventSender};
use crate::router::{RouteStats, SignalRouter};

/// What the connection task should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

struct Connection {
    identity: Option<Identity>,
    tx: EventSender,
}

pub struct Hub {
    config: HubConfig,
    backplane: Arc<dyn Backplane>,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<ClusterDirectory>,
    arbiter: IdentityArbiter,
    pairing: Arc<PairingManager>,
    router: SignalRouter,
    metrics: Arc<MetricsStore>,
    chat: ChatHistory,
    notes: Arc<NotePipeline>,
    connections: RwLock<HashMap<ConnId, Connection>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build the hub with no note service and start its background tasks.
    pub fn start(config: HubConfig, backplane: Arc<dyn Backplane>) -> Arc<Self> {
        let notes = NotePipeline::unavailable(config.note_timeout());
        Self::start_with_notes(config, backplane, notes)
    }

    pub fn start_with_notes(
        config: HubConfig,
        backplane: Arc<dyn Backplane>,
        notes: NotePipeline,
    ) -> Arc<Self> {
        let registry = ConnectionRegistry::new(backplane.clone());
        let directory = Arc::new(ClusterDirectory::new(
            registry.clone(),
            backplane.clone(),
            config.arbiter_timeout(),
        ));
        let arbiter = IdentityArbiter::new(directory.clone(), config.arbiter_timeout());
        let pairing = Arc::new(PairingManager::new(
            directory.clone(),
            PairingTable::clone(&config.pairs),
        ));
        let metrics = Arc::new(MetricsStore::new(
            config.metrics_window(),
            registry.presence(),
            backplane.clone(),
        ));
        let router = SignalRouter::new(directory.clone(), pairing.clone(), metrics.clone());

        let hub = Arc::new(Self {
            chat: ChatHistory::new(config.chat_history_len),
            notes: Arc::new(notes),
            config,
            backplane,
            registry,
            directory,
            arbiter,
            pairing,
            router,
            metrics,
            connections: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(Self::presence_loop(Arc::downgrade(&hub))),
            tokio::spawn(Self::backplane_loop(
                Arc::downgrade(&hub),
                hub.backplane.subscribe(),
            )),
            tokio::spawn(Self::sweep_loop(Arc::downgrade(&hub))),
        ];
        *hub.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        log::info!("Hub node {} started", hub.node_id());
        hub
    }

    pub fn node_id(&self) -> NodeId {
        self.backplane.node_id()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn pairing(&self) -> &Arc<PairingManager> {
        &self.pairing
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    pub fn route_stats(&self) -> RouteStats {
        self.router.stats()
    }

    /// Register a new transport connection.
    pub async fn connect(&self, tx: EventSender) -> ConnId {
        let conn_id = ConnId::new_v4();
        self.connections
            .write()
            .await
            .insert(conn_id, Connection { identity: None, tx });
        conn_id
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn connection(&self, conn_id: ConnId) -> Option<(Option<Identity>, EventSender)> {
        let connections = self.connections.read().await;
        connections
            .get(&conn_id)
            .map(|c| (c.identity.clone(), c.tx.clone()))
    }

    /// Handle one decoded client event.
    pub async fn handle(&self, conn_id: ConnId, event: ClientEvent) -> Flow {
        let Some((identity, tx)) = self.connection(conn_id).await else {
            return Flow::Close;
        };

        let (me, event) = match (identity, event) {
            (None, ClientEvent::Join { identity, display_name }) => {
                return self.join(conn_id, tx, identity, display_name).await;
            }
            (Some(current), ClientEvent::Join { identity, .. }) => {
                log::debug!("Connection {conn_id} already joined as '{current}', ignoring join as '{identity}'");
                return Flow::Continue;
            }
            (_, ClientEvent::RequestDeviceList) => {
                let devices = self.device_list(&self.directory.snapshot().await).await;
                let _ = tx.send(ServerEvent::DeviceList(devices));
                return Flow::Continue;
            }
            (None, other) => {
                log::debug!("Dropping {other:?} from {conn_id} before join");
                return Flow::Continue;
            }
            (Some(me), event) => (me, event),
        };

        match event {
            ClientEvent::Join { .. } | ClientEvent::RequestDeviceList => {}

            ClientEvent::PairWith { peer_id } => {
                if let Err(e) = self.pairing.pair_with(&me, &peer_id).await {
                    log::info!("Pair request '{me}' → '{peer_id}' rejected: {e}");
                    let _ = tx.send(ServerEvent::PairError {
                        peer_id,
                        reason: e.to_string(),
                    });
                }
            }

            ClientEvent::Signal { kind, to, payload } => {
                self.route(&me, Envelope::new(kind, me.clone(), to, payload)).await;
            }

            ClientEvent::Control { command, to, args } => {
                let payload = json!({ "command": command, "args": args });
                self.route(&me, Envelope::new(EnvelopeKind::Control, me.clone(), to, payload))
                    .await;
            }

            ClientEvent::Message { to, text } => {
                let payload = json!({ "text": text, "ts": now_ms() });
                let envelope = Envelope::new(EnvelopeKind::Chat, me.clone(), to.clone(), payload);
                let recipients = match to {
                    Some(to) => vec![to],
                    None => self
                        .pairing
                        .room_peers(&me)
                        .await
                        .map(|(_, peers)| peers)
                        .unwrap_or_default(),
                };
                self.chat.record(&envelope, &recipients).await;
                self.route(&me, envelope).await;
            }

            ClientEvent::Telemetry(value) => {
                let sample = Sample::from_payload(value, now_ms());
                self.metrics.ingest(&me, MetricKind::Telemetry, sample).await;
            }

            ClientEvent::Battery(value) => {
                self.metrics.ingest_battery(&me, value).await;
            }

            ClientEvent::WebrtcQuality(value) => {
                self.route(&me, Envelope::new(EnvelopeKind::Quality, me.clone(), None, value))
                    .await;
            }

            ClientEvent::MetricsSubscribe { identity } => {
                self.metrics.subscribe(&identity, conn_id, tx).await;
            }

            ClientEvent::MetricsUnsubscribe { identity } => {
                self.metrics.unsubscribe(&identity, conn_id).await;
            }

            ClientEvent::Transcript { text, is_final } => {
                self.transcript(&me, text, is_final).await;
            }
        }
        Flow::Continue
    }

    async fn join(
        &self,
        conn_id: ConnId,
        tx: EventSender,
        identity: Identity,
        display_name: String,
    ) -> Flow {
        let endpoint = Endpoint::new(identity.clone(), display_name, self.node_id());
        match self.arbiter.claim(endpoint, conn_id, tx.clone()).await {
            Ok(view) => {
                if let Some(conn) = self.connections.write().await.get_mut(&conn_id) {
                    conn.identity = Some(identity.clone());
                }
                log::info!(
                    "'{identity}' joined via {conn_id}{}",
                    if view.is_degraded() { " (local view only)" } else { "" }
                );
                let history = self.chat.recent(&identity).await;
                let _ = tx.send(ServerEvent::MessageHistory(history));
                self.pairing.auto_pair(&identity).await;
                Flow::Continue
            }
            Err(HubError::DuplicateIdentity { identity, holder }) => {
                let _ = tx.send(ServerEvent::DuplicateId { identity, holder });
                let _ = tx.send(ServerEvent::DeviceList(Vec::new()));
                self.registry.presence().bump();
                Flow::Close
            }
            Err(HubError::IdentityConflictLocal(identity)) => {
                log::info!("'{identity}' is already registered here; closing {conn_id}");
                let _ = tx.send(ServerEvent::IdentityConflict { identity });
                Flow::Close
            }
            Err(e) => {
                log::warn!("Join of '{identity}' on {conn_id} failed: {e}");
                Flow::Close
            }
        }
    }

    async fn route(&self, me: &Identity, envelope: Envelope) {
        if let Err(e) = self.router.route(me, envelope).await {
            log::debug!("Dropped envelope: {e}");
        }
    }

    async fn transcript(&self, me: &Identity, text: String, is_final: bool) {
        let peers = self
            .pairing
            .room_peers(me)
            .await
            .map(|(_, peers)| peers)
            .unwrap_or_default();

        let relay = ServerEvent::Transcript {
            from: me.clone(),
            text: text.clone(),
            is_final,
        };
        for peer in &peers {
            self.directory.deliver(peer, relay.clone()).await;
        }
        if !is_final {
            return;
        }

        let notes = self.notes.clone();
        let directory = self.directory.clone();
        let me = me.clone();
        tokio::spawn(async move {
            let result = notes.process(&text).await;
            let note = ServerEvent::ClinicalNote(ClinicalNote {
                from: me.clone(),
                result,
            });
            for target in std::iter::once(&me).chain(peers.iter()) {
                directory.deliver(target, note.clone()).await;
            }
        });
    }

    /// Tear down a connection: leave the room (peer told first), release the
    /// identity, drop metrics subscriptions.
    pub async fn disconnect(&self, conn_id: ConnId) {
        let Some(conn) = self.connections.write().await.remove(&conn_id) else {
            return;
        };
        if let Some(identity) = conn.identity {
            self.pairing.leave(&identity).await;
            self.registry.unregister(&identity, conn_id).await;
            log::info!("'{identity}' disconnected ({conn_id})");
        }
        self.metrics.unsubscribe_all(conn_id).await;
    }

    /// Live endpoints in `view` with their latest readings, sorted by identity.
    pub async fn device_list(&self, view: &ClaimView) -> Vec<DeviceEntry> {
        let mut latest = self.metrics.latest_all().await;
        let mut devices: Vec<DeviceEntry> = view
            .live()
            .map(|record| {
                let readings = latest.remove(&record.identity).unwrap_or_default();
                DeviceEntry {
                    identity: record.identity.clone(),
                    display_name: record.display_name.clone(),
                    room: record.room.clone(),
                    battery: readings.battery,
                    telemetry: readings.telemetry,
                }
            })
            .collect();
        devices.sort_by(|a, b| a.identity.cmp(&b.identity));
        devices
    }

    /// Push the current device list and occupied pairs to every local endpoint.
    pub async fn broadcast_presence(&self) {
        let view = self.directory.snapshot().await;
        let devices = self.device_list(&view).await;
        let pairs = view.occupied_pairs();
        let reached = self.registry.broadcast(&ServerEvent::DeviceList(devices)).await;
        self.registry.broadcast(&ServerEvent::RoomUpdate { pairs }).await;
        log::trace!("Presence pushed to {reached} endpoints");
    }

    async fn apply_backplane(&self, envelope: BackplaneEnvelope) {
        match envelope.message {
            BackplaneMessage::PresenceChanged => self.registry.presence().bump(),

            BackplaneMessage::Deliver { to, frame } => match ServerEvent::decode(&frame) {
                Ok(event) => {
                    self.registry.send(&to, event).await;
                }
                Err(e) => log::warn!("Bad delivery from node {}: {e}", envelope.origin),
            },

            BackplaneMessage::RoomAssigned {
                identity,
                room_id,
                members,
            } => self.pairing.apply_assigned(&identity, room_id, members).await,

            BackplaneMessage::RoomReleased {
                identity,
                room_id,
                departed,
            } => self.pairing.apply_released(&identity, room_id, departed).await,

            BackplaneMessage::Sample {
                identity,
                kind,
                ts,
                value,
            } => match serde_json::from_str(&value) {
                Ok(value) => {
                    self.metrics
                        .apply_remote(&identity, kind, Sample::new(ts, value))
                        .await
                }
                Err(e) => log::warn!("Bad replicated sample for '{identity}': {e}"),
            },

            BackplaneMessage::Battery { identity, value } => match serde_json::from_str(&value) {
                Ok(value) => self.metrics.apply_battery(&identity, value).await,
                Err(e) => log::warn!("Bad replicated battery for '{identity}': {e}"),
            },
        }
    }

    async fn presence_loop(hub: Weak<Self>) {
        let (mut changes, coalesce) = match hub.upgrade() {
            Some(hub) => (hub.registry.presence().subscribe(), hub.config.presence_coalesce()),
            None => return,
        };
        while changes.changed().await.is_ok() {
            tokio::time::sleep(coalesce).await;
            changes.borrow_and_update();
            let Some(hub) = hub.upgrade() else { break };
            hub.broadcast_presence().await;
        }
    }

    async fn backplane_loop(hub: Weak<Self>, mut inbox: broadcast::Receiver<BackplaneEnvelope>) {
        loop {
            let envelope = match inbox.recv().await {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Backplane inbox lagged by {n} messages");
                    if let Some(hub) = hub.upgrade() {
                        hub.registry.presence().bump();
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(hub) = hub.upgrade() else { break };
            hub.apply_backplane(envelope).await;
        }
    }

    async fn sweep_loop(hub: Weak<Self>) {
        let period = match hub.upgrade() {
            Some(hub) => hub.config.metrics_sweep(),
            None => return,
        };
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(hub) = hub.upgrade() else { break };
            let evicted = hub.metrics.sweep(now_ms()).await;
            if evicted > 0 {
                log::debug!("Metrics sweep evicted {evicted} samples");
            }
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::NullBackplane;
    use crate::notes::{DraftNote, MedicationLookup, NoteError, NoteTransformer};
    use crate::protocol::{NoteResult, NoteSections};
    use futures_util::future::BoxFuture;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn config() -> HubConfig {
        HubConfig {
            presence_coalesce_ms: 10,
            pairs: PairingTable::new([(Identity::from("glass"), Identity::from("desk"))]),
            ..HubConfig::default()
        }
    }

    fn hub() -> Arc<Hub> {
        Hub::start(config(), Arc::new(NullBackplane::new(Uuid::new_v4())))
    }

    async fn join(hub: &Hub, identity: &str) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = hub.connect(tx).await;
        let flow = hub
            .handle(
                conn,
                ClientEvent::Join {
                    identity: Identity::from(identity),
                    display_name: String::new(),
                },
            )
            .await;
        assert_eq!(flow, Flow::Continue);
        (conn, rx)
    }

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
        pred: impl Fn(&ServerEvent) -> bool,
    ) -> ServerEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.expect("channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_join_replays_history_then_pairs() {
        let hub = hub();
        let (_, mut rx_g) = join(&hub, "glass").await;
        next_matching(&mut rx_g, |e| matches!(e, ServerEvent::MessageHistory(_))).await;

        let (_, mut rx_d) = join(&hub, "desk").await;
        next_matching(&mut rx_d, |e| matches!(e, ServerEvent::MessageHistory(_))).await;
        next_matching(&mut rx_d, |e| matches!(e, ServerEvent::RoomJoined { .. })).await;
        next_matching(&mut rx_g, |e| matches!(e, ServerEvent::RoomJoined { .. })).await;

        let update = next_matching(&mut rx_g, |e| {
            matches!(e, ServerEvent::RoomUpdate { pairs } if !pairs.is_empty())
        })
        .await;
        assert_eq!(
            update,
            ServerEvent::RoomUpdate {
                pairs: vec![crate::protocol::PairEntry {
                    a: Identity::from("desk"),
                    b: Identity::from("glass"),
                }]
            }
        );
    }

    #[tokio::test]
    async fn test_local_reclaim_gets_identity_conflict() {
        let hub = hub();
        let _first = join(&hub, "glass").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.connect(tx).await;
        let flow = hub
            .handle(
                conn,
                ClientEvent::Join {
                    identity: Identity::from("glass"),
                    display_name: String::new(),
                },
            )
            .await;
        assert_eq!(flow, Flow::Close);
        assert_eq!(
            rx.recv().await,
            Some(ServerEvent::IdentityConflict {
                identity: Identity::from("glass")
            })
        );
    }

    #[tokio::test]
    async fn test_disconnect_sends_peer_left_before_empty_room_update() {
        let hub = hub();
        let (conn_g, _rx_g) = join(&hub, "glass").await;
        let (_, mut rx_d) = join(&hub, "desk").await;
        next_matching(&mut rx_d, |e| {
            matches!(e, ServerEvent::RoomUpdate { pairs } if !pairs.is_empty())
        })
        .await;

        hub.disconnect(conn_g).await;
        let first = next_matching(&mut rx_d, |e| {
            matches!(e, ServerEvent::PeerLeft { .. } | ServerEvent::RoomUpdate { .. })
        })
        .await;
        assert!(matches!(first, ServerEvent::PeerLeft { .. }), "got {first:?}");
        next_matching(&mut rx_d, |e| {
            matches!(e, ServerEvent::RoomUpdate { pairs } if pairs.is_empty())
        })
        .await;
        assert!(hub.registry().room_of(&Identity::from("desk")).await.is_none());
    }

    #[tokio::test]
    async fn test_pair_with_disallowed_peer_reports_error() {
        let hub = hub();
        let (conn, mut rx) = join(&hub, "glass").await;
        hub.handle(
            conn,
            ClientEvent::PairWith {
                peer_id: Identity::from("intruder"),
            },
        )
        .await;
        let err = next_matching(&mut rx, |e| matches!(e, ServerEvent::PairError { .. })).await;
        assert!(matches!(err, ServerEvent::PairError { peer_id, .. } if peer_id == Identity::from("intruder")));
    }

    #[tokio::test]
    async fn test_events_before_join_are_ignored() {
        let hub = hub();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = hub.connect(tx).await;
        let flow = hub
            .handle(
                conn,
                ClientEvent::Message {
                    to: None,
                    text: "hi".into(),
                },
            )
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(rx.try_recv().is_err());

        hub.handle(conn, ClientEvent::RequestDeviceList).await;
        assert_eq!(rx.recv().await, Some(ServerEvent::DeviceList(Vec::new())));
    }

    #[tokio::test]
    async fn test_battery_shows_in_device_list() {
        let hub = hub();
        let (conn, mut rx) = join(&hub, "glass").await;
        hub.handle(conn, ClientEvent::Battery(json!({ "level": 0.42 }))).await;
        next_matching(&mut rx, |e| match e {
            ServerEvent::DeviceList(devices) => devices
                .iter()
                .any(|d| d.battery == Some(json!({ "level": 0.42 }))),
            _ => false,
        })
        .await;
    }

    #[tokio::test]
    async fn test_chat_history_replayed_on_rejoin() {
        let hub = hub();
        let (conn_g, _rx_g) = join(&hub, "glass").await;
        let (conn_d, _rx_d) = join(&hub, "desk").await;
        hub.handle(
            conn_g,
            ClientEvent::Message {
                to: None,
                text: "are you there".into(),
            },
        )
        .await;

        hub.disconnect(conn_d).await;
        let (_, mut rx_d) = join(&hub, "desk").await;
        match next_matching(&mut rx_d, |e| matches!(e, ServerEvent::MessageHistory(_))).await {
            ServerEvent::MessageHistory(history) => {
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].from, Identity::from("glass"));
                assert_eq!(history[0].payload["text"], "are you there");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct FixedNote;

    impl NoteTransformer for FixedNote {
        fn transform<'a>(&'a self, _t: &'a str) -> BoxFuture<'a, Result<DraftNote, NoteError>> {
            Box::pin(async {
                Ok(DraftNote {
                    sections: NoteSections {
                        plan: "rest".into(),
                        ..NoteSections::default()
                    },
                    medications: vec!["ibuprofen".into()],
                })
            })
        }
    }

    struct Everything;

    impl MedicationLookup for Everything {
        fn exists<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, bool> {
            Box::pin(async { true })
        }
    }

    #[tokio::test]
    async fn test_final_transcript_yields_note_for_both_members() {
        let notes = NotePipeline::new(
            Arc::new(FixedNote),
            Arc::new(Everything),
            Duration::from_secs(1),
        );
        let hub = Hub::start_with_notes(
            config(),
            Arc::new(NullBackplane::new(Uuid::new_v4())),
            notes,
        );
        let (conn_g, mut rx_g) = join(&hub, "glass").await;
        let (_, mut rx_d) = join(&hub, "desk").await;

        hub.handle(
            conn_g,
            ClientEvent::Transcript {
                text: "patient reports a headache".into(),
                is_final: false,
            },
        )
        .await;
        let partial = next_matching(&mut rx_d, |e| matches!(e, ServerEvent::Transcript { .. })).await;
        assert!(matches!(partial, ServerEvent::Transcript { is_final: false, .. }));

        hub.handle(
            conn_g,
            ClientEvent::Transcript {
                text: "take ibuprofen and rest".into(),
                is_final: true,
            },
        )
        .await;
        for rx in [&mut rx_g, &mut rx_d] {
            match next_matching(rx, |e| matches!(e, ServerEvent::ClinicalNote(_))).await {
                ServerEvent::ClinicalNote(note) => match note.result {
                    NoteResult::Ready { medications, .. } => assert!(medications[0].known),
                    other => panic!("unexpected {other:?}"),
                },
                _ => unreachable!(),
            }
        }
    }
}
