//! Full-mesh WebSocket backplane between hub processes.
//!
//! Every process listens on `listen_addr` and dials each URL in `peers`.
//! A link is symmetric once the `Hello` exchange names the remote node, so
//! it does not matter which side dialed. Frames are bincode-encoded
//! [`MeshFrame`]s in binary WebSocket messages.
//!
//! ```text
//!  dial / accept ──► Hello{node} ──► links[node] = tx
//!                    Publish(msg) ──► inbox (broadcast)
//!                    Query{id}    ──► Reply{id, records}  (answered from LocalView)
//! ```
//!
//! Outbound links redial forever with capped exponential backoff.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{
    Backplane, BackplaneEnvelope, BackplaneError, BackplaneMessage, EndpointRecord, LocalView,
    INBOX_CAPACITY,
};
use crate::protocol::NodeId;
use crate::session::Backoff;

/// Mesh listener and peer list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Address the mesh listener binds to, e.g. `0.0.0.0:9191`.
    pub listen_addr: String,
    /// WebSocket URLs of the other processes, e.g. `ws://10.0.0.2:9191`.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Wire frame between mesh nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshFrame {
    Hello { node: NodeId },
    Publish(BackplaneMessage),
    Query { request_id: u64 },
    Reply {
        request_id: u64,
        records: Vec<EndpointRecord>,
    },
}

impl MeshFrame {
    pub fn encode(&self) -> Result<Vec<u8>, BackplaneError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BackplaneError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BackplaneError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BackplaneError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

struct PendingQuery {
    waiting: HashSet<NodeId>,
    records: Vec<EndpointRecord>,
    done: Option<oneshot::Sender<Vec<EndpointRecord>>>,
}

impl PendingQuery {
    fn settle_if_complete(&mut self) {
        if self.waiting.is_empty() {
            if let Some(done) = self.done.take() {
                let _ = done.send(std::mem::take(&mut self.records));
            }
        }
    }
}

/// Removes an abandoned query when the caller's timeout drops the future.
struct PendingGuard<'a> {
    mesh: &'a MeshBackplane,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.mesh
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}

/// WebSocket full-mesh [`Backplane`].
pub struct MeshBackplane {
    node_id: NodeId,
    local_addr: SocketAddr,
    view: RwLock<Option<Weak<dyn LocalView>>>,
    links: RwLock<HashMap<NodeId, mpsc::UnboundedSender<MeshFrame>>>,
    inbox: broadcast::Sender<BackplaneEnvelope>,
    pending: Mutex<HashMap<u64, PendingQuery>>,
    next_request: AtomicU64,
}

impl MeshBackplane {
    /// Bind the mesh listener and start dialing the configured peers.
    pub async fn start(node_id: NodeId, config: MeshConfig) -> Result<Arc<Self>, BackplaneError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| BackplaneError::Transport(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BackplaneError::Transport(e.to_string()))?;
        let (inbox, _) = broadcast::channel(INBOX_CAPACITY);

        let mesh = Arc::new(Self {
            node_id,
            local_addr,
            view: RwLock::new(None),
            links: RwLock::new(HashMap::new()),
            inbox,
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        });
        log::info!("Mesh backplane for node {node_id} listening on {local_addr}");

        tokio::spawn(mesh.clone().accept_loop(listener));
        for url in config.peers {
            tokio::spawn(mesh.clone().dial_loop(url));
        }
        Ok(mesh)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of remote nodes with an established link.
    pub fn link_count(&self) -> usize {
        self.links.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    log::debug!("Mesh connection from {addr}");
                    let mesh = self.clone();
                    tokio::spawn(async move {
                        match tokio_tungstenite::accept_async(stream).await {
                            Ok(ws) => mesh.run_link(ws).await,
                            Err(e) => log::warn!("Mesh handshake from {addr} failed: {e}"),
                        }
                    });
                }
                Err(e) => {
                    log::error!("Mesh accept failed: {e}");
                    return;
                }
            }
        }
    }

    async fn dial_loop(self: Arc<Self>, url: String) {
        let mut backoff = Backoff::default();
        loop {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("Mesh link to {url} established");
                    backoff.reset();
                    self.clone().run_link(ws).await;
                    log::warn!("Mesh link to {url} lost");
                }
                Err(e) => log::debug!("Mesh dial to {url} failed: {e}"),
            }
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    async fn run_link<S>(self: Arc<Self>, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<MeshFrame>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let bytes = match frame.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Dropping mesh frame: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
        });

        let _ = tx.send(MeshFrame::Hello { node: self.node_id });
        let mut peer: Option<NodeId> = None;

        while let Some(msg) = ws_reader.next().await {
            let bytes = match msg {
                Ok(Message::Binary(bytes)) => bytes,
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            let frame = match MeshFrame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("Malformed mesh frame: {e}");
                    continue;
                }
            };

            match frame {
                MeshFrame::Hello { node } => {
                    if node == self.node_id {
                        log::warn!("Mesh dialed itself; closing link");
                        break;
                    }
                    peer = Some(node);
                    self.links
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(node, tx.clone());
                    log::debug!("Mesh link up with node {node}");
                }
                MeshFrame::Publish(message) => {
                    if let Some(origin) = peer {
                        let _ = self.inbox.send(BackplaneEnvelope { origin, message });
                    }
                }
                MeshFrame::Query { request_id } => {
                    let records = self.local_records().await;
                    let _ = tx.send(MeshFrame::Reply {
                        request_id,
                        records,
                    });
                }
                MeshFrame::Reply {
                    request_id,
                    records,
                } => {
                    if let Some(node) = peer {
                        self.settle_reply(request_id, node, records);
                    }
                }
            }
        }

        if let Some(node) = peer {
            self.drop_link(node, &tx);
        }
        writer.abort();
    }

    async fn local_records(&self) -> Vec<EndpointRecord> {
        let view = self
            .view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade);
        match view {
            Some(view) => view.records().await,
            None => Vec::new(),
        }
    }

    fn settle_reply(&self, request_id: u64, node: NodeId, records: Vec<EndpointRecord>) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(query) = pending.get_mut(&request_id) {
            if query.waiting.remove(&node) {
                query.records.extend(records);
                query.settle_if_complete();
            }
        }
    }

    fn drop_link(&self, node: NodeId, tx: &mpsc::UnboundedSender<MeshFrame>) {
        let mut links = self.links.write().unwrap_or_else(PoisonError::into_inner);
        if links.get(&node).is_some_and(|current| current.same_channel(tx)) {
            links.remove(&node);
            log::debug!("Mesh link down with node {node}");
        }
        drop(links);

        // A vanished peer can no longer answer; stop waiting for it.
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for query in pending.values_mut() {
            if query.waiting.remove(&node) {
                query.settle_if_complete();
            }
        }
    }
}

impl Backplane for MeshBackplane {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn attach(&self, view: Weak<dyn LocalView>) {
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = Some(view);
    }

    fn publish(&self, message: BackplaneMessage) {
        let links = self.links.read().unwrap_or_else(PoisonError::into_inner);
        for tx in links.values() {
            let _ = tx.send(MeshFrame::Publish(message.clone()));
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackplaneEnvelope> {
        self.inbox.subscribe()
    }

    fn fetch_remote(&self) -> BoxFuture<'_, Result<Vec<EndpointRecord>, BackplaneError>> {
        Box::pin(async move {
            let links: Vec<(NodeId, mpsc::UnboundedSender<MeshFrame>)> = self
                .links
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(node, tx)| (*node, tx.clone()))
                .collect();
            if links.is_empty() {
                return Ok(Vec::new());
            }

            let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
            let (done_tx, done_rx) = oneshot::channel();
            let _guard = PendingGuard {
                mesh: self,
                request_id,
            };
            {
                let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                let mut query = PendingQuery {
                    waiting: HashSet::new(),
                    records: Vec::new(),
                    done: Some(done_tx),
                };
                for (node, tx) in &links {
                    if tx.send(MeshFrame::Query { request_id }).is_ok() {
                        query.waiting.insert(*node);
                    }
                }
                query.settle_if_complete();
                pending.insert(request_id, query);
            }

            done_rx.await.map_err(|_| BackplaneError::Closed)
        })
    }
}
