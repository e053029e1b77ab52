//! WebSocket front end of the hub.
//!
//! ```text
//! Endpoint A ──┐                 ┌── Hub ── registry / pairing / router / metrics
//!               ├── SignalServer ─┤
//! Endpoint B ──┘                 └── Backplane ── other hub processes
//! ```
//!
//! One task per socket. Text frames carry JSON `{"event","data"}` objects;
//! each decoded [`ClientEvent`] goes to the hub, and everything the hub
//! queues for the connection is written back as text frames.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::HubError;
use crate::hub::{Flow, Hub};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::router::RouteStats;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub route: RouteStats,
}

/// The signaling server.
pub struct SignalServer {
    hub: Arc<Hub>,
    bind_addr: String,
    stats: Arc<RwLock<ServerStats>>,
}

impl SignalServer {
    /// Serve `hub` on its configured bind address.
    pub fn new(hub: Arc<Hub>) -> Self {
        let bind_addr = hub.config().bind_addr.clone();
        Self {
            hub,
            bind_addr,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        log::info!(
            "Signal server (node {}) listening on {}",
            self.hub.node_id(),
            listener.local_addr()?
        );
        self.serve(listener).await
    }

    /// Accept loop over an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<Hub>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (tx, mut outbound) = mpsc::unbounded_channel::<ServerEvent>();
        let conn_id = hub.connect(tx).await;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let event = match ClientEvent::decode(text.as_str()) {
                                    Ok(event) => event,
                                    Err(e) => {
                                        let err = HubError::Malformed(e.to_string());
                                        log::warn!("Dropping frame from {addr}: {err}");
                                        stats.write().await.malformed_frames += 1;
                                        continue;
                                    }
                                };
                                if hub.handle(conn_id, event).await == Flow::Close {
                                    // Flush what the hub queued before the verdict.
                                    while let Ok(event) = outbound.try_recv() {
                                        ws_sender.send(Message::Text(event.encode()?.into())).await?;
                                    }
                                    ws_sender.send(Message::Close(None)).await?;
                                    log::info!("Closing connection from {addr}");
                                    break;
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                log::warn!("Ignoring binary frame from {addr}");
                                stats.write().await.malformed_frames += 1;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    event = outbound.recv() => {
                        match event {
                            Some(event) => {
                                log::trace!("→ {addr}: {}", event.name());
                                ws_sender.send(Message::Text(event.encode()?.into())).await?;
                            }
                            None => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        hub.disconnect(conn_id).await;
        stats.write().await.active_connections -= 1;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.route = self.hub.route_stats();
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }
}
