//! WebSocket client for hub endpoints.
//!
//! Wraps a [`Session`] in a driver task that owns the socket:
//! - Connection lifecycle (connect, disconnect, automatic reconnect with backoff)
//! - Offline outbox replayed after the join on every reconnect
//! - Terminal rejection when the hub reports the identity held elsewhere
//!
//! The application talks to the driver through [`SignalClient`] and reads
//! [`ClientNotification`]s from the event receiver.

use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ClientEvent, EnvelopeKind, Identity, ProtocolError, ServerEvent};
use crate::session::{ConnectionState, Session, SessionAction, SessionConfig, SessionInput};

/// What the client reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    StateChanged(ConnectionState),
    Event(ServerEvent),
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Send(ClientEvent),
}

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum LinkEvent {
    Dialed(Box<HubStream>),
    Frame(ServerEvent),
    Closed,
    Error(String),
}

/// Dial `url` in the background. The outcome arrives on `events` tagged
/// with `generation`; a dial still pending after `limit` reports an error.
fn dial(
    url: String,
    generation: u64,
    limit: Duration,
    events: mpsc::UnboundedSender<(u64, LinkEvent)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let connecting = tokio_tungstenite::connect_async(url.as_str());
        let event = match tokio::time::timeout(limit, connecting).await {
            Ok(Ok((ws_stream, _))) => LinkEvent::Dialed(Box::new(ws_stream)),
            Ok(Err(e)) => LinkEvent::Error(e.to_string()),
            Err(_) => LinkEvent::Error(format!("connect to {url} timed out after {limit:?}")),
        };
        let _ = events.send((generation, event));
    })
}

/// One open socket.
struct Link {
    out: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

impl Link {
    fn start(
        ws_stream: HubStream,
        generation: u64,
        events: mpsc::UnboundedSender<(u64, LinkEvent)>,
    ) -> Self {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if events.send((generation, LinkEvent::Frame(event))).is_err() {
                                return;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from hub: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send((generation, LinkEvent::Error(e.to_string())));
                        return;
                    }
                }
            }
            let _ = events.send((generation, LinkEvent::Closed));
        });

        Self { out, reader }
    }

    fn transmit(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let text = event.encode()?;
        self.out
            .send(Message::Text(text.into()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn close(self) {
        let _ = self.out.send(Message::Close(None));
        self.reader.abort();
    }
}

/// Owns the session and its socket. Every dial bumps `generation`; link
/// events from an older generation are stragglers and get ignored.
struct Driver {
    url: String,
    session: Session,
    state_tx: watch::Sender<ConnectionState>,
    notify: mpsc::UnboundedSender<ClientNotification>,
    link: Option<Link>,
    dialing: Option<JoinHandle<()>>,
    connect_timeout: Duration,
    generation: u64,
    link_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    retry: Option<Pin<Box<Sleep>>>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    let actions = match cmd {
                        Some(Command::Connect) => self.session.handle(SessionInput::Connect),
                        Some(Command::Disconnect) => self.session.handle(SessionInput::Disconnect),
                        Some(Command::Send(event)) => self.session.send(event),
                        None => break,
                    };
                    self.apply(actions);
                }

                Some((generation, event)) = link_rx.recv() => {
                    if generation != self.generation {
                        continue;
                    }
                    let actions = match event {
                        LinkEvent::Dialed(ws_stream) => {
                            self.dialing = None;
                            log::info!("Connected to {} as '{}'", self.url, self.session.identity());
                            self.link = Some(Link::start(*ws_stream, generation, self.link_tx.clone()));
                            self.session.handle(SessionInput::TransportOpened)
                        }
                        LinkEvent::Frame(event) => {
                            let actions = self.session.observe(&event);
                            let _ = self.notify.send(ClientNotification::Event(event));
                            actions
                        }
                        LinkEvent::Closed => {
                            self.link = None;
                            self.session.handle(SessionInput::TransportClosed)
                        }
                        LinkEvent::Error(e) => {
                            self.dialing = None;
                            self.link = None;
                            self.session.handle(SessionInput::TransportError(e))
                        }
                    };
                    self.apply(actions);
                }

                _ = async {
                    match self.retry.as_mut() {
                        Some(sleep) => sleep.await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.retry = None;
                    let actions = self.session.handle(SessionInput::RetryElapsed);
                    self.apply(actions);
                }
            }
        }

        self.drop_transport();
        log::debug!("Client driver for '{}' stopped", self.session.identity());
    }

    /// Abort a pending dial and close the open socket, if any.
    fn drop_transport(&mut self) {
        self.generation += 1;
        if let Some(dialing) = self.dialing.take() {
            dialing.abort();
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
    }

    fn apply(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::OpenTransport => {
                    self.drop_transport();
                    self.dialing = Some(dial(
                        self.url.clone(),
                        self.generation,
                        self.connect_timeout,
                        self.link_tx.clone(),
                    ));
                }
                SessionAction::CloseTransport => {
                    self.drop_transport();
                    self.retry = None;
                }
                SessionAction::ScheduleRetry(delay) => {
                    self.retry = Some(Box::pin(tokio::time::sleep(delay)));
                }
                SessionAction::Transmit(event) => match &self.link {
                    Some(link) => {
                        if let Err(e) = link.transmit(&event) {
                            log::warn!("Send failed: {e}");
                        }
                    }
                    None => log::debug!("No transport for {event:?}"),
                },
            }
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        let state = self.session.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            let _ = self.notify.send(ClientNotification::StateChanged(state));
        }
    }
}

/// Handle to one endpoint's connection to the hub.
pub struct SignalClient {
    identity: Identity,
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    event_rx: Option<mpsc::UnboundedReceiver<ClientNotification>>,
}

impl SignalClient {
    /// Create a client and its driver task. Nothing connects until
    /// [`connect`](Self::connect).
    pub fn new(
        url: impl Into<String>,
        identity: Identity,
        display_name: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        let url = url.into();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (notify, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            url: url.clone(),
            session: Session::new(identity.clone(), display_name, &config),
            state_tx,
            notify,
            link: None,
            dialing: None,
            connect_timeout: config.connect_timeout,
            generation: 0,
            link_tx,
            retry: None,
        };
        tokio::spawn(driver.run(command_rx, link_rx));

        Self {
            identity,
            url,
            commands,
            state,
            event_rx: Some(event_rx),
        }
    }

    /// Take the notification receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientNotification>> {
        self.event_rx.take()
    }

    pub fn connect(&self) {
        self.command(Command::Connect);
    }

    /// Close the socket and stop reconnecting.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Send now, or queue until the next successful join.
    pub fn send(&self, event: ClientEvent) {
        self.command(Command::Send(event));
    }

    pub fn pair_with(&self, peer: Identity) {
        self.send(ClientEvent::PairWith { peer_id: peer });
    }

    pub fn signal(&self, kind: EnvelopeKind, to: Option<Identity>, payload: Value) {
        self.send(ClientEvent::Signal { kind, to, payload });
    }

    pub fn message(&self, to: Option<Identity>, text: impl Into<String>) {
        self.send(ClientEvent::Message {
            to,
            text: text.into(),
        });
    }

    pub fn subscribe_metrics(&self, identity: Identity) {
        self.send(ClientEvent::MetricsSubscribe { identity });
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the client reaches `target` or `limit` passes.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut state = self.state.clone();
        let reached = matches!(
            tokio::time::timeout(limit, state.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("Client driver for '{}' is gone", self.identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> SessionConfig {
        SessionConfig {
            backoff_initial: Duration::from_millis(20),
            backoff_max: Duration::from_millis(50),
            ..SessionConfig::default()
        }
    }

    async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SignalClient::new("ws://localhost:9090", Identity::from("glass"), "Glass", fast());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.identity(), &Identity::from("glass"));
        assert_eq!(client.url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SignalClient::new("ws://localhost:9090", Identity::from("glass"), "", fast());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_hub_keeps_retrying() {
        let mut client = SignalClient::new(dead_url().await, Identity::from("glass"), "", fast());
        let mut events = client.take_event_rx().unwrap();
        client.send(ClientEvent::Message {
            to: None,
            text: "queued".into(),
        });
        client.connect();

        assert!(client.wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(2)).await);
        // Still cycling after several retries.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        let first = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap();
        assert_eq!(
            first,
            Some(ClientNotification::StateChanged(ConnectionState::Connecting))
        );
    }

    #[tokio::test]
    async fn test_disconnect_stops_retrying() {
        let client = SignalClient::new(dead_url().await, Identity::from("glass"), "", fast());
        client.connect();
        assert!(client.wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(2)).await);

        client.disconnect();
        assert!(client.wait_for_state(ConnectionState::Disconnected, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    /// A listener that completes TCP connects but never answers the
    /// WebSocket handshake.
    async fn silent_url() -> (tokio::net::TcpListener, String) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("ws://127.0.0.1:{port}"))
    }

    #[tokio::test]
    async fn test_disconnect_during_stalled_dial() {
        let (_listener, url) = silent_url().await;
        let client = SignalClient::new(
            url,
            Identity::from("glass"),
            "",
            SessionConfig {
                connect_timeout: Duration::from_secs(30),
                ..fast()
            },
        );
        client.connect();
        assert!(client.wait_for_state(ConnectionState::Connecting, Duration::from_secs(1)).await);

        client.disconnect();
        assert!(client.wait_for_state(ConnectionState::Disconnected, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_stalled_dial_times_out_into_retry() {
        let (_listener, url) = silent_url().await;
        let mut client = SignalClient::new(
            url,
            Identity::from("glass"),
            "",
            SessionConfig {
                connect_timeout: Duration::from_millis(100),
                backoff_initial: Duration::from_secs(5),
                backoff_max: Duration::from_secs(5),
                ..fast()
            },
        );
        let mut events = client.take_event_rx().unwrap();
        client.connect();

        for expected in [ConnectionState::Connecting, ConnectionState::Reconnecting] {
            let notification = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap();
            assert_eq!(notification, Some(ClientNotification::StateChanged(expected)));
        }
    }
}
