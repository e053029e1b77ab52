//! Integration tests for the WebSocket hub.
//!
//! These tests start a real server and connect real endpoints, either raw
//! WebSocket streams speaking the JSON protocol or [`SignalClient`]s.

use duet_signal::client::{ClientNotification, SignalClient};
use duet_signal::config::HubConfig;
use duet_signal::hub::Hub;
use duet_signal::pairing::PairingTable;
use duet_signal::protocol::{ClientEvent, EnvelopeKind, Identity, ServerEvent};
use duet_signal::server::SignalServer;
use duet_signal::session::{ConnectionState, SessionConfig};
use duet_signal::NullBackplane;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(port: u16) -> HubConfig {
    HubConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        presence_coalesce_ms: 10,
        pairs: PairingTable::new([(Identity::from("glass"), Identity::from("desk"))]),
        ..HubConfig::default()
    }
}

/// Start a server on `port`.
async fn start_test_server_on(port: u16) {
    let hub = Hub::start(test_config(port), Arc::new(NullBackplane::new(Uuid::new_v4())));
    let server = SignalServer::new(hub);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    start_test_server_on(port).await;
    port
}

async fn connect(port: u16) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws
}

async fn send(ws: &mut Ws, event: ClientEvent) {
    ws.send(Message::Text(event.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn join(port: u16, identity: &str) -> Ws {
    let mut ws = connect(port).await;
    send(
        &mut ws,
        ClientEvent::Join {
            identity: Identity::from(identity),
            display_name: identity.to_uppercase(),
        },
    )
    .await;
    ws
}

/// Next server event matching `pred`, skipping everything else.
async fn next_event(ws: &mut Ws, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let event = ServerEvent::decode(text.as_str()).unwrap();
                    if pred(&event) {
                        return event;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for server event")
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_join_gets_history_then_device_list() {
    let port = start_test_server().await;
    let mut ws = join(port, "glass").await;

    let history = next_event(&mut ws, |_| true).await;
    assert_eq!(history, ServerEvent::MessageHistory(Vec::new()));

    let list = next_event(&mut ws, |e| matches!(e, ServerEvent::DeviceList(_))).await;
    match list {
        ServerEvent::DeviceList(devices) => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].identity, Identity::from("glass"));
            assert_eq!(devices[0].display_name, "GLASS");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_identify_alias_is_accepted() {
    let port = start_test_server().await;
    let mut ws = connect(port).await;
    ws.send(Message::Text(
        r#"{"event":"identify","data":{"identity":"glass"}}"#.into(),
    ))
    .await
    .unwrap();
    next_event(&mut ws, |e| matches!(e, ServerEvent::MessageHistory(_))).await;
}

#[tokio::test]
async fn test_pair_and_relay_signal() {
    let port = start_test_server().await;
    let mut glass = join(port, "glass").await;
    next_event(&mut glass, |e| matches!(e, ServerEvent::MessageHistory(_))).await;
    let mut desk = join(port, "desk").await;

    let joined = next_event(&mut desk, |e| matches!(e, ServerEvent::RoomJoined { .. })).await;
    assert_eq!(
        joined,
        ServerEvent::RoomJoined {
            room_id: duet_signal::RoomId::for_pair(&Identity::from("glass"), &Identity::from("desk")),
            members: vec![Identity::from("desk"), Identity::from("glass")],
        }
    );
    next_event(&mut glass, |e| matches!(e, ServerEvent::RoomJoined { .. })).await;

    send(
        &mut glass,
        ClientEvent::Signal {
            kind: EnvelopeKind::Offer,
            to: None,
            payload: json!({ "sdp": "v=0" }),
        },
    )
    .await;
    match next_event(&mut desk, |e| matches!(e, ServerEvent::Signal(_))).await {
        ServerEvent::Signal(envelope) => {
            assert_eq!(envelope.kind, EnvelopeKind::Offer);
            assert_eq!(envelope.from, Identity::from("glass"));
            assert_eq!(envelope.payload["sdp"], "v=0");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_peer_left_on_disconnect() {
    let port = start_test_server().await;
    let mut glass = join(port, "glass").await;
    let mut desk = join(port, "desk").await;
    next_event(&mut glass, |e| matches!(e, ServerEvent::RoomJoined { .. })).await;
    next_event(&mut desk, |e| matches!(e, ServerEvent::RoomJoined { .. })).await;

    desk.close(None).await.unwrap();
    let left = next_event(&mut glass, |e| matches!(e, ServerEvent::PeerLeft { .. })).await;
    assert!(matches!(left, ServerEvent::PeerLeft { identity, .. } if identity == Identity::from("desk")));
    next_event(&mut glass, |e| matches!(e, ServerEvent::RoomUpdate { pairs } if pairs.is_empty())).await;
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server().await;
    let mut ws = connect(port).await;
    ws.send(Message::Ping(vec![7, 7].into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap();
    match reply {
        Some(Ok(Message::Pong(data))) => assert_eq!(data.to_vec(), vec![7, 7]),
        other => panic!("Expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let port = start_test_server().await;
    let mut ws = connect(port).await;
    ws.send(Message::Text("definitely not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"event":"no_such_event"}"#.into())).await.unwrap();

    send(
        &mut ws,
        ClientEvent::Join {
            identity: Identity::from("glass"),
            display_name: String::new(),
        },
    )
    .await;
    next_event(&mut ws, |e| matches!(e, ServerEvent::MessageHistory(_))).await;
}

#[tokio::test]
async fn test_same_process_reclaim_is_refused() {
    let port = start_test_server().await;
    let mut first = join(port, "glass").await;
    next_event(&mut first, |e| matches!(e, ServerEvent::MessageHistory(_))).await;

    let mut second = join(port, "glass").await;
    let refusal = next_event(&mut second, |_| true).await;
    assert_eq!(
        refusal,
        ServerEvent::IdentityConflict {
            identity: Identity::from("glass")
        }
    );
    let closed = timeout(Duration::from_secs(2), second.next()).await.unwrap();
    assert!(matches!(closed, Some(Ok(Message::Close(_))) | None | Some(Err(_))));

    // The first holder is unaffected.
    send(
        &mut first,
        ClientEvent::Message {
            to: Some(Identity::from("glass")),
            text: "note to self".into(),
        },
    )
    .await;
    next_event(&mut first, |e| matches!(e, ServerEvent::Message(_))).await;
}

#[tokio::test]
async fn test_metrics_subscription_gets_snapshot_then_updates() {
    let port = start_test_server().await;
    let mut glass = join(port, "glass").await;
    let mut viewer = join(port, "desk").await;

    send(&mut glass, ClientEvent::Telemetry(json!({ "hr": 61 }))).await;
    // Ensure the first sample is stored before subscribing.
    next_event(&mut glass, |e| matches!(e, ServerEvent::DeviceList(d) if d.iter().any(|x| x.telemetry.is_some()))).await;

    send(
        &mut viewer,
        ClientEvent::MetricsSubscribe {
            identity: Identity::from("glass"),
        },
    )
    .await;
    match next_event(&mut viewer, |e| matches!(e, ServerEvent::MetricsSnapshot { .. })).await {
        ServerEvent::MetricsSnapshot { telemetry, quality, .. } => {
            assert_eq!(telemetry.len(), 1);
            assert!(quality.is_empty());
        }
        _ => unreachable!(),
    }

    send(&mut glass, ClientEvent::WebrtcQuality(json!({ "rtt": 42 }))).await;
    match next_event(&mut viewer, |e| matches!(e, ServerEvent::MetricsUpdate { .. })).await {
        ServerEvent::MetricsUpdate { kind, sample, .. } => {
            assert_eq!(kind, duet_signal::MetricKind::Quality);
            assert_eq!(sample.value["rtt"], 42);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_client_reconnects_and_flushes_outbox() {
    let port = free_port().await;
    let config = SessionConfig {
        backoff_initial: Duration::from_millis(300),
        backoff_max: Duration::from_millis(300),
        ..SessionConfig::default()
    };
    let mut glass = SignalClient::new(
        format!("ws://127.0.0.1:{port}"),
        Identity::from("glass"),
        "Glass",
        config,
    );
    let mut events = glass.take_event_rx().unwrap();
    glass.connect();
    assert!(glass.wait_for_state(ConnectionState::Reconnecting, Duration::from_secs(2)).await);
    glass.message(None, "sent while offline");

    start_test_server_on(port).await;
    let mut desk = join(port, "desk").await;
    next_event(&mut desk, |e| matches!(e, ServerEvent::MessageHistory(_))).await;

    assert!(glass.wait_for_state(ConnectionState::Connected, Duration::from_secs(3)).await);
    match next_event(&mut desk, |e| matches!(e, ServerEvent::Message(_))).await {
        ServerEvent::Message(envelope) => {
            assert_eq!(envelope.from, Identity::from("glass"));
            assert_eq!(envelope.payload["text"], "sent while offline");
        }
        _ => unreachable!(),
    }

    let joined = timeout(Duration::from_secs(2), async {
        while let Some(notification) = events.recv().await {
            if let ClientNotification::Event(ServerEvent::RoomJoined { .. }) = notification {
                return true;
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(joined);
}
