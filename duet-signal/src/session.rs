//! Client connection state machine.
//!
//! Pure and I/O free: feed it [`SessionInput`]s, execute the
//! [`SessionAction`]s it returns. The WebSocket driver lives in
//! [`client`](crate::client).
//!
//! ```text
//!                Connect                 TransportOpened
//!  Disconnected ────────► Connecting ─────────────────► Connected
//!       ▲                     │                           │
//!       │ Disconnect          │ TransportClosed/Error     │ TransportClosed/Error
//!       │ (sticky)            ▼                           ▼
//!       └──────────────── Reconnecting ◄──── RetryElapsed (OpenTransport)
//!
//!  any ── DuplicateIdentity ──► Rejected   (terminal until Connect)
//! ```
//!
//! Sends issued while not connected go to a bounded outbox (drop-oldest).
//! On entering Connected the session re-announces itself (join, outstanding
//! pair request, metrics subscriptions) and then flushes the outbox, all
//! before any new send.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use crate::protocol::{ClientEvent, HolderInfo, Identity, ServerEvent};

/// Client-side tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Sends kept while offline
    pub outbox_capacity: usize,
    /// First reconnect delay
    pub backoff_initial: Duration,
    /// Reconnect delay ceiling
    pub backoff_max: Duration,
    /// Growth factor between attempts
    pub backoff_factor: f64,
    /// Limit on one dial, handshake included
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 200,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            backoff_factor: 2.0,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Capped exponential backoff with unlimited attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            current: initial,
            attempts: 0,
        }
    }

    /// Delay before the next attempt; grows until `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.mul_f64(self.factor).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        let config = SessionConfig::default();
        Self::new(
            config.backoff_initial,
            config.backoff_max,
            config.backoff_factor,
        )
    }
}

/// FIFO of sends issued while offline. Overflow drops the oldest entry.
#[derive(Debug, Clone)]
pub struct Outbox {
    queue: VecDeque<ClientEvent>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Enqueue; returns the entry evicted to make room, if any.
    pub fn push(&mut self, event: ClientEvent) -> Option<ClientEvent> {
        if self.capacity == 0 {
            self.dropped += 1;
            return Some(event);
        }
        let evicted = if self.queue.len() >= self.capacity {
            self.dropped += 1;
            self.queue.pop_front()
        } else {
            None
        };
        self.queue.push_back(event);
        evicted
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Identity held elsewhere. No automatic retry until `Connect`.
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionInput {
    Connect,
    Disconnect,
    TransportOpened,
    TransportClosed,
    TransportError(String),
    DuplicateIdentity(HolderInfo),
    RetryElapsed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    OpenTransport,
    CloseTransport,
    ScheduleRetry(Duration),
    Transmit(ClientEvent),
}

pub struct Session {
    identity: Identity,
    display_name: String,
    state: ConnectionState,
    manual_disconnect: bool,
    outbox: Outbox,
    backoff: Backoff,
    pair_request: Option<Identity>,
    subscriptions: BTreeSet<Identity>,
    rejected_by: Option<HolderInfo>,
}

impl Session {
    pub fn new(identity: Identity, display_name: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            identity,
            display_name: display_name.into(),
            state: ConnectionState::Disconnected,
            manual_disconnect: false,
            outbox: Outbox::new(config.outbox_capacity),
            backoff: Backoff::new(
                config.backoff_initial,
                config.backoff_max,
                config.backoff_factor,
            ),
            pair_request: None,
            subscriptions: BTreeSet::new(),
            rejected_by: None,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Holder of our identity, once rejected.
    pub fn rejected_by(&self) -> Option<&HolderInfo> {
        self.rejected_by.as_ref()
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        use ConnectionState::*;

        match input {
            SessionInput::Connect => {
                self.manual_disconnect = false;
                self.rejected_by = None;
                match self.state {
                    Connecting | Connected => Vec::new(),
                    Disconnected | Reconnecting | Rejected => {
                        self.state = Connecting;
                        self.backoff.reset();
                        vec![SessionAction::OpenTransport]
                    }
                }
            }

            SessionInput::Disconnect => {
                self.manual_disconnect = true;
                let had_transport = matches!(self.state, Connecting | Connected | Reconnecting);
                if self.state != Rejected {
                    self.state = Disconnected;
                }
                if had_transport {
                    vec![SessionAction::CloseTransport]
                } else {
                    Vec::new()
                }
            }

            SessionInput::TransportOpened => match self.state {
                Connecting | Reconnecting => {
                    self.state = Connected;
                    self.backoff.reset();
                    self.announce()
                }
                Disconnected | Rejected | Connected => vec![SessionAction::CloseTransport],
            },

            SessionInput::TransportClosed | SessionInput::TransportError(_) => {
                if let SessionInput::TransportError(e) = &input {
                    log::warn!("Transport error for '{}': {e}", self.identity);
                }
                match self.state {
                    Rejected | Disconnected => Vec::new(),
                    Connecting | Connected | Reconnecting => {
                        if self.manual_disconnect {
                            self.state = Disconnected;
                            return Vec::new();
                        }
                        self.state = Reconnecting;
                        let delay = self.backoff.next_delay();
                        log::debug!(
                            "Reconnecting '{}' in {delay:?} (attempt {})",
                            self.identity,
                            self.backoff.attempts()
                        );
                        vec![SessionAction::ScheduleRetry(delay)]
                    }
                }
            }

            SessionInput::DuplicateIdentity(holder) => {
                log::warn!(
                    "Identity '{}' is held by node {}; not retrying",
                    self.identity,
                    holder.node
                );
                let had_transport = matches!(self.state, Connecting | Connected | Reconnecting);
                self.state = Rejected;
                self.rejected_by = Some(holder);
                if had_transport {
                    vec![SessionAction::CloseTransport]
                } else {
                    Vec::new()
                }
            }

            SessionInput::RetryElapsed => {
                if self.state == Reconnecting && !self.manual_disconnect {
                    vec![SessionAction::OpenTransport]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Application send. Transmits now when connected, queues otherwise.
    pub fn send(&mut self, event: ClientEvent) -> Vec<SessionAction> {
        // Pairing and subscriptions are replayed by `announce`, so offline
        // they only update the outstanding state.
        let replayed = match &event {
            ClientEvent::PairWith { peer_id } => {
                self.pair_request = Some(peer_id.clone());
                true
            }
            ClientEvent::MetricsSubscribe { identity } => {
                self.subscriptions.insert(identity.clone());
                true
            }
            ClientEvent::MetricsUnsubscribe { identity } => {
                self.subscriptions.remove(identity);
                true
            }
            _ => false,
        };

        if self.state == ConnectionState::Connected {
            vec![SessionAction::Transmit(event)]
        } else if replayed {
            Vec::new()
        } else {
            if let Some(evicted) = self.outbox.push(event) {
                log::debug!("Outbox full; dropped oldest {evicted:?}");
            }
            Vec::new()
        }
    }

    /// React to server events that affect the session itself.
    pub fn observe(&mut self, event: &ServerEvent) -> Vec<SessionAction> {
        match event {
            ServerEvent::DuplicateId { identity, holder } if *identity == self.identity => {
                self.handle(SessionInput::DuplicateIdentity(holder.clone()))
            }
            ServerEvent::PairError { peer_id, .. } if self.pair_request.as_ref() == Some(peer_id) => {
                self.pair_request = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn announce(&mut self) -> Vec<SessionAction> {
        let mut actions = vec![SessionAction::Transmit(ClientEvent::Join {
            identity: self.identity.clone(),
            display_name: self.display_name.clone(),
        })];
        if let Some(peer) = &self.pair_request {
            actions.push(SessionAction::Transmit(ClientEvent::PairWith {
                peer_id: peer.clone(),
            }));
        }
        actions.extend(self.subscriptions.iter().map(|identity| {
            SessionAction::Transmit(ClientEvent::MetricsSubscribe {
                identity: identity.clone(),
            })
        }));
        actions.extend(self.outbox.drain().map(SessionAction::Transmit));
        actions
    }
}
