//! Signal / control router.
//!
//! ```text
//!  envelope ──► stamp `from`
//!      │
//!      ├── kind == quality ──► MetricsStore (never forwarded)
//!      ├── `to` set        ──► that identity, anywhere in the cluster
//!      └── `to` absent     ──► other members of the sender's room
//! ```
//!
//! Delivery is best-effort and never retried. An envelope with nowhere to
//! go is dropped and counted; the sender is not told.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::directory::{ClusterDirectory, Delivery};
use crate::error::HubError;
use crate::metrics::MetricsStore;
use crate::pairing::PairingManager;
use crate::protocol::{now_ms, Envelope, EnvelopeKind, Identity, MetricKind, Sample};

/// Router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStats {
    pub delivered: u64,
    pub forwarded: u64,
    pub dropped: u64,
    pub diverted: u64,
}

/// Lock-free counters on the routing hot path, read via `snapshot()`.
#[derive(Default)]
struct AtomicRouteStats {
    delivered: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    diverted: AtomicU64,
}

impl AtomicRouteStats {
    fn snapshot(&self) -> RouteStats {
        RouteStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            diverted: self.diverted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Quality sample handed to the metrics store.
    Diverted,
    /// Handed to `local` connections here and `forwarded` to other processes.
    Sent { local: usize, forwarded: usize },
}

pub struct SignalRouter {
    directory: Arc<ClusterDirectory>,
    pairing: Arc<PairingManager>,
    metrics: Arc<MetricsStore>,
    stats: AtomicRouteStats,
}

impl SignalRouter {
    pub fn new(
        directory: Arc<ClusterDirectory>,
        pairing: Arc<PairingManager>,
        metrics: Arc<MetricsStore>,
    ) -> Self {
        Self {
            directory,
            pairing,
            metrics,
            stats: AtomicRouteStats::default(),
        }
    }

    pub fn stats(&self) -> RouteStats {
        self.stats.snapshot()
    }

    /// Route one envelope on behalf of `from`.
    pub async fn route(&self, from: &Identity, mut envelope: Envelope) -> Result<RouteOutcome, HubError> {
        envelope.from = from.clone();

        if envelope.kind == EnvelopeKind::Quality {
            let sample = Sample::from_payload(envelope.payload, now_ms());
            self.metrics.ingest(from, MetricKind::Quality, sample).await;
            self.stats.diverted.fetch_add(1, Ordering::Relaxed);
            return Ok(RouteOutcome::Diverted);
        }

        let targets = match envelope.to.clone() {
            Some(to) => vec![to],
            None => match self.pairing.room_peers(from).await {
                Some((_, peers)) if !peers.is_empty() => peers,
                _ => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(HubError::RoutingFailed(from.clone()));
                }
            },
        };

        let event = envelope.into_event();
        let (mut local, mut forwarded) = (0, 0);
        for target in &targets {
            match self.directory.deliver(target, event.clone()).await {
                Delivery::Local => local += 1,
                Delivery::Forwarded => forwarded += 1,
                Delivery::Dropped => {}
            }
        }
        self.stats.delivered.fetch_add(local as u64, Ordering::Relaxed);
        self.stats.forwarded.fetch_add(forwarded as u64, Ordering::Relaxed);

        if local + forwarded == 0 {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(HubError::RoutingFailed(from.clone()));
        }
        log::trace!("Routed {} from '{from}' to {targets:?}", event.name());
        Ok(RouteOutcome::Sent { local, forwarded })
    }
}
