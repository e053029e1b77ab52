//! Metrics history store.
//!
//! Per identity, two time-ordered series (telemetry and quality) bounded by
//! a sliding window rather than a count, plus the latest battery reading.
//!
//! ```text
//!  front (oldest)                                   back (newest)
//!  │ ts < now-window │ ......... retained ......... │ ◄── insert (search from back)
//!  └── evicted ──────┘
//! ```
//!
//! Samples mostly arrive in order, so insertion searches from the back and
//! eviction only ever pops from the front: both are amortized O(1) per sample.
//!
//! Subscribers are scoped to a target identity. A subscriber always receives
//! the full-window `metrics_snapshot` before any `metrics_update`, because
//! both are produced under the same lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::backplane::{Backplane, BackplaneMessage};
use crate::protocol::{now_ms, ConnId, Identity, MetricKind, Sample, ServerEvent};
use crate::registry::{EventSender, PresenceSignal};

/// Default retention window: 24 hours.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Time-ordered samples of one kind for one identity.
#[derive(Debug, Clone, Default)]
pub struct SampleSeries {
    samples: VecDeque<Sample>,
}

impl SampleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping timestamp order. Equal timestamps keep arrival order.
    pub fn insert(&mut self, sample: Sample) {
        let pos = self
            .samples
            .iter()
            .rposition(|existing| existing.ts <= sample.ts)
            .map_or(0, |i| i + 1);
        self.samples.insert(pos, sample);
    }

    /// Drop every sample older than `cutoff`. Returns how many went.
    pub fn evict_before(&mut self, cutoff: u64) -> usize {
        let mut evicted = 0;
        while self.samples.front().is_some_and(|s| s.ts < cutoff) {
            self.samples.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&Sample> {
        self.samples.front()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }
}

#[derive(Debug, Default)]
struct IdentityMetrics {
    telemetry: SampleSeries,
    quality: SampleSeries,
    battery: Option<Value>,
}

impl IdentityMetrics {
    fn series_mut(&mut self, kind: MetricKind) -> &mut SampleSeries {
        match kind {
            MetricKind::Telemetry => &mut self.telemetry,
            MetricKind::Quality => &mut self.quality,
        }
    }

    fn evict_before(&mut self, cutoff: u64) -> usize {
        self.telemetry.evict_before(cutoff) + self.quality.evict_before(cutoff)
    }

    fn is_empty(&self) -> bool {
        self.telemetry.is_empty() && self.quality.is_empty() && self.battery.is_none()
    }
}

/// Latest readings shown in the device list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatestReadings {
    pub battery: Option<Value>,
    pub telemetry: Option<Value>,
}

#[derive(Default)]
struct Inner {
    metrics: HashMap<Identity, IdentityMetrics>,
    subscribers: HashMap<Identity, HashMap<ConnId, EventSender>>,
}

impl Inner {
    fn notify(&mut self, identity: &Identity, event: ServerEvent) {
        if let Some(subs) = self.subscribers.get_mut(identity) {
            subs.retain(|_, tx| tx.send(event.clone()).is_ok());
            if subs.is_empty() {
                self.subscribers.remove(identity);
            }
        }
    }
}

pub struct MetricsStore {
    window_ms: u64,
    inner: Mutex<Inner>,
    presence: PresenceSignal,
    backplane: Arc<dyn Backplane>,
}

impl MetricsStore {
    pub fn new(window: Duration, presence: PresenceSignal, backplane: Arc<dyn Backplane>) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            inner: Mutex::new(Inner::default()),
            presence,
            backplane,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn cutoff(&self, now: u64) -> u64 {
        now.saturating_sub(self.window_ms)
    }

    /// Ingest a locally received sample and replicate it to other processes.
    pub async fn ingest(&self, identity: &Identity, kind: MetricKind, sample: Sample) {
        self.ingest_at(identity, kind, sample, now_ms()).await;
    }

    /// [`ingest`](Self::ingest) against an explicit clock.
    pub async fn ingest_at(&self, identity: &Identity, kind: MetricKind, sample: Sample, now: u64) {
        match serde_json::to_string(&sample.value) {
            Ok(value) => self.backplane.publish(BackplaneMessage::Sample {
                identity: identity.clone(),
                kind,
                ts: sample.ts,
                value,
            }),
            Err(e) => log::error!("Cannot replicate sample for '{identity}': {e}"),
        }
        self.record(identity, kind, sample, now).await;
    }

    /// Apply a sample replicated from another process.
    pub async fn apply_remote(&self, identity: &Identity, kind: MetricKind, sample: Sample) {
        self.record(identity, kind, sample, now_ms()).await;
    }

    async fn record(&self, identity: &Identity, kind: MetricKind, sample: Sample, now: u64) {
        let cutoff = self.cutoff(now);
        let mut inner = self.inner.lock().await;
        let entry = inner.metrics.entry(identity.clone()).or_default();
        let series = entry.series_mut(kind);
        series.insert(sample.clone());
        let evicted = series.evict_before(cutoff);
        if evicted > 0 {
            log::trace!("Evicted {evicted} {kind:?} samples for '{identity}'");
        }
        if sample.ts >= cutoff {
            inner.notify(
                identity,
                ServerEvent::MetricsUpdate {
                    identity: identity.clone(),
                    kind,
                    sample,
                },
            );
        }
        drop(inner);
        self.presence.bump();
    }

    /// Store the latest battery reading and replicate it.
    pub async fn ingest_battery(&self, identity: &Identity, value: Value) {
        match serde_json::to_string(&value) {
            Ok(encoded) => self.backplane.publish(BackplaneMessage::Battery {
                identity: identity.clone(),
                value: encoded,
            }),
            Err(e) => log::error!("Cannot replicate battery for '{identity}': {e}"),
        }
        self.apply_battery(identity, value).await;
    }

    pub async fn apply_battery(&self, identity: &Identity, value: Value) {
        let mut inner = self.inner.lock().await;
        inner.metrics.entry(identity.clone()).or_default().battery = Some(value);
        drop(inner);
        self.presence.bump();
    }

    /// Subscribe `conn_id` to `target`. The full-window snapshot is queued
    /// before the subscription can observe any update.
    pub async fn subscribe(&self, target: &Identity, conn_id: ConnId, tx: EventSender) {
        let cutoff = self.cutoff(now_ms());
        let mut inner = self.inner.lock().await;
        let (telemetry, quality) = match inner.metrics.get_mut(target) {
            Some(entry) => {
                entry.evict_before(cutoff);
                (entry.telemetry.to_vec(), entry.quality.to_vec())
            }
            None => (Vec::new(), Vec::new()),
        };
        let snapshot = ServerEvent::MetricsSnapshot {
            identity: target.clone(),
            telemetry,
            quality,
        };
        if tx.send(snapshot).is_ok() {
            inner
                .subscribers
                .entry(target.clone())
                .or_default()
                .insert(conn_id, tx);
        }
    }

    pub async fn unsubscribe(&self, target: &Identity, conn_id: ConnId) {
        let mut inner = self.inner.lock().await;
        if let Some(subs) = inner.subscribers.get_mut(target) {
            subs.remove(&conn_id);
            if subs.is_empty() {
                inner.subscribers.remove(target);
            }
        }
    }

    /// Drop every subscription held by a closing connection.
    pub async fn unsubscribe_all(&self, conn_id: ConnId) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|_, subs| {
            subs.remove(&conn_id);
            !subs.is_empty()
        });
    }

    pub async fn subscriber_count(&self, target: &Identity) -> usize {
        let inner = self.inner.lock().await;
        inner.subscribers.get(target).map_or(0, HashMap::len)
    }

    pub async fn series(&self, identity: &Identity, kind: MetricKind) -> Vec<Sample> {
        let mut inner = self.inner.lock().await;
        inner
            .metrics
            .get_mut(identity)
            .map(|entry| entry.series_mut(kind).to_vec())
            .unwrap_or_default()
    }

    pub async fn latest(&self, identity: &Identity) -> LatestReadings {
        let inner = self.inner.lock().await;
        inner
            .metrics
            .get(identity)
            .map(|entry| LatestReadings {
                battery: entry.battery.clone(),
                telemetry: entry.telemetry.latest().map(|s| s.value.clone()),
            })
            .unwrap_or_default()
    }

    pub async fn latest_all(&self) -> HashMap<Identity, LatestReadings> {
        let inner = self.inner.lock().await;
        inner
            .metrics
            .iter()
            .map(|(identity, entry)| {
                (
                    identity.clone(),
                    LatestReadings {
                        battery: entry.battery.clone(),
                        telemetry: entry.telemetry.latest().map(|s| s.value.clone()),
                    },
                )
            })
            .collect()
    }

    /// Evict expired samples across all identities and forget identities
    /// with nothing left. Returns the number of samples evicted.
    pub async fn sweep(&self, now: u64) -> usize {
        let cutoff = self.cutoff(now);
        let mut inner = self.inner.lock().await;
        let mut evicted = 0;
        inner.metrics.retain(|_, entry| {
            evicted += entry.evict_before(cutoff);
            !entry.is_empty()
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::NullBackplane;
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const HOUR: u64 = 60 * 60 * 1000;

    fn store() -> MetricsStore {
        MetricsStore::new(
            DEFAULT_WINDOW,
            PresenceSignal::new(),
            Arc::new(NullBackplane::new(Uuid::new_v4())),
        )
    }

    fn s(ts: u64) -> Sample {
        Sample::new(ts, json!({ "ts": ts }))
    }

    #[test]
    fn test_series_inserts_out_of_order() {
        let mut series = SampleSeries::new();
        for ts in [10, 30, 20, 40, 5, 30] {
            series.insert(s(ts));
        }
        let order: Vec<u64> = series.iter().map(|x| x.ts).collect();
        assert_eq!(order, vec![5, 10, 20, 30, 30, 40]);
        assert_eq!(series.latest().map(|x| x.ts), Some(40));
    }

    #[test]
    fn test_series_evicts_front_only() {
        let mut series = SampleSeries::new();
        for ts in 0..10 {
            series.insert(s(ts * 10));
        }
        assert_eq!(series.evict_before(35), 4);
        assert_eq!(series.oldest().map(|x| x.ts), Some(40));
        assert_eq!(series.evict_before(35), 0);
    }

    #[tokio::test]
    async fn test_window_retention_after_ingest() {
        let store = store();
        let id = Identity::from("glass");
        let now = 100 * HOUR;
        for hours_ago in [30, 26, 25, 23, 12, 1] {
            let ts = now - hours_ago * HOUR;
            store.ingest_at(&id, MetricKind::Telemetry, s(ts), ts).await;
        }
        store.ingest_at(&id, MetricKind::Telemetry, s(now), now).await;

        let kept = store.series(&id, MetricKind::Telemetry).await;
        assert!(kept.iter().all(|x| x.ts >= now - 24 * HOUR));
        assert_eq!(kept.len(), 4);
    }

    #[tokio::test]
    async fn test_snapshot_precedes_updates() {
        let store = store();
        let id = Identity::from("glass");
        let now = now_ms();
        store.ingest(&id, MetricKind::Quality, s(now - 10)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        store.subscribe(&id, conn, tx).await;
        store.ingest(&id, MetricKind::Quality, s(now)).await;

        match rx.recv().await.unwrap() {
            ServerEvent::MetricsSnapshot { quality, telemetry, .. } => {
                assert_eq!(quality.len(), 1);
                assert!(telemetry.is_empty());
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::MetricsUpdate {
                kind: MetricKind::Quality,
                ..
            }
        ));

        store.unsubscribe_all(conn).await;
        assert_eq!(store.subscriber_count(&id).await, 0);
        store.ingest(&id, MetricKind::Quality, s(now + 1)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_latest_readings_feed_device_list() {
        let store = store();
        let id = Identity::from("glass");
        let presence = store.presence.clone();
        let before = presence.generation();

        store.ingest_battery(&id, json!({ "level": 0.5 })).await;
        store
            .ingest(&id, MetricKind::Telemetry, Sample::new(now_ms(), json!({ "fps": 30 })))
            .await;

        let latest = store.latest(&id).await;
        assert_eq!(latest.battery, Some(json!({ "level": 0.5 })));
        assert_eq!(latest.telemetry, Some(json!({ "fps": 30 })));
        assert_eq!(presence.generation(), before + 2);
        assert!(store.latest_all().await.contains_key(&id));
    }

    #[tokio::test]
    async fn test_sweep_forgets_stale_identities() {
        let store = store();
        let id = Identity::from("glass");
        let now = 100 * HOUR;
        store.ingest_at(&id, MetricKind::Quality, s(now), now).await;
        assert_eq!(store.sweep(now + 25 * HOUR).await, 1);
        assert!(store.latest_all().await.is_empty());
    }
}
