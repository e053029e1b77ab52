//! Cluster-wide view over the local registry plus the backplane.
//!
//! This is the only place that blocks on other processes. Every fan-out runs
//! under a hard timeout; on timeout or backplane failure callers get the
//! local view instead, flagged as [`ClaimView::LocalOnly`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backplane::{Backplane, BackplaneMessage, EndpointRecord};
use crate::error::HubError;
use crate::protocol::{Identity, PairEntry, RoomId, ServerEvent};
use crate::registry::ConnectionRegistry;

/// Registry rows of the whole cluster, or of this process only when the
/// fan-out could not complete in time.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimView {
    Cluster(Vec<EndpointRecord>),
    LocalOnly(Vec<EndpointRecord>),
}

impl ClaimView {
    pub fn records(&self) -> &[EndpointRecord] {
        match self {
            Self::Cluster(records) | Self::LocalOnly(records) => records,
        }
    }

    pub fn into_records(self) -> Vec<EndpointRecord> {
        match self {
            Self::Cluster(records) | Self::LocalOnly(records) => records,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::LocalOnly(_))
    }

    pub fn live(&self) -> impl Iterator<Item = &EndpointRecord> {
        self.records().iter().filter(|record| record.is_live())
    }

    pub fn find_live(&self, identity: &Identity) -> Option<&EndpointRecord> {
        self.live().find(|record| &record.identity == identity)
    }

    /// Rooms with both members live, each reported once.
    pub fn occupied_pairs(&self) -> Vec<PairEntry> {
        let mut rooms: BTreeMap<&RoomId, Vec<&Identity>> = BTreeMap::new();
        for record in self.live() {
            if let Some(room) = &record.room {
                rooms.entry(room).or_default().push(&record.identity);
            }
        }
        rooms
            .into_values()
            .filter_map(|mut members| {
                members.sort();
                match members.as_slice() {
                    [a, b] => Some(PairEntry {
                        a: (*a).clone(),
                        b: (*b).clone(),
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

/// How an identity-addressed event left this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Local,
    Forwarded,
    Dropped,
}

pub struct ClusterDirectory {
    registry: Arc<ConnectionRegistry>,
    backplane: Arc<dyn Backplane>,
    fanout_timeout: Duration,
}

impl ClusterDirectory {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        backplane: Arc<dyn Backplane>,
        fanout_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            backplane,
            fanout_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn fanout_timeout(&self) -> Duration {
        self.fanout_timeout
    }

    /// Rows of every other process, bounded by `limit`.
    pub async fn remote_within(&self, limit: Duration) -> Result<Vec<EndpointRecord>, HubError> {
        match tokio::time::timeout(limit, self.backplane.fetch_remote()).await {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(e)) => Err(HubError::Backplane(e.to_string())),
            Err(_) => Err(HubError::ArbiterTimeout(limit.as_millis() as u64)),
        }
    }

    /// Local rows plus every reachable remote row.
    pub async fn snapshot(&self) -> ClaimView {
        let mut records = self.registry.records().await;
        match self.remote_within(self.fanout_timeout).await {
            Ok(remote) => {
                records.extend(remote);
                ClaimView::Cluster(records)
            }
            Err(e) => {
                log::warn!("Cluster fan-out degraded to local view: {e}");
                ClaimView::LocalOnly(records)
            }
        }
    }

    /// Deliver to `to` wherever it lives. Remote delivery is fire-and-forget;
    /// the owning process drops it if the identity is gone.
    pub async fn deliver(&self, to: &Identity, event: ServerEvent) -> Delivery {
        if self.registry.send(to, event.clone()).await {
            return Delivery::Local;
        }
        if self.registry.is_local(to).await || !self.backplane.is_clustered() {
            return Delivery::Dropped;
        }
        match event.encode() {
            Ok(frame) => {
                self.backplane.publish(BackplaneMessage::Deliver {
                    to: to.clone(),
                    frame,
                });
                Delivery::Forwarded
            }
            Err(e) => {
                log::error!("Cannot forward {} to '{to}': {e}", event.name());
                Delivery::Dropped
            }
        }
    }

    pub fn publish(&self, message: BackplaneMessage) {
        self.backplane.publish(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::{ClaimState, MemoryCluster};
    use crate::registry::Endpoint;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn live(identity: &str, room: Option<RoomId>) -> EndpointRecord {
        EndpointRecord {
            identity: Identity::from(identity),
            display_name: identity.into(),
            connected_at: 1,
            node: Uuid::new_v4(),
            conn_id: Uuid::new_v4(),
            room,
            state: ClaimState::Live,
        }
    }

    #[test]
    fn test_occupied_pairs_needs_both_members() {
        let (a, b, c) = (
            Identity::from("a"),
            Identity::from("b"),
            Identity::from("c"),
        );
        let full = RoomId::for_pair(&a, &b);
        let half = RoomId::for_pair(&c, &Identity::from("d"));
        let view = ClaimView::Cluster(vec![
            live("b", Some(full.clone())),
            live("a", Some(full)),
            live("c", Some(half)),
        ]);
        assert_eq!(view.occupied_pairs(), vec![PairEntry { a, b }]);
    }

    #[tokio::test]
    async fn test_snapshot_merges_nodes() {
        let cluster = MemoryCluster::new();
        let reg_a = ConnectionRegistry::new(cluster.join(Uuid::new_v4()));
        let bp_b = cluster.join(Uuid::new_v4());
        let reg_b = ConnectionRegistry::new(bp_b.clone());
        let dir_b = ClusterDirectory::new(reg_b.clone(), bp_b, Duration::from_millis(200));

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        let id = Identity::from("glass");
        reg_a
            .register(Endpoint::new(id.clone(), "", reg_a.node_id()), conn, tx)
            .await
            .unwrap();
        reg_a.activate(&id, conn).await;

        let view = dir_b.snapshot().await;
        assert!(!view.is_degraded());
        assert_eq!(view.find_live(&id).map(|r| r.node), Some(reg_a.node_id()));
    }

    #[tokio::test]
    async fn test_snapshot_degrades_on_timeout() {
        let cluster = MemoryCluster::new();
        let _reg_a = ConnectionRegistry::new(cluster.join(Uuid::new_v4()));
        let bp_b = cluster.join(Uuid::new_v4());
        let reg_b = ConnectionRegistry::new(bp_b.clone());
        let dir_b = ClusterDirectory::new(reg_b, bp_b, Duration::from_millis(20));

        cluster.set_fanout_delay(Some(Duration::from_millis(300)));
        assert!(dir_b.snapshot().await.is_degraded());
    }

    #[tokio::test]
    async fn test_deliver_forwards_unknown_identities() {
        let cluster = MemoryCluster::new();
        let bp_a = cluster.join(Uuid::new_v4());
        let bp_b = cluster.join(Uuid::new_v4());
        let mut inbox_b = bp_b.subscribe();
        let reg_a = ConnectionRegistry::new(bp_a.clone());
        let dir_a = ClusterDirectory::new(reg_a, bp_a, Duration::from_millis(200));

        let outcome = dir_a
            .deliver(&Identity::from("desk"), ServerEvent::DeviceList(vec![]))
            .await;
        assert_eq!(outcome, Delivery::Forwarded);

        loop {
            let got = inbox_b.recv().await.unwrap();
            if let BackplaneMessage::Deliver { to, frame } = got.message {
                assert_eq!(to, Identity::from("desk"));
                assert_eq!(
                    ServerEvent::decode(&frame).unwrap(),
                    ServerEvent::DeviceList(vec![])
                );
                break;
            }
        }
    }
}
