//! In-process backplane: several hub nodes sharing one bus.
//!
//! Used to run multi-node scenarios inside a single test binary. A fan-out
//! delay can be injected to exercise the arbiter's timeout path.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use super::{
    Backplane, BackplaneEnvelope, BackplaneError, BackplaneMessage, EndpointRecord, LocalView,
    INBOX_CAPACITY,
};
use crate::protocol::NodeId;

struct MemoryNode {
    view: Option<Weak<dyn LocalView>>,
    inbox: broadcast::Sender<BackplaneEnvelope>,
}

/// Shared bus that simulated processes join.
#[derive(Default)]
pub struct MemoryCluster {
    nodes: RwLock<HashMap<NodeId, MemoryNode>>,
    fanout_delay: RwLock<Option<Duration>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a node to the bus and return its backplane handle.
    pub fn join(self: &Arc<Self>, node_id: NodeId) -> Arc<MemoryBackplane> {
        let (inbox, _) = broadcast::channel(INBOX_CAPACITY);
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id, MemoryNode { view: None, inbox });
        Arc::new(MemoryBackplane {
            node_id,
            cluster: self.clone(),
        })
    }

    /// Remove a node, as if its process died.
    pub fn leave(&self, node_id: &NodeId) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id);
    }

    /// Delay every fan-out query by `delay` (simulates a slow backplane).
    pub fn set_fanout_delay(&self, delay: Option<Duration>) {
        *self
            .fanout_delay
            .write()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// One node's handle on a [`MemoryCluster`].
pub struct MemoryBackplane {
    node_id: NodeId,
    cluster: Arc<MemoryCluster>,
}

impl Backplane for MemoryBackplane {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn attach(&self, view: Weak<dyn LocalView>) {
        let mut nodes = self
            .cluster
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = nodes.get_mut(&self.node_id) {
            node.view = Some(view);
        }
    }

    fn publish(&self, message: BackplaneMessage) {
        let nodes = self
            .cluster
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (id, node) in nodes.iter() {
            if *id == self.node_id {
                continue;
            }
            // No receivers yet is fine: nobody is listening on that node.
            let _ = node.inbox.send(BackplaneEnvelope {
                origin: self.node_id,
                message: message.clone(),
            });
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackplaneEnvelope> {
        let mut nodes = self
            .cluster
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        nodes
            .entry(self.node_id)
            .or_insert_with(|| MemoryNode {
                view: None,
                inbox: broadcast::channel(INBOX_CAPACITY).0,
            })
            .inbox
            .subscribe()
    }

    fn fetch_remote(&self) -> BoxFuture<'_, Result<Vec<EndpointRecord>, BackplaneError>> {
        Box::pin(async move {
            let (views, delay) = {
                let nodes = self
                    .cluster
                    .nodes
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                let views: Vec<Arc<dyn LocalView>> = nodes
                    .iter()
                    .filter(|(id, _)| **id != self.node_id)
                    .filter_map(|(_, node)| node.view.as_ref().and_then(Weak::upgrade))
                    .collect();
                let delay = *self
                    .cluster
                    .fanout_delay
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                (views, delay)
            };

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut records = Vec::new();
            for view in views {
                records.extend(view.records().await);
            }
            Ok(records)
        })
    }
}
