//! Duplicate identity arbiter.
//!
//! Cluster-wide mutual exclusion on identity without a lock service:
//!
//! ```text
//!  register(pending) ──► fan-out ──► remote live holder?        ──► reject
//!                           ▲        remote pending, earlier key? ──► reject
//!                           │        remote pending, later key?   ──► poll again
//!                           └────────────────────────────────────────┘
//!                                    nothing in the way           ──► activate
//! ```
//!
//! Both sides of a race order claims by the same key, so the later claim
//! backs off and the earlier one waits until it has. The whole verification
//! is bounded by one deadline; when it expires the claim is accepted on the
//! local view alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backplane::{ClaimState, EndpointRecord};
use crate::directory::{ClaimView, ClusterDirectory};
use crate::error::HubError;
use crate::protocol::{ConnId, HolderInfo};
use crate::registry::{ConnectionRegistry, Endpoint, EventSender};

/// Delay between re-reads while a later competing claim is unresolved.
const CONTENTION_POLL: Duration = Duration::from_millis(15);

enum Verdict {
    Clear,
    Contended,
    Held(HolderInfo),
}

fn judge(remote: &[EndpointRecord], mine: &EndpointRecord) -> Verdict {
    let rivals = remote.iter().filter(|r| r.identity == mine.identity);
    let mut contended = false;
    for rival in rivals {
        if rival.is_live() || rival.claim_key() < mine.claim_key() {
            return Verdict::Held(rival.holder_info());
        }
        contended = true;
    }
    if contended {
        Verdict::Contended
    } else {
        Verdict::Clear
    }
}

pub struct IdentityArbiter {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<ClusterDirectory>,
    timeout: Duration,
}

impl IdentityArbiter {
    pub fn new(directory: Arc<ClusterDirectory>, timeout: Duration) -> Self {
        Self {
            registry: directory.registry().clone(),
            directory,
            timeout,
        }
    }

    /// Claim `endpoint.identity` for `conn_id`.
    ///
    /// On success the endpoint is live in the local registry and the view
    /// the decision was taken on is returned. On `DuplicateIdentity` the
    /// pending row has already been removed again.
    pub async fn claim(
        &self,
        endpoint: Endpoint,
        conn_id: ConnId,
        tx: EventSender,
    ) -> Result<ClaimView, HubError> {
        let identity = endpoint.identity.clone();
        self.registry.register(endpoint.clone(), conn_id, tx).await?;

        let mine = EndpointRecord {
            identity: identity.clone(),
            display_name: endpoint.display_name.clone(),
            connected_at: endpoint.connected_at,
            node: endpoint.node,
            conn_id,
            room: None,
            state: ClaimState::Pending,
        };

        let deadline = Instant::now() + self.timeout;
        let view = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let remote = match self.directory.remote_within(remaining).await {
                Ok(remote) => remote,
                Err(e) => {
                    log::warn!("Claim for '{identity}' decided on local view only: {e}");
                    break ClaimView::LocalOnly(self.registry.records().await);
                }
            };
            match judge(&remote, &mine) {
                Verdict::Clear => {
                    let mut records = self.registry.records().await;
                    records.extend(remote);
                    break ClaimView::Cluster(records);
                }
                Verdict::Held(holder) => {
                    self.registry.unregister(&identity, conn_id).await;
                    log::info!(
                        "Rejected duplicate '{identity}': held on node {} since {}",
                        holder.node,
                        holder.connected_at
                    );
                    return Err(HubError::DuplicateIdentity { identity, holder });
                }
                Verdict::Contended => {
                    log::debug!("Claim for '{identity}' contended; re-reading cluster");
                    tokio::time::sleep(CONTENTION_POLL.min(remaining)).await;
                }
            }
        };

        if !self.registry.activate(&identity, conn_id).await {
            // The connection went away while we were verifying.
            return Err(HubError::PeerUnavailable(identity));
        }
        Ok(view)
    }
}
