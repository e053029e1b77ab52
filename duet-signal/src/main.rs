//! `duet-hub`: run one signaling hub process.
//!
//! Usage: `duet-hub [config.json]`. Environment overrides are listed in
//! [`duet_signal::config`]; log filtering follows `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use duet_signal::{Backplane, Hub, HubConfig, MeshBackplane, NullBackplane, SignalServer};
use log::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = HubConfig::load(path.as_deref())?;
    let node_id = config.node_id.unwrap_or_else(Uuid::new_v4);

    info!("Starting duet hub node {node_id}...");

    let backplane: Arc<dyn Backplane> = match &config.mesh {
        Some(mesh) => MeshBackplane::start(node_id, mesh.clone()).await?,
        None => Arc::new(NullBackplane::new(node_id)),
    };

    let hub = Hub::start(config, backplane);
    SignalServer::new(hub).run().await
}
