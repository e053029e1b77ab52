//! Hub configuration.
//!
//! Loaded from an optional JSON file, then overridden from the environment:
//!
//! | Variable           | Field              |
//! |--------------------|--------------------|
//! | `DUET_BIND_ADDR`   | `bind_addr`        |
//! | `DUET_NODE_ID`     | `node_id`          |
//! | `DUET_MESH_LISTEN` | `mesh.listen_addr` |
//! | `DUET_MESH_PEERS`  | `mesh.peers` (comma separated) |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backplane::MeshConfig;
use crate::pairing::PairingTable;
use crate::protocol::Identity;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Hub server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the client WebSocket listener binds to
    pub bind_addr: String,
    /// Stable node id; random when absent
    pub node_id: Option<Uuid>,
    /// Deadline for the cross-process identity fan-out
    pub arbiter_timeout_ms: u64,
    /// Metrics retention window
    pub metrics_window_secs: u64,
    /// How long presence changes are coalesced before a device list goes out
    pub presence_coalesce_ms: u64,
    /// Interval of the background metrics sweep
    pub metrics_sweep_secs: u64,
    /// Chat envelopes replayed per identity on join
    pub chat_history_len: usize,
    /// Deadline for one transcript → note transformation
    pub note_timeout_ms: u64,
    /// Pairing allow-list
    pub pairs: PairingTable,
    /// Cross-process mesh; `None` runs a standalone hub
    pub mesh: Option<MeshConfig>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            node_id: None,
            arbiter_timeout_ms: 750,
            metrics_window_secs: 24 * 60 * 60,
            presence_coalesce_ms: 100,
            metrics_sweep_secs: 60,
            chat_history_len: 50,
            note_timeout_ms: 10_000,
            pairs: PairingTable::new([(Identity::from("headset-1"), Identity::from("desk-1"))]),
            mesh: None,
        }
    }
}

impl HubConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// File (if any), then process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `DUET_*` overrides from `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(addr) = lookup("DUET_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(id) = lookup("DUET_NODE_ID") {
            let id = Uuid::parse_str(id.trim()).map_err(|e| ConfigError::Invalid {
                field: "DUET_NODE_ID",
                reason: e.to_string(),
            })?;
            self.node_id = Some(id);
        }
        if let Some(listen) = lookup("DUET_MESH_LISTEN") {
            self.mesh.get_or_insert_with(MeshConfig::default).listen_addr = listen;
        }
        if let Some(peers) = lookup("DUET_MESH_PEERS") {
            self.mesh.get_or_insert_with(MeshConfig::default).peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arbiter_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "arbiter_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        if self.metrics_window_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "metrics_window_secs",
                reason: "must be positive".into(),
            });
        }
        if let Some((a, _)) = self.pairs.pairs().iter().find(|(a, b)| a == b) {
            return Err(ConfigError::Invalid {
                field: "pairs",
                reason: format!("'{a}' cannot pair with itself"),
            });
        }
        if let Some(mesh) = &self.mesh {
            if mesh.listen_addr.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "mesh.listen_addr",
                    reason: "required when mesh is configured".into(),
                });
            }
        }
        Ok(())
    }

    pub fn arbiter_timeout(&self) -> Duration {
        Duration::from_millis(self.arbiter_timeout_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_secs)
    }

    pub fn presence_coalesce(&self) -> Duration {
        Duration::from_millis(self.presence_coalesce_ms)
    }

    pub fn metrics_sweep(&self) -> Duration {
        Duration::from_secs(self.metrics_sweep_secs.max(1))
    }

    pub fn note_timeout(&self) -> Duration {
        Duration::from_millis(self.note_timeout_ms)
    }
}
