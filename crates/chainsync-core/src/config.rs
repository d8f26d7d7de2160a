//! Cluster node configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ChainError, Result};
use crate::stripe::StripeRange;

/// Deployment partition. Nodes ignore peers outside their own environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Stage,
    Prod,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Dev
    }
}

/// One peer this node should dial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,
    pub port: u16,
    pub server_id: String,
}

impl PeerConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Unique identifier for this node.
    pub node_id: String,
    /// Host name used to find (or register) the self record in the node
    /// directory.
    pub host_name: String,
    pub bind_address: String,
    pub port: u16,
    pub environment: Environment,
    pub peers: Vec<PeerConfig>,
    /// Global minimum id; stripe ranges live at or above this.
    pub id_offset: u64,
    /// Per-scope stripe ranges owned by this node.
    pub stripes: HashMap<String, Vec<StripeRange>>,
    /// Also persist the chain to a local file.
    pub sync_file_mode: bool,
    pub log_path: PathBuf,
    pub fsync_every_n_records: usize,
    pub connect_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Outbound queue cap per connection; a peer that falls further behind
    /// is dropped.
    pub max_send_queue_bytes: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", fastrand::u64(..)),
            host_name: String::new(),
            bind_address: "0.0.0.0".to_string(),
            port: 12020,
            environment: Environment::Dev,
            peers: Vec::new(),
            id_offset: 0,
            stripes: HashMap::new(),
            sync_file_mode: false,
            log_path: PathBuf::from("./chainsync.log"),
            fsync_every_n_records: 128,
            connect_timeout_ms: 5_000,
            reconnect_backoff_ms: 500,
            reconnect_backoff_max_ms: 30_000,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 20_000,
            max_send_queue_bytes: 8 * 1024 * 1024,
        }
    }
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: ClusterConfig = serde_json::from_slice(&bytes)
            .map_err(|e| ChainError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(ChainError::Config("node_id must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ChainError::Config("port must be > 0".to_string()));
        }
        if self.fsync_every_n_records == 0 {
            return Err(ChainError::Config(
                "fsync_every_n_records must be > 0".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ChainError::Config(
                "connect_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ChainError::Config(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        for (scope, ranges) in &self.stripes {
            for r in ranges {
                if r.start > r.end {
                    return Err(ChainError::Config(format!(
                        "scope '{scope}' has inverted range {}..{}",
                        r.start, r.end
                    )));
                }
                if r.start < self.id_offset {
                    return Err(ChainError::Config(format!(
                        "scope '{scope}' range starts below id_offset {}",
                        self.id_offset
                    )));
                }
            }
        }
        Ok(())
    }
}
