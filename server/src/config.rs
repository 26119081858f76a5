//! Server configuration
//!
//! Every field has a default so a JSON config file only needs to name the
//! values it changes. Command line flags are applied on top in `main`.

use serde::{Deserialize, Serialize};
use shared::{ChunkFraming, DEFAULT_PARALLELISM, DEFAULT_PORT, TICKS_PER_SECOND};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// What to do with a packet that has no handler in the connection's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownPacketPolicy {
    /// Disconnect the peer with an internal-error reason
    #[default]
    Disconnect,
    /// Log a warning and drop the packet
    Drop,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Primary channel port; parallel channel `i` listens on `port + 1 + i`.
    /// Zero binds every channel to an ephemeral port.
    pub port: u16,
    /// Sub-connections per client, primary included
    pub parallelism: usize,
    pub tick_rate: u32,
    /// Ticks between time control broadcasts
    pub time_sync_interval: i32,
    /// Ticks between keepalive broadcasts and timeout sweeps
    pub keep_alive_interval: i32,
    pub id_block_size: i32,
    /// Id blocks one connection may request over its lifetime
    pub max_id_blocks_per_player: u32,
    pub max_players: usize,
    pub max_username_len: usize,
    pub host_username: Option<String>,
    pub default_faction_id: i32,
    pub unknown_packet_policy: UnknownPacketPolicy,
    /// World transfers at least this large are striped over the parallel
    /// channels; every other packet uses the primary channel
    pub striping_threshold: usize,
    pub peer_timeout_secs: u64,
    pub chunk_framing: ChunkFraming,
    pub save_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            parallelism: DEFAULT_PARALLELISM,
            tick_rate: TICKS_PER_SECOND,
            time_sync_interval: 3,
            keep_alive_interval: 180,
            id_block_size: 30000,
            max_id_blocks_per_player: 1024,
            max_players: 16,
            max_username_len: 20,
            host_username: None,
            default_faction_id: 1,
            unknown_packet_policy: UnknownPacketPolicy::Disconnect,
            striping_threshold: 64 * 1024,
            peer_timeout_secs: 30,
            chunk_framing: ChunkFraming::Tagged,
            save_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 || self.parallel_channels() > shared::multiplex::MAX_PARALLEL_CHANNELS
        {
            return Err(ConfigError::Invalid(format!(
                "parallelism must be between 1 and {}, got {}",
                shared::multiplex::MAX_PARALLEL_CHANNELS + 1,
                self.parallelism
            )));
        }
        if self.port != 0 && (self.port as usize) + self.parallel_channels() > u16::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "port range {}..={} does not fit",
                self.port,
                self.port as usize + self.parallel_channels()
            )));
        }
        if self.tick_rate == 0 {
            return Err(ConfigError::Invalid("tick rate must be positive".to_string()));
        }
        if self.time_sync_interval <= 0 || self.keep_alive_interval <= 0 {
            return Err(ConfigError::Invalid(
                "broadcast intervals must be positive".to_string(),
            ));
        }
        if self.id_block_size <= 0 {
            return Err(ConfigError::Invalid("id block size must be positive".to_string()));
        }
        Ok(())
    }

    /// Parallel channels per client, the primary channel excluded
    pub fn parallel_channels(&self) -> usize {
        self.parallelism.saturating_sub(1)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }
}
