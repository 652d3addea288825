//! Configuration for the relay
//!
//! Every section has defaults matching the firmware this relay stands in
//! for, so an empty or missing file is a valid configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::DEFAULT_SERVER_PORT;
use crate::error::{Error, Result};

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub delivery: DeliveryConfig,
    pub control: ControlConfig,
}

/// Audio server and socket settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Track requested from the server, if any
    pub track: Option<String>,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Fail the session if no byte arrives for this long
    pub idle_timeout_ms: u64,
    /// Socket read timeout; cancellation is checked this often
    pub poll_interval_ms: u64,
    pub recv_buffer_size: usize,
    /// Limit for status line plus headers
    pub head_limit: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SERVER_PORT,
            track: None,
            connect_timeout_ms: 10_000,
            send_timeout_ms: 5_000,
            idle_timeout_ms: 5_000,
            poll_interval_ms: 100,
            recv_buffer_size: 2048,
            head_limit: 8 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// How ingestion hands payload to the delivery side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandOff {
    /// Straight into the ring transport
    #[default]
    Ring,
    /// Packed into pool blocks, unpacked into the ring by a forwarding thread
    Blocks,
}

/// Ring transport and block pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ring_capacity: usize,
    pub hand_off: HandOff,
    /// Pool sizing, used when `hand_off = "blocks"`
    pub block_count: usize,
    pub block_size: usize,
    /// Deadline for one blocking write into the ring
    pub write_deadline_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 4096,
            hand_off: HandOff::Ring,
            block_count: 4,
            block_size: 2048,
            write_deadline_ms: 100,
        }
    }
}

impl TransportConfig {
    pub fn write_deadline(&self) -> Duration {
        Duration::from_millis(self.write_deadline_ms)
    }
}

/// Notification pacing and backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub min_interval_ms: u64,
    /// Safe payload when no larger MTU is confirmed (ATT MTU 23 - 3)
    pub chunk_floor: usize,
    /// Largest payload ever sent (ATT MTU 247 - 3)
    pub chunk_ceiling: usize,
    /// Linear backoff step for the first overflow failures
    pub overflow_step_ms: u64,
    /// Failures handled with linear backoff before the cooldown
    pub overflow_linear_tiers: u32,
    pub overflow_cooldown_ms: u64,
    /// First wait while the peer is not subscribed
    pub idle_wait_min_ms: u64,
    pub idle_wait_max_ms: u64,
    /// Wait on the ring for payload before re-checking state
    pub read_deadline_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 50,
            chunk_floor: 20,
            chunk_ceiling: 244,
            overflow_step_ms: 200,
            overflow_linear_tiers: 2,
            overflow_cooldown_ms: 2000,
            idle_wait_min_ms: 200,
            idle_wait_max_ms: 1000,
            read_deadline_ms: 100,
        }
    }
}

impl DeliveryConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_millis(self.read_deadline_ms)
    }
}

/// Control channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub queue_depth: usize,
    pub event_queue_depth: usize,
    /// Volume before any VOLUME command (0..=100)
    pub initial_volume: u8,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            event_queue_depth: 64,
            initial_volume: 80,
        }
    }
}

impl AppConfig {
    /// Platform config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "relay", "ble-audio-relay")
            .map(|dirs| dirs.config_dir().join("relay.toml"))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` (or the platform default), falling back to defaults
    /// when the file does not exist
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => path,
            None => return Ok(Self::default()),
        };

        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        tracing::info!("Loading config from {}", path.display());
        Self::load(&path)
    }

    /// Write as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.transport.ring_capacity == 0 {
            return fail("transport.ring_capacity must be non-zero");
        }
        if self.transport.block_count == 0 || self.transport.block_size == 0 {
            return fail("transport.block_count and transport.block_size must be non-zero");
        }
        if self.delivery.chunk_floor == 0 || self.delivery.chunk_floor > self.delivery.chunk_ceiling {
            return fail("delivery.chunk_floor must be in 1..=chunk_ceiling");
        }
        if self.delivery.idle_wait_min_ms == 0 || self.delivery.idle_wait_min_ms > self.delivery.idle_wait_max_ms {
            return fail("delivery.idle_wait_min_ms must be in 1..=idle_wait_max_ms");
        }
        if self.control.queue_depth == 0 || self.control.event_queue_depth == 0 {
            return fail("control queue depths must be non-zero");
        }
        if self.control.initial_volume > 100 {
            return fail("control.initial_volume must be at most 100");
        }
        if self.network.recv_buffer_size == 0 {
            return fail("network.recv_buffer_size must be non-zero");
        }
        Ok(())
    }
}
