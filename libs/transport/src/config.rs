//! Transport Configuration
//!
//! TOML-loadable settings for the cross-context socket channel and the
//! optional peer-discovery channel. Defaults are usable out of the box; a
//! config file only needs to override what differs.

use crate::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for all transport channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Unix socket path for the cross-context channel
    pub socket_path: PathBuf,
    /// Buffer size for reading frames
    pub buffer_size: usize,
    /// Maximum size of a single frame
    pub max_message_size: usize,
    /// Client connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Default deadline for correlated requests in milliseconds
    pub request_timeout_ms: u64,
    /// Peer-discovery channel settings
    pub discovery: DiscoveryConfig,
}

/// Peer-discovery channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Whether to start the discovery channel at all
    pub enabled: bool,
    /// UDP port announcements are sent and received on
    pub port: u16,
    /// Interval between announcements in milliseconds
    pub announce_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/courier.sock"),
            buffer_size: 64 * 1024,             // 64KB
            max_message_size: 16 * 1024 * 1024, // 16MB
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 7979,
            announce_interval_ms: 2_000,
        }
    }
}

impl TransportConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TransportError::configuration(
                format!("Failed to read config file {:?}: {}", path.as_ref(), e),
                None,
            )
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| TransportError::configuration(format!("Invalid config: {}", e), None))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field combinations
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(TransportError::configuration(
                "buffer_size must be non-zero",
                Some("buffer_size"),
            ));
        }
        if self.max_message_size < self.buffer_size {
            return Err(TransportError::configuration(
                "max_message_size must be at least buffer_size",
                Some("max_message_size"),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(TransportError::configuration(
                "request_timeout_ms must be non-zero",
                Some("request_timeout_ms"),
            ));
        }
        if self.discovery.enabled && self.discovery.port == 0 {
            return Err(TransportError::configuration(
                "discovery.port must be non-zero when discovery is enabled",
                Some("discovery.port"),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }
}
