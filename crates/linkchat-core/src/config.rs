//! Centralized Configuration Management
//!
//! Tunables of the connection engine and the synchronization protocol. All
//! structures deserialize with defaults for missing fields so partial TOML
//! files work.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{LinkchatError, Result};

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Per-connection stream settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Size of each chunk when streaming a file
    pub file_chunk_size: usize,
    /// Size of a single socket read
    pub read_buffer_size: usize,
    /// Capacity of the merged inbound queue; the read loop blocks when it is full
    pub inbound_buffer_size: usize,
    /// Delay between a connection dropping and its removal from the registry
    pub disconnect_grace_ms: u64,
    /// Delay before closing a connection that speaks another protocol version
    pub incompatible_disconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            file_chunk_size: 2048,
            read_buffer_size: 4096,
            inbound_buffer_size: 1024,
            disconnect_grace_ms: 1000,
            incompatible_disconnect_delay_ms: 1000,
        }
    }
}

impl ConnectionConfig {
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn incompatible_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.incompatible_disconnect_delay_ms)
    }
}

// ----------------------------------------------------------------------------
// Sync Configuration
// ----------------------------------------------------------------------------

/// Group and private chat synchronization settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of messages in a handshake history delta
    pub history_delta_limit: usize,
    /// Delay before announcing attachment availability to group members
    pub file_ready_delay_ms: u64,
    /// Fetch missing chat and user pictures after metadata changes
    pub fetch_pictures: bool,
    /// How long a host waits for an attachment it re-downloads before relaying
    pub download_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_delta_limit: 100,
            file_ready_delay_ms: 500,
            fetch_pictures: true,
            download_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn file_ready_delay(&self) -> Duration {
        Duration::from_millis(self.file_ready_delay_ms)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_millis(self.download_timeout_ms)
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkchatConfig {
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
}

impl LinkchatConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with short delays, for tests and local simulations
    pub fn fast() -> Self {
        Self::default()
            .with_disconnect_grace(Duration::from_millis(50))
            .with_incompatible_disconnect_delay(Duration::from_millis(50))
            .with_file_ready_delay(Duration::from_millis(20))
    }

    /// Set the file streaming chunk size
    pub fn with_file_chunk_size(mut self, size: usize) -> Self {
        self.connection.file_chunk_size = size;
        self
    }

    /// Set the socket read size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.connection.read_buffer_size = size;
        self
    }

    /// Set the post-disconnect grace delay
    pub fn with_disconnect_grace(mut self, grace: Duration) -> Self {
        self.connection.disconnect_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set the delay before dropping a peer with another protocol version
    pub fn with_incompatible_disconnect_delay(mut self, delay: Duration) -> Self {
        self.connection.incompatible_disconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the handshake history delta bound
    pub fn with_history_delta_limit(mut self, limit: usize) -> Self {
        self.sync.history_delta_limit = limit;
        self
    }

    /// Set the delay before announcing attachments
    pub fn with_file_ready_delay(mut self, delay: Duration) -> Self {
        self.sync.file_ready_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.connection.file_chunk_size == 0 {
            return Err(LinkchatError::config_error("file_chunk_size must be positive"));
        }
        if self.connection.read_buffer_size == 0 {
            return Err(LinkchatError::config_error("read_buffer_size must be positive"));
        }
        if self.connection.inbound_buffer_size == 0 {
            return Err(LinkchatError::config_error(
                "inbound_buffer_size must be positive",
            ));
        }
        if self.sync.history_delta_limit == 0 {
            return Err(LinkchatError::config_error(
                "history_delta_limit must be positive",
            ));
        }
        Ok(())
    }
}
