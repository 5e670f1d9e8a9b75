//! linkchat CLI Configuration Management
//!
//! Configuration is read from a TOML file. Every section falls back to its
//! defaults, so a file only needs the values it changes:
//!
//! ```toml
//! auto_accept_invites = false
//!
//! [identity]
//! address = "laptop"
//! name = "Alice"
//!
//! [network]
//! listen = "0.0.0.0:7420"
//!
//! [[network.peers]]
//! address = "desktop"
//! socket = "192.168.1.20:7420"
//! name = "Bob's desktop"
//!
//! [engine.sync]
//! fetch_pictures = true
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use linkchat_core::{LinkchatConfig, PeerAddress, User};
use serde::{Deserialize, Serialize};

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Application Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the linkchat CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding received pictures and attachments
    pub data_dir: Option<PathBuf>,
    /// Join chats as soon as an invitation arrives
    pub auto_accept_invites: bool,
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    /// Engine tunables
    pub engine: LinkchatConfig,
}

/// Local identity announced to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable address of this device
    pub address: String,
    /// Display name of the local user
    pub name: String,
    /// Profile picture, a file name in the data directory's folder for the local user
    pub picture: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            address: "linkchat-local".to_string(),
            name: "anonymous".to_string(),
            picture: None,
        }
    }
}

/// Socket settings standing in for the pairing database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address accepting incoming streams
    pub listen: SocketAddr,
    /// Known devices
    pub peers: Vec<PeerConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7420)),
            peers: Vec::new(),
        }
    }
}

/// A paired device reachable over TCP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub address: String,
    pub socket: SocketAddr,
    #[serde(default)]
    pub name: Option<String>,
}

impl PeerConfig {
    pub fn peer_address(&self) -> PeerAddress {
        PeerAddress::new(self.address.as_str())
    }

    /// Name shown for this device, its address when unnamed
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.address.clone())
    }
}

impl AppConfig {
    /// Load and validate a configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.identity.address.trim().is_empty() {
            return Err(CliError::Config("Identity address must not be empty".to_string()));
        }
        if self.identity.name.trim().is_empty() {
            return Err(CliError::Config("Display name must not be empty".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.network.peers {
            if peer.address == self.identity.address {
                return Err(CliError::Config(format!(
                    "Peer {} uses the local address",
                    peer.address
                )));
            }
            if !seen.insert(peer.address.as_str()) {
                return Err(CliError::Config(format!(
                    "Peer {} is configured twice",
                    peer.address
                )));
            }
        }

        self.engine.validate()?;
        Ok(())
    }

    pub fn local_address(&self) -> PeerAddress {
        PeerAddress::new(self.identity.address.as_str())
    }

    /// Profile of the local user
    pub fn local_user(&self) -> User {
        let user = User::new(self.local_address(), self.identity.name.as_str());
        match &self.identity.picture {
            Some(picture) => user.with_picture(picture.as_str()),
            None => user,
        }
    }

    /// Directory for received files, defaulting to the platform data directory
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("linkchat")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.data_dir().ends_with("linkchat"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("linkchat.toml");
        std::fs::write(
            &path,
            r#"
[identity]
address = "laptop"
name = "Alice"

[[network.peers]]
address = "desktop"
socket = "127.0.0.1:7421"

[engine.connection]
file_chunk_size = 4096
"#,
        )
        .unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.local_address(), PeerAddress::new("laptop"));
        assert_eq!(config.network.peers[0].display_name(), "desktop");
        assert_eq!(config.engine.connection.file_chunk_size, 4096);
        assert_eq!(
            config.engine.connection.read_buffer_size,
            LinkchatConfig::default().connection.read_buffer_size
        );
        assert_eq!(config.engine.sync, LinkchatConfig::default().sync);
        assert_eq!(config.local_user().picture, None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("linkchat.toml");
        let mut config = AppConfig::default();
        config.identity.name = "Bob".to_string();
        config.auto_accept_invites = true;
        config.data_dir = Some(dir.path().join("files"));

        config.save_to_file(&path).unwrap();
        assert_eq!(AppConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_names_path_and_cause() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        match AppConfig::load_from_file(&path) {
            Err(CliError::Config(message)) => {
                assert!(message.contains("absent.toml"));
                // The io cause follows the context
                assert!(message.contains(": "));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_rejects_duplicate_and_self_peers() {
        let mut config = AppConfig::default();
        let peer = PeerConfig {
            address: "desktop".to_string(),
            socket: "127.0.0.1:7421".parse().unwrap(),
            name: None,
        };
        config.network.peers = vec![peer.clone(), peer];
        assert!(matches!(config.validate(), Err(CliError::Config(_))));

        config.network.peers = vec![PeerConfig {
            address: config.identity.address.clone(),
            socket: "127.0.0.1:7421".parse().unwrap(),
            name: None,
        }];
        assert!(config.validate().is_err());
    }
}
