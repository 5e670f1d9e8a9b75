//! Identifier newtypes for the linkchat protocol
//!
//! Addresses and ids travel as plain JSON strings; the newtypes keep them from
//! being mixed up inside the engine.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::errors::{CodecError, LinkchatError};

// ----------------------------------------------------------------------------
// Peer Address
// ----------------------------------------------------------------------------

/// Stable identifier of a remote device on the wireless link
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Create an address from its textual form
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self(address.into())
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = LinkchatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CodecError::MalformedEnvelope {
                reason: "empty peer address".to_string(),
            }
            .into());
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for PeerAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

// ----------------------------------------------------------------------------
// Chat Identifier
// ----------------------------------------------------------------------------

const PRIVATE_CHAT_PREFIX: &str = "private:";

/// Identifier of a chat
///
/// Group chats use a random uuid chosen by the host. Private chats are keyed by
/// the other party's address, so the same conversation has a different id on
/// each device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    /// Generate a new random group chat id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Id of the private chat with `peer`
    pub fn private(peer: &PeerAddress) -> Self {
        Self(format!("{PRIVATE_CHAT_PREFIX}{peer}"))
    }

    /// Create from string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Peer address of a private chat id
    pub fn private_peer(&self) -> Option<PeerAddress> {
        self.0.strip_prefix(PRIVATE_CHAT_PREFIX).map(PeerAddress::new)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Globally unique message id, assigned by the author
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a new random message id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create from string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from milliseconds
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Get milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_chat_id_round_trips_peer() {
        let peer = PeerAddress::new("00:11:22:33:44:55");
        let id = ChatId::private(&peer);
        assert_eq!(id.private_peer(), Some(peer));
        assert_eq!(ChatId::generate().private_peer(), None);
    }

    #[test]
    fn test_peer_address_parse_rejects_blank() {
        assert!("   ".parse::<PeerAddress>().is_err());
        assert_eq!(
            " AA:BB ".parse::<PeerAddress>().unwrap(),
            PeerAddress::new("AA:BB")
        );
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let json = serde_json::to_string(&MessageId::from("m1")).unwrap();
        assert_eq!(json, "\"m1\"");
    }
}
