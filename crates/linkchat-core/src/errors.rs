//! Error types for the linkchat protocol
//!
//! Codec, transport and persistence failures each have their own enum and are
//! unified under [`LinkchatError`]. A protocol version mismatch is not an
//! error: it is reported as a decode outcome so callers can disconnect on
//! their own schedule.

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Failures while turning wire text into protocol messages and back
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid payload for {type_tag}: {source}")]
    InvalidPayload {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Stream and peer level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to peer {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },
    #[error("Network I/O error: {0}")]
    NetworkIo(#[from] std::io::Error),
    #[error("Peer not connected: {peer}")]
    NotConnected { peer: String },
    #[error("Send failed to peer {peer}")]
    SendFailed { peer: String },
}

/// Persistence collaborator failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Chat not found: {chat_id}")]
    ChatNotFound { chat_id: String },
    #[error("User not found: {address}")]
    UserNotFound { address: String },
    #[error("Storage backend error: {reason}")]
    Backend { reason: String },
}

// ----------------------------------------------------------------------------
// Unified Error
// ----------------------------------------------------------------------------

/// Core error type for the linkchat protocol
#[derive(Debug, thiserror::Error)]
pub enum LinkchatError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal channel closed or full
    #[error("Channel error: {message}")]
    Channel { message: String },

    /// Configuration error
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Operation not permitted for the local role (e.g. a non-host mutating a group)
    #[error("Not permitted: {reason}")]
    NotPermitted { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl LinkchatError {
    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        LinkchatError::Channel {
            message: message.into(),
        }
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        LinkchatError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a not-permitted error with a reason
    pub fn not_permitted<T: Into<String>>(reason: T) -> Self {
        LinkchatError::NotPermitted {
            reason: reason.into(),
        }
    }

    /// Create a chat not found error
    pub fn chat_not_found<T: Into<String>>(chat_id: T) -> Self {
        LinkchatError::Store(StoreError::ChatNotFound {
            chat_id: chat_id.into(),
        })
    }

    /// Create a storage backend error
    pub fn store_error<T: Into<String>>(reason: T) -> Self {
        LinkchatError::Store(StoreError::Backend {
            reason: reason.into(),
        })
    }

    /// Create a not connected error
    pub fn not_connected<P: Into<String>>(peer: P) -> Self {
        LinkchatError::Transport(TransportError::NotConnected { peer: peer.into() })
    }

    /// Create a transport connection failed error
    pub fn connection_failed<P: Into<String>, R: Into<String>>(peer: P, reason: R) -> Self {
        LinkchatError::Transport(TransportError::ConnectionFailed {
            peer: peer.into(),
            reason: reason.into(),
        })
    }
}

impl From<std::io::Error> for LinkchatError {
    fn from(err: std::io::Error) -> Self {
        LinkchatError::Transport(TransportError::NetworkIo(err))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, LinkchatError>;
pub type LinkchatResult<T> = Result<T>;
