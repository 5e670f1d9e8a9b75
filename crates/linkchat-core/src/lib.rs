//! linkchat Core Protocol Implementation
//!
//! This crate provides the foundational types, change-detection digests, the
//! envelope codec and stream framing for the linkchat peer-to-peer chat
//! protocol. It performs no I/O; the async engine lives in `linkchat-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod digest;
pub mod errors;
pub mod model;
pub mod protocol;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{ConnectionConfig, LinkchatConfig, SyncConfig};
pub use digest::{chat_hash, user_hash, Digest, GroupChatHashInfo};
pub use errors::{CodecError, LinkchatError, LinkchatResult, Result, StoreError, TransportError};
pub use model::{
    Chat, FileDescriptor, FileType, GroupChat, GroupUpdateType, Message, MessageBody,
    MessageContent, PrivateChat, User,
};
pub use protocol::{Decoded, ProtocolMessage};
pub use types::{ChatId, MessageId, PeerAddress, Timestamp};
