//! linkchat Runtime Engine
//!
//! This crate contains the async side of linkchat:
//! - `Connection`: one framed duplex stream to one peer, interleaving control
//!   messages and raw file payloads
//! - `ConnectionManager`: the peer registry, aggregated connection state and
//!   the merged inbound stream
//! - the handshake, group, private and file delegates implementing the chat
//!   synchronization protocol
//! - `Engine`: the orchestrator running all of the above
//!
//! `linkchat-core` provides the wire format and data model; the collaborator
//! traits in [`collab`] are the seams to storage and the physical link.

pub mod collab;
pub mod connection;
pub mod delegates;
pub mod engine;
pub mod manager;
pub mod memory;

pub use collab::{
    BoxedReader, BoxedStream, BoxedWriter, ChatStore, DeviceLink, FileStore, LinkStream,
    PairedDevice, Session, StaticSession, StoreEvent,
};
pub use connection::{
    Connection, ConnectionState, FileTransferProgress, InboundEvent, InboundKind, Role,
    TransferDirection,
};
pub use delegates::{
    DelegateContext, Dispatcher, FileDelegate, GroupDelegate, HandshakeDelegate, InvitePolicy,
    PrivateDelegate,
};
pub use engine::{Collaborators, Engine};
pub use manager::{ConnectionManager, ConnectionSnapshot, ManagerSnapshot, PeerState};
pub use memory::{MemoryChatStore, MemoryFileStore, MemoryLink, MemoryNetwork};

// Re-export core types for convenience
pub use linkchat_core::{LinkchatConfig, LinkchatError, LinkchatResult, PeerAddress};
