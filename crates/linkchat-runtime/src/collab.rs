//! Collaborator interfaces consumed by the engine
//!
//! The engine never touches a radio, a database or a file system directly.
//! Device discovery and stream setup, chat persistence, local file storage
//! and the local identity are provided by the embedding application through
//! the traits below. In-memory implementations live in [`crate::memory`].

use async_trait::async_trait;
use linkchat_core::{
    Chat, ChatId, FileDescriptor, GroupChat, LinkchatResult, Message, MessageId, PeerAddress,
    User,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

// ----------------------------------------------------------------------------
// Streams
// ----------------------------------------------------------------------------

/// A reliable, ordered, bidirectional byte stream to one peer
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn LinkStream>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ----------------------------------------------------------------------------
// Device Link
// ----------------------------------------------------------------------------

/// A device paired with the local one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub address: PeerAddress,
    pub name: String,
}

/// Device discovery and stream establishment (the RFCOMM socket layer)
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Enumerate paired devices
    async fn paired_devices(&self) -> LinkchatResult<Vec<PairedDevice>>;

    /// Open a client-role stream to `address`
    async fn connect(&self, address: &PeerAddress) -> LinkchatResult<BoxedStream>;

    /// Wait for the next server-role stream
    async fn accept(&self) -> LinkchatResult<(PeerAddress, BoxedStream)>;

    /// Human readable name of a device, if known
    fn display_name(&self, address: &PeerAddress) -> Option<String>;
}

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

/// Change notifications published by a [`ChatStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    UserSaved(PeerAddress),
    ChatSaved(ChatId),
    ChatDeleted(ChatId),
    MessageSaved {
        chat_id: ChatId,
        message_id: MessageId,
    },
}

/// Chat persistence
///
/// Message histories are append-only and kept in insertion order.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn user(&self, address: &PeerAddress) -> LinkchatResult<Option<User>>;

    async fn save_user(&self, user: User) -> LinkchatResult<()>;

    async fn chat(&self, id: &ChatId) -> LinkchatResult<Option<Chat>>;

    async fn save_chat(&self, chat: Chat) -> LinkchatResult<()>;

    /// Remove a chat and its history
    async fn delete_chat(&self, id: &ChatId) -> LinkchatResult<()>;

    async fn chats(&self) -> LinkchatResult<Vec<Chat>>;

    /// Full history of a chat, oldest first
    async fn messages(&self, chat_id: &ChatId) -> LinkchatResult<Vec<Message>>;

    /// Append a message unless one with the same id is already stored.
    /// Returns whether the message was new.
    async fn save_message(&self, message: Message) -> LinkchatResult<bool>;

    /// Messages stored after `after`, at most the `limit` most recent ones.
    /// The whole history is considered when `after` is `None` or unknown.
    async fn messages_after(
        &self,
        chat_id: &ChatId,
        after: Option<&MessageId>,
        limit: usize,
    ) -> LinkchatResult<Vec<Message>>;

    /// Drop the history of a chat, keeping the chat itself
    async fn delete_messages(&self, chat_id: &ChatId) -> LinkchatResult<()>;

    /// Observe changes
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Group chat by id
    async fn group_chat(&self, id: &ChatId) -> LinkchatResult<Option<GroupChat>> {
        Ok(self.chat(id).await?.and_then(Chat::into_group))
    }

    /// Every stored group chat
    async fn group_chats(&self) -> LinkchatResult<Vec<GroupChat>> {
        Ok(self
            .chats()
            .await?
            .into_iter()
            .filter_map(Chat::into_group)
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Local Files
// ----------------------------------------------------------------------------

/// Local storage for pictures and attachments
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Size of a stored file, `None` when absent
    async fn size(&self, descriptor: &FileDescriptor) -> LinkchatResult<Option<u64>>;

    /// Open a stored file for streaming
    async fn open(&self, descriptor: &FileDescriptor) -> LinkchatResult<Option<(BoxedReader, u64)>>;

    /// Create (or truncate) a file. The content is complete once the writer
    /// has been shut down.
    async fn create(&self, descriptor: &FileDescriptor) -> LinkchatResult<BoxedWriter>;

    /// Remove a file, used to drop partial downloads
    async fn discard(&self, descriptor: &FileDescriptor) -> LinkchatResult<()>;

    async fn exists(&self, descriptor: &FileDescriptor) -> bool {
        matches!(self.size(descriptor).await, Ok(Some(_)))
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// Local identity
pub trait Session: Send + Sync {
    /// Address of this device
    fn local_address(&self) -> PeerAddress;

    /// Whether `address` refers to this device
    fn is_me(&self, address: &PeerAddress) -> bool {
        &self.local_address() == address
    }
}

/// Session with a fixed address
#[derive(Debug, Clone)]
pub struct StaticSession {
    address: PeerAddress,
}

impl StaticSession {
    pub fn new(address: PeerAddress) -> Self {
        Self { address }
    }
}

impl Session for StaticSession {
    fn local_address(&self) -> PeerAddress {
        self.address.clone()
    }
}
