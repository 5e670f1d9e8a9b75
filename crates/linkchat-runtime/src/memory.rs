//! In-memory collaborators
//!
//! Used by the integration tests and by local simulations. The chat store
//! keeps everything in `DashMap`s and publishes changes on a broadcast
//! channel; the device link connects endpoints through `tokio::io::duplex`.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use linkchat_core::{
    Chat, ChatId, FileDescriptor, LinkchatError, LinkchatResult, Message, MessageId,
    PeerAddress, User,
};
use tokio::io::{AsyncWrite, DuplexStream};
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::collab::{
    BoxedReader, BoxedStream, BoxedWriter, ChatStore, DeviceLink, FileStore, PairedDevice,
    StoreEvent,
};

// ----------------------------------------------------------------------------
// Chat Store
// ----------------------------------------------------------------------------

/// Chat persistence held in memory
#[derive(Debug)]
pub struct MemoryChatStore {
    users: DashMap<PeerAddress, User>,
    chats: DashMap<ChatId, Chat>,
    messages: DashMap<ChatId, Vec<Message>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            users: DashMap::new(),
            chats: DashMap::new(),
            messages: DashMap::new(),
            events,
        }
    }

    fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemoryChatStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn user(&self, address: &PeerAddress) -> LinkchatResult<Option<User>> {
        Ok(self.users.get(address).map(|user| user.value().clone()))
    }

    async fn save_user(&self, user: User) -> LinkchatResult<()> {
        let address = user.address.clone();
        self.users.insert(address.clone(), user);
        self.publish(StoreEvent::UserSaved(address));
        Ok(())
    }

    async fn chat(&self, id: &ChatId) -> LinkchatResult<Option<Chat>> {
        Ok(self.chats.get(id).map(|chat| chat.value().clone()))
    }

    async fn save_chat(&self, chat: Chat) -> LinkchatResult<()> {
        let id = chat.id();
        self.chats.insert(id.clone(), chat);
        self.publish(StoreEvent::ChatSaved(id));
        Ok(())
    }

    async fn delete_chat(&self, id: &ChatId) -> LinkchatResult<()> {
        self.chats.remove(id);
        self.messages.remove(id);
        self.publish(StoreEvent::ChatDeleted(id.clone()));
        Ok(())
    }

    async fn chats(&self) -> LinkchatResult<Vec<Chat>> {
        Ok(self.chats.iter().map(|chat| chat.value().clone()).collect())
    }

    async fn messages(&self, chat_id: &ChatId) -> LinkchatResult<Vec<Message>> {
        Ok(self
            .messages
            .get(chat_id)
            .map(|history| history.value().clone())
            .unwrap_or_default())
    }

    async fn save_message(&self, message: Message) -> LinkchatResult<bool> {
        let chat_id = message.chat_id.clone();
        let message_id = message.id.clone();
        {
            let mut history = self.messages.entry(chat_id.clone()).or_default();
            if history.iter().any(|stored| stored.id == message_id) {
                return Ok(false);
            }
            history.push(message);
        }
        self.publish(StoreEvent::MessageSaved {
            chat_id,
            message_id,
        });
        Ok(true)
    }

    async fn messages_after(
        &self,
        chat_id: &ChatId,
        after: Option<&MessageId>,
        limit: usize,
    ) -> LinkchatResult<Vec<Message>> {
        let history = self.messages(chat_id).await?;
        let start = after
            .and_then(|id| history.iter().position(|message| &message.id == id))
            .map(|index| index + 1)
            .unwrap_or(0);
        let tail = &history[start..];
        let skip = tail.len().saturating_sub(limit);
        Ok(tail[skip..].to_vec())
    }

    async fn delete_messages(&self, chat_id: &ChatId) -> LinkchatResult<()> {
        self.messages.remove(chat_id);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

// ----------------------------------------------------------------------------
// File Store
// ----------------------------------------------------------------------------

/// File storage held in memory, keyed by relative path
#[derive(Debug, Clone, Default)]
pub struct MemoryFileStore {
    files: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a file directly
    pub fn insert(&self, descriptor: &FileDescriptor, bytes: Vec<u8>) {
        self.files.insert(descriptor.relative_path(), bytes);
    }

    /// Content of a stored file
    pub fn contents(&self, descriptor: &FileDescriptor) -> Option<Vec<u8>> {
        self.files
            .get(&descriptor.relative_path())
            .map(|bytes| bytes.value().clone())
    }
}

/// Buffers written bytes and commits them on shutdown
struct MemoryFileWriter {
    key: String,
    buf: Option<Vec<u8>>,
    files: Arc<DashMap<String, Vec<u8>>>,
}

impl AsyncWrite for MemoryFileWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().buf.as_mut() {
            Some(buf) => {
                buf.extend_from_slice(data);
                Poll::Ready(Ok(data.len()))
            }
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "file already committed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(buf) = this.buf.take() {
            this.files.insert(this.key.clone(), buf);
        }
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn size(&self, descriptor: &FileDescriptor) -> LinkchatResult<Option<u64>> {
        Ok(self
            .files
            .get(&descriptor.relative_path())
            .map(|bytes| bytes.len() as u64))
    }

    async fn open(
        &self,
        descriptor: &FileDescriptor,
    ) -> LinkchatResult<Option<(BoxedReader, u64)>> {
        Ok(self.contents(descriptor).map(|bytes| {
            let size = bytes.len() as u64;
            (Box::new(io::Cursor::new(bytes)) as BoxedReader, size)
        }))
    }

    async fn create(&self, descriptor: &FileDescriptor) -> LinkchatResult<BoxedWriter> {
        Ok(Box::new(MemoryFileWriter {
            key: descriptor.relative_path(),
            buf: Some(Vec::new()),
            files: Arc::clone(&self.files),
        }))
    }

    async fn discard(&self, descriptor: &FileDescriptor) -> LinkchatResult<()> {
        self.files.remove(&descriptor.relative_path());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Device Link
// ----------------------------------------------------------------------------

type Incoming = (PeerAddress, DuplexStream);

/// A set of in-process devices that can open streams to each other
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    endpoints: DashMap<PeerAddress, mpsc::Sender<Incoming>>,
    names: DashMap<PeerAddress, String>,
    buffer_size: usize,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_buffer_size(64 * 1024)
    }

    /// Network whose streams buffer at most `buffer_size` bytes per direction
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                names: DashMap::new(),
                buffer_size,
            }),
        }
    }

    /// Attach a device to the network
    pub fn link<S: Into<String>>(&self, address: PeerAddress, name: S) -> MemoryLink {
        let (tx, rx) = mpsc::channel(16);
        self.inner.endpoints.insert(address.clone(), tx);
        self.inner.names.insert(address.clone(), name.into());
        MemoryLink {
            address,
            network: self.clone(),
            incoming: Mutex::new(rx),
        }
    }

    /// Make a device unreachable for new connections
    pub fn unplug(&self, address: &PeerAddress) {
        self.inner.endpoints.remove(address);
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One device on a [`MemoryNetwork`]
pub struct MemoryLink {
    address: PeerAddress,
    network: MemoryNetwork,
    incoming: Mutex<mpsc::Receiver<Incoming>>,
}

impl MemoryLink {
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }
}

#[async_trait]
impl DeviceLink for MemoryLink {
    async fn paired_devices(&self) -> LinkchatResult<Vec<PairedDevice>> {
        Ok(self
            .network
            .inner
            .names
            .iter()
            .filter(|entry| entry.key() != &self.address)
            .map(|entry| PairedDevice {
                address: entry.key().clone(),
                name: entry.value().clone(),
            })
            .collect())
    }

    async fn connect(&self, address: &PeerAddress) -> LinkchatResult<BoxedStream> {
        let sender = self
            .network
            .inner
            .endpoints
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LinkchatError::connection_failed(address.as_str(), "device not reachable"))?;

        let (client, server) = tokio::io::duplex(self.network.inner.buffer_size);
        sender
            .send((self.address.clone(), server))
            .await
            .map_err(|_| LinkchatError::connection_failed(address.as_str(), "device stopped listening"))?;
        Ok(Box::new(client))
    }

    async fn accept(&self) -> LinkchatResult<(PeerAddress, BoxedStream)> {
        let mut incoming = self.incoming.lock().await;
        incoming
            .recv()
            .await
            .map(|(address, stream)| (address, Box::new(stream) as BoxedStream))
            .ok_or_else(|| LinkchatError::channel_error("memory link closed"))
    }

    fn display_name(&self, address: &PeerAddress) -> Option<String> {
        self.network
            .inner
            .names
            .get(address)
            .map(|name| name.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkchat_core::{GroupChat, MessageContent};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn message(chat_id: &ChatId, id: &str) -> Message {
        let mut message = Message::plain(
            chat_id.clone(),
            PeerAddress::new("a"),
            vec![MessageContent::text(id)],
            None,
        );
        message.id = MessageId::from(id);
        message
    }

    #[tokio::test]
    async fn test_save_message_ignores_duplicates() {
        let store = MemoryChatStore::new();
        let chat_id = ChatId::from("c");
        let mut events = store.subscribe();

        assert!(store.save_message(message(&chat_id, "m1")).await.unwrap());
        assert!(!store.save_message(message(&chat_id, "m1")).await.unwrap());
        assert_eq!(store.messages(&chat_id).await.unwrap().len(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::MessageSaved { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_messages_after_is_bounded() {
        let store = MemoryChatStore::new();
        let chat_id = ChatId::from("c");
        for id in ["m1", "m2", "m3", "m4"] {
            store.save_message(message(&chat_id, id)).await.unwrap();
        }

        let ids = |messages: Vec<Message>| -> Vec<String> {
            messages.into_iter().map(|m| m.id.to_string()).collect()
        };
        let after = MessageId::from("m1");
        assert_eq!(
            ids(store.messages_after(&chat_id, Some(&after), 10).await.unwrap()),
            vec!["m2", "m3", "m4"]
        );
        assert_eq!(
            ids(store.messages_after(&chat_id, Some(&after), 2).await.unwrap()),
            vec!["m3", "m4"]
        );
        let unknown = MessageId::from("zz");
        assert_eq!(
            store.messages_after(&chat_id, Some(&unknown), 10).await.unwrap().len(),
            4
        );
        assert!(store
            .messages_after(&chat_id, Some(&MessageId::from("m4")), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_group_chat_lookup() {
        let store = MemoryChatStore::new();
        let chat = GroupChat::new(PeerAddress::new("host"), "team");
        store.save_chat(Chat::Group(chat.clone())).await.unwrap();
        assert_eq!(store.group_chat(&chat.id).await.unwrap(), Some(chat));
        assert_eq!(store.group_chats().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_is_visible_after_shutdown_only() {
        let files = MemoryFileStore::new();
        let descriptor = FileDescriptor::attachment(ChatId::from("c"), "a.bin");

        let mut writer = files.create(&descriptor).await.unwrap();
        writer.write_all(b"hello").await.unwrap();
        assert!(!files.exists(&descriptor).await);
        writer.shutdown().await.unwrap();
        assert_eq!(files.size(&descriptor).await.unwrap(), Some(5));

        let (mut reader, size) = files.open(&descriptor).await.unwrap().unwrap();
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await.unwrap();
        assert_eq!((content.as_slice(), size), (b"hello".as_slice(), 5));

        tokio_test::assert_ok!(files.discard(&descriptor).await);
        assert!(!files.exists(&descriptor).await);
    }

    #[tokio::test]
    async fn test_memory_link_connects_peers() {
        let network = MemoryNetwork::new();
        let a = network.link(PeerAddress::new("a"), "Alice");
        let b = network.link(PeerAddress::new("b"), "Bob");

        let mut client = a.connect(&PeerAddress::new("b")).await.unwrap();
        let (from, mut server) = b.accept().await.unwrap();
        assert_eq!(from, PeerAddress::new("a"));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(a.display_name(&PeerAddress::new("b")), Some("Bob".into()));
        assert_eq!(a.paired_devices().await.unwrap().len(), 1);

        network.unplug(&PeerAddress::new("b"));
        assert!(a.connect(&PeerAddress::new("b")).await.is_err());
    }
}
