//! File transfer delegate
//!
//! Files are fetched lazily: a `File.Request` goes out only when a referenced
//! picture or attachment is missing locally, and at most one request per file
//! is in flight. Serving a request hands the file to the owning connection,
//! which writes the `File.Response` header and the bytes under one send lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use linkchat_core::protocol::envelope::encode;
use linkchat_core::protocol::messages::{CommonMessage, FileRequest, FileResponse};
use linkchat_core::{
    Chat, ChatId, FileDescriptor, FileType, GroupChat, LinkchatResult, Message, PeerAddress,
    ProtocolMessage, User,
};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::connection::FileTransferProgress;
use crate::delegates::DelegateContext;
use crate::manager::ManagerSnapshot;

// ----------------------------------------------------------------------------
// Download Queries
// ----------------------------------------------------------------------------

/// Downloads in progress for files of a chat
pub fn chat_downloads(snapshot: &ManagerSnapshot, chat_id: &ChatId) -> Vec<FileTransferProgress> {
    snapshot
        .receiving()
        .filter(|(_, progress)| progress.descriptor.chat_id.as_ref() == Some(chat_id))
        .map(|(_, progress)| progress.clone())
        .collect()
}

/// Downloads in progress for pictures of a user
pub fn user_downloads(
    snapshot: &ManagerSnapshot,
    address: &PeerAddress,
) -> Vec<FileTransferProgress> {
    snapshot
        .receiving()
        .filter(|(_, progress)| progress.descriptor.owner.as_ref() == Some(address))
        .map(|(_, progress)| progress.clone())
        .collect()
}

// ----------------------------------------------------------------------------
// File Delegate
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct FileDelegate {
    inner: Arc<FileInner>,
}

struct FileInner {
    ctx: DelegateContext,
    /// Requested files and the peer asked for them
    in_flight: DashMap<FileDescriptor, PeerAddress>,
    downloaded: broadcast::Sender<FileDescriptor>,
}

impl FileDelegate {
    pub fn new(ctx: DelegateContext) -> Self {
        let (downloaded, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(FileInner {
                ctx,
                in_flight: DashMap::new(),
                downloaded,
            }),
        }
    }

    /// Ask `from` for a file unless it is present or already being fetched.
    /// Returns whether a request was sent.
    pub async fn request(&self, descriptor: FileDescriptor, from: &PeerAddress) -> bool {
        let ctx = &self.inner.ctx;
        if ctx.files.exists(&descriptor).await {
            return false;
        }

        match self.inner.in_flight.entry(descriptor.clone()) {
            Entry::Occupied(mut pending) => {
                // A request to a peer that went away will never be answered
                if ctx.manager.is_connected(pending.get()) {
                    debug!("{} already requested", descriptor.file_name);
                    return false;
                }
                pending.insert(from.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(from.clone());
            }
        }

        let request = FileRequest {
            file_type: descriptor.file_type,
            chat_id: descriptor.chat_id.clone(),
            file_name: descriptor.file_name.clone(),
        };
        let sent = ctx.send(from, CommonMessage::FileRequest(request)).await;
        if sent {
            debug!("Requested {} from {}", descriptor.file_name, from);
        } else {
            self.inner.in_flight.remove(&descriptor);
        }
        sent
    }

    /// Make sure a file is available locally, fetching it from `from` and
    /// waiting up to `timeout` if needed
    pub async fn ensure_local(
        &self,
        descriptor: FileDescriptor,
        from: &PeerAddress,
        timeout: Duration,
    ) -> bool {
        let files = &self.inner.ctx.files;
        if files.exists(&descriptor).await {
            return true;
        }

        let mut downloads = self.inner.downloaded.subscribe();
        self.request(descriptor.clone(), from).await;
        let wait = async {
            loop {
                match downloads.recv().await {
                    Ok(done) if done == descriptor => return true,
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if files.exists(&descriptor).await {
                            return true;
                        }
                    }
                    Err(RecvError::Closed) => return false,
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Whether a request for the file is outstanding
    pub fn is_requested(&self, descriptor: &FileDescriptor) -> bool {
        self.inner.in_flight.contains_key(descriptor)
    }

    /// Observe completed downloads
    pub fn subscribe_downloaded(&self) -> broadcast::Receiver<FileDescriptor> {
        self.inner.downloaded.subscribe()
    }

    /// Downloads in progress for files of a chat
    pub fn downloads_in_chat(&self, chat_id: &ChatId) -> Vec<FileTransferProgress> {
        chat_downloads(&self.inner.ctx.manager.snapshot(), chat_id)
    }

    /// Downloads in progress for pictures of a user
    pub fn downloads_for_user(&self, address: &PeerAddress) -> Vec<FileTransferProgress> {
        user_downloads(&self.inner.ctx.manager.snapshot(), address)
    }

    // ------------------------------------------------------------------------
    // Lazy Fetching
    // ------------------------------------------------------------------------

    /// Fetch a user's picture from its owner if it is missing
    pub async fn fetch_user_picture(&self, user: &User) {
        if !self.inner.ctx.config.fetch_pictures {
            return;
        }
        if let Some(picture) = &user.picture {
            let descriptor = FileDescriptor::user_picture(user.address.clone(), picture.clone());
            self.request(descriptor, &user.address).await;
        }
    }

    /// Fetch a group chat's picture from its host if it is missing
    pub async fn fetch_chat_picture(&self, chat: &GroupChat) {
        if !self.inner.ctx.config.fetch_pictures {
            return;
        }
        if let Some(picture) = &chat.picture {
            let descriptor = FileDescriptor::chat_picture(chat.id.clone(), picture.clone());
            self.request(descriptor, &chat.host_address).await;
        }
    }

    /// Fetch the missing attachments of a message from `from`
    pub async fn fetch_attachments(&self, message: &Message, from: &PeerAddress) {
        for file_name in message.attachments() {
            let descriptor = FileDescriptor::attachment(message.chat_id.clone(), file_name);
            self.request(descriptor, from).await;
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Serve a `File.Request`. Missing files and files the requester may not
    /// see are ignored without an answer.
    pub async fn handle_request(
        &self,
        from: &PeerAddress,
        request: FileRequest,
    ) -> LinkchatResult<()> {
        let ctx = &self.inner.ctx;
        let descriptor = self.local_descriptor(from, &request);
        if !self.may_access(from, &descriptor).await? {
            warn!("{} requested {} without access", from, descriptor.file_name);
            return Ok(());
        }
        let Some((reader, size)) = ctx.files.open(&descriptor).await? else {
            debug!("{} requested missing file {}", from, descriptor.file_name);
            return Ok(());
        };
        let Some(connection) = ctx.manager.connection(from).await else {
            return Ok(());
        };

        let header = encode(&ProtocolMessage::Common(CommonMessage::FileResponse(
            FileResponse {
                file_type: request.file_type,
                chat_id: request.chat_id,
                file_name: request.file_name,
                file_size: size,
            },
        )))?;
        // Streaming may take a while; keep the dispatcher free
        tokio::spawn(async move {
            connection.send_file(&header, descriptor, reader, size).await;
        });
        Ok(())
    }

    /// A requested file arrived
    pub fn handle_downloaded(&self, from: &PeerAddress, descriptor: FileDescriptor) {
        debug!("Downloaded {} from {}", descriptor.file_name, from);
        self.inner.in_flight.remove(&descriptor);
        // Nobody waiting is fine
        let _ = self.inner.downloaded.send(descriptor);
    }

    /// Translate a request into the local descriptor of the file.
    /// Private chat ids are relative to each device, so the requester's id is
    /// replaced by the local id of the chat with the requester.
    fn local_descriptor(&self, from: &PeerAddress, request: &FileRequest) -> FileDescriptor {
        match request.file_type {
            FileType::UserPicture => {
                FileDescriptor::user_picture(self.inner.ctx.local_address(), request.file_name.clone())
            }
            file_type => FileDescriptor {
                file_type,
                chat_id: request.chat_id.as_ref().map(|chat_id| {
                    if chat_id.private_peer().is_some() {
                        ChatId::private(from)
                    } else {
                        chat_id.clone()
                    }
                }),
                owner: None,
                file_name: request.file_name.clone(),
            },
        }
    }

    async fn may_access(
        &self,
        from: &PeerAddress,
        descriptor: &FileDescriptor,
    ) -> LinkchatResult<bool> {
        if descriptor.file_type == FileType::UserPicture {
            return Ok(true);
        }
        let Some(chat_id) = &descriptor.chat_id else {
            return Ok(false);
        };
        Ok(match self.inner.ctx.store.chat(chat_id).await? {
            Some(Chat::Private(chat)) => &chat.user == from,
            Some(Chat::Group(chat)) => chat.is_member(from),
            None => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::StaticSession;
    use crate::connection::{ConnectionState, Role, TransferDirection};
    use crate::manager::{ConnectionManager, ConnectionSnapshot};
    use crate::memory::{MemoryChatStore, MemoryFileStore, MemoryNetwork};
    use linkchat_core::protocol::frame::frame;
    use linkchat_core::LinkchatConfig;
    use tokio::io::AsyncWriteExt;

    fn delegate(network: &MemoryNetwork, address: &str) -> FileDelegate {
        let local = PeerAddress::new(address);
        let config = LinkchatConfig::fast();
        let files = Arc::new(MemoryFileStore::new());
        let manager = ConnectionManager::new(
            local.clone(),
            Arc::new(network.link(local.clone(), address)),
            files.clone(),
            config.connection.clone(),
        );
        FileDelegate::new(DelegateContext {
            manager,
            store: Arc::new(MemoryChatStore::new()),
            files,
            session: Arc::new(StaticSession::new(local)),
            config: config.sync,
        })
    }

    fn receiving(descriptor: FileDescriptor) -> ConnectionSnapshot {
        ConnectionSnapshot {
            connection_id: 1,
            name: "peer".into(),
            state: ConnectionState::FileTransfer(FileTransferProgress {
                direction: TransferDirection::Receiving,
                descriptor,
                declared_size: 10,
                transferred: 4,
            }),
        }
    }

    #[test]
    fn test_download_queries_filter_by_scope() {
        let chat_id = ChatId::from("c1");
        let mut snapshot = ManagerSnapshot::default();
        snapshot.connections.insert(
            PeerAddress::new("host"),
            receiving(FileDescriptor::attachment(chat_id.clone(), "a.png")),
        );
        snapshot.connections.insert(
            PeerAddress::new("friend"),
            receiving(FileDescriptor::user_picture(PeerAddress::new("friend"), "me.png")),
        );

        let in_chat = chat_downloads(&snapshot, &chat_id);
        assert_eq!(in_chat.len(), 1);
        assert_eq!(in_chat[0].transferred, 4);
        assert!(chat_downloads(&snapshot, &ChatId::from("other")).is_empty());

        let for_user = user_downloads(&snapshot, &PeerAddress::new("friend"));
        assert_eq!(for_user.len(), 1);
        assert_eq!(for_user[0].descriptor.file_name, "me.png");
    }

    #[tokio::test]
    async fn test_request_tracks_download_until_it_completes() {
        let network = MemoryNetwork::new();
        let files = delegate(&network, "me");
        let peer = PeerAddress::new("peer");
        let chat_id = ChatId::from("c1");
        let descriptor = FileDescriptor::attachment(chat_id.clone(), "a.png");

        let (mut remote, local_end) = tokio::io::duplex(4096);
        let manager = files.inner.ctx.manager.clone();
        assert!(manager.register(peer.clone(), Role::Server, Box::new(local_end)).await);

        assert!(!files.is_requested(&descriptor));
        assert!(files.request(descriptor.clone(), &peer).await);
        assert!(files.is_requested(&descriptor));
        // Still outstanding with a live peer
        assert!(!files.request(descriptor.clone(), &peer).await);

        // Half of the payload arrives
        let header = encode(&ProtocolMessage::Common(CommonMessage::FileResponse(
            FileResponse {
                file_type: FileType::Attachment,
                chat_id: Some(chat_id.clone()),
                file_name: "a.png".to_string(),
                file_size: 8,
            },
        )))
        .unwrap();
        let mut wire = frame(&header);
        wire.extend_from_slice(b"half");
        remote.write_all(&wire).await.unwrap();

        let mut states = manager.subscribe_states();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|snapshot| {
                chat_downloads(snapshot, &chat_id)
                    .first()
                    .is_some_and(|progress| progress.transferred == 4)
            }),
        )
        .await
        .unwrap()
        .unwrap();
        let in_chat = files.downloads_in_chat(&chat_id);
        assert_eq!(in_chat.len(), 1);
        assert_eq!(in_chat[0].declared_size, 8);
        assert!(files.downloads_for_user(&peer).is_empty());

        let mut downloaded = files.subscribe_downloaded();
        files.handle_downloaded(&peer, descriptor.clone());
        assert!(!files.is_requested(&descriptor));
        assert_eq!(downloaded.recv().await.unwrap(), descriptor);
    }
}
