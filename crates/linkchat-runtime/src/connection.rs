//! A single peer connection
//!
//! A [`Connection`] owns one duplex stream to one peer. Control messages are
//! framed between start and end tokens; file payloads follow a `File.Response`
//! frame as raw bytes whose length is taken from the header.
//!
//! The stream is split in two halves, each behind its own lock:
//! - the write half is the send-exclusion lock. `send_message` and
//!   `send_file` hold it for the whole operation, so text frames and file
//!   bytes never interleave on the wire.
//! - the read half is held by [`Connection::run_read_loop`] for its entire
//!   lifetime. It is the single consumer of the socket.
//!
//! Transport failures never escape this module: sends report a `bool` and the
//! read loop turns I/O errors into the terminal `Disconnected` state.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use linkchat_core::protocol::envelope::{decode_frame, Decoded};
use linkchat_core::protocol::frame::{frame, FrameBuffer};
use linkchat_core::protocol::messages::{CommonMessage, FileResponse, ProtocolMessage};
use linkchat_core::{CodecError, ConnectionConfig, FileDescriptor, FileType, PeerAddress};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::collab::{BoxedReader, BoxedStream, BoxedWriter, FileStore};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Which side opened the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Progress of the file transfer a connection is busy with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferProgress {
    pub direction: TransferDirection,
    pub descriptor: FileDescriptor,
    pub declared_size: u64,
    pub transferred: u64,
}

impl FileTransferProgress {
    fn new(direction: TransferDirection, descriptor: FileDescriptor, declared_size: u64) -> Self {
        Self {
            direction,
            descriptor,
            declared_size,
            transferred: 0,
        }
    }

    fn same_transfer(&self, other: &FileTransferProgress) -> bool {
        self.direction == other.direction && self.descriptor == other.descriptor
    }

    /// Bytes still expected, capped to `cap`
    fn remaining(&self, cap: usize) -> usize {
        let left = self.declared_size.saturating_sub(self.transferred);
        usize::try_from(left).map_or(cap, |left| left.min(cap))
    }
}

/// Connection state machine
///
/// `Listening` ⇄ `FileTransfer` → `Disconnected`. `Disconnected` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Listening,
    FileTransfer(FileTransferProgress),
    Disconnected,
}

impl ConnectionState {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }

    /// Transfer in progress, if any
    pub fn transfer(&self) -> Option<&FileTransferProgress> {
        match self {
            ConnectionState::FileTransfer(progress) => Some(progress),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Inbound Events
// ----------------------------------------------------------------------------

/// What a connection delivers to the merged inbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Message(ProtocolMessage),
    /// A file announced by `File.Response` was fully received and stored
    FileDownloaded(FileDescriptor),
    /// The peer speaks another protocol version; the connection closes shortly
    IncompatibleProtocol { mine: u32, theirs: u32 },
}

/// Inbound event tagged with its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub from: PeerAddress,
    pub kind: InboundKind,
}

/// Why a read loop stopped
enum LoopExit {
    Eof,
    Io(io::Error),
    Desync(String),
    Incompatible { mine: u32, theirs: u32 },
    InboundClosed,
    Closed,
}

// ----------------------------------------------------------------------------
// Connection
// ----------------------------------------------------------------------------

pub struct Connection {
    id: u64,
    address: PeerAddress,
    name: String,
    role: Role,
    config: ConnectionConfig,
    files: Arc<dyn FileStore>,
    reader: Mutex<ReadHalf<BoxedStream>>,
    writer: Mutex<WriteHalf<BoxedStream>>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Wrap an established stream. The connection starts in `Listening`;
    /// nothing is read until [`Connection::run_read_loop`] is spawned.
    pub fn new(
        address: PeerAddress,
        name: String,
        role: Role,
        stream: BoxedStream,
        config: ConnectionConfig,
        files: Arc<dyn FileStore>,
    ) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let (state, _) = watch::channel(ConnectionState::Listening);
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            name,
            role,
            config,
            files,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            state,
        })
    }

    /// Process-unique id, distinguishes successive connections to one peer
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Observe state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.borrow().is_disconnected()
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send one envelope as a frame. Returns `false` on any I/O failure.
    pub async fn send_message(&self, text: &str) -> bool {
        let mut writer = self.writer.lock().await;
        if self.is_disconnected() {
            debug!("Not sending to {}: connection is closed", self.address);
            return false;
        }
        match write_frame(&mut writer, text).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send message to {}: {}", self.address, e);
                false
            }
        }
    }

    /// Send a `File.Response` header immediately followed by `size` bytes
    /// read from `source`, without releasing the send lock in between.
    ///
    /// The file is streamed in `file_chunk_size` chunks with a flush after
    /// every chunk. A failure after the header went out leaves the peer
    /// waiting for bytes that will never come, so the connection is closed.
    pub async fn send_file(
        &self,
        header: &str,
        descriptor: FileDescriptor,
        mut source: BoxedReader,
        size: u64,
    ) -> bool {
        let mut writer = self.writer.lock().await;
        if self.is_disconnected() {
            return false;
        }
        if let Err(e) = write_frame(&mut writer, header).await {
            warn!("Failed to send file header to {}: {}", self.address, e);
            return false;
        }

        let mut progress = FileTransferProgress::new(TransferDirection::Sending, descriptor, size);
        self.begin_transfer(&progress);
        let result = self.stream_file(&mut writer, &mut source, &mut progress).await;
        self.end_transfer(&progress);

        match result {
            Ok(()) => {
                debug!(
                    "Sent {} ({} bytes) to {}",
                    progress.descriptor.file_name, size, self.address
                );
                true
            }
            Err(e) => {
                warn!(
                    "File transfer of {} to {} aborted after {}/{} bytes: {}",
                    progress.descriptor.file_name,
                    self.address,
                    progress.transferred,
                    size,
                    e
                );
                self.mark_disconnected();
                false
            }
        }
    }

    async fn stream_file(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        source: &mut BoxedReader,
        progress: &mut FileTransferProgress,
    ) -> io::Result<()> {
        let mut chunk = vec![0u8; self.config.file_chunk_size];
        while progress.transferred < progress.declared_size {
            if self.is_disconnected() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
            }
            let want = progress.remaining(chunk.len());
            let n = source.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "file is shorter than announced",
                ));
            }
            writer.write_all(&chunk[..n]).await?;
            writer.flush().await?;
            progress.transferred += n as u64;
            self.publish_progress(progress);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Read and decode frames until the stream ends, forwarding everything to
    /// `inbound`. Blocks when `inbound` is full.
    pub async fn run_read_loop(self: Arc<Self>, inbound: mpsc::Sender<InboundEvent>) {
        let mut reader = self.reader.lock().await;
        let mut frames = FrameBuffer::new();
        let mut chunk = vec![0u8; self.config.read_buffer_size];
        debug!("Read loop started for {}", self.address);

        let exit = self
            .read_until_closed(&mut reader, &mut frames, &mut chunk, &inbound)
            .await;

        match exit {
            LoopExit::Eof => info!("Peer {} closed the stream", self.address),
            LoopExit::Io(e) => warn!("Connection to {} failed: {}", self.address, e),
            LoopExit::Desync(tag) => error!(
                "Unknown message type {} from {}, closing connection",
                tag, self.address
            ),
            LoopExit::Incompatible { mine, theirs } => {
                warn!(
                    "Peer {} speaks protocol version {} (local {}), disconnecting",
                    self.address, theirs, mine
                );
                tokio::time::sleep(self.config.incompatible_disconnect_delay()).await;
            }
            LoopExit::InboundClosed => debug!("Inbound queue for {} closed", self.address),
            LoopExit::Closed => debug!("Read loop for {} stopped", self.address),
        }
        drop(reader);
        self.close().await;
    }

    async fn read_until_closed(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
        frames: &mut FrameBuffer,
        chunk: &mut [u8],
        inbound: &mpsc::Sender<InboundEvent>,
    ) -> LoopExit {
        loop {
            while let Some(bytes) = frames.next_frame() {
                let kind = match decode_frame(&bytes) {
                    Ok(Decoded::Message(ProtocolMessage::Common(CommonMessage::FileResponse(
                        response,
                    )))) => {
                        let descriptor = self.descriptor_for(&response);
                        match self
                            .read_file(reader, frames, chunk, descriptor.clone(), response.file_size)
                            .await
                        {
                            Ok(true) => InboundKind::FileDownloaded(descriptor),
                            Ok(false) => continue,
                            Err(e) => return LoopExit::Io(e),
                        }
                    }
                    Ok(Decoded::Message(message)) => InboundKind::Message(message),
                    Ok(Decoded::IncompatibleProtocols { mine, theirs }) => {
                        let notice = self.event(InboundKind::IncompatibleProtocol { mine, theirs });
                        let _ = inbound.send(notice).await;
                        return LoopExit::Incompatible { mine, theirs };
                    }
                    Err(CodecError::UnknownType(tag)) => return LoopExit::Desync(tag),
                    Err(e) => {
                        warn!("Dropping undecodable frame from {}: {}", self.address, e);
                        continue;
                    }
                };
                if inbound.send(self.event(kind)).await.is_err() {
                    return LoopExit::InboundClosed;
                }
            }

            if self.is_disconnected() {
                return LoopExit::Closed;
            }
            match reader.read(chunk).await {
                Ok(0) => return LoopExit::Eof,
                Ok(n) => frames.extend(&chunk[..n]),
                Err(e) => return LoopExit::Io(e),
            }
        }
    }

    /// Receive the payload announced by a `File.Response`.
    ///
    /// Bytes already buffered behind the header are written first; the rest
    /// is read straight from the socket, never past the declared size.
    /// Returns whether the file was stored. An unwritable file is still
    /// drained so the stream stays in sync.
    async fn read_file(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
        frames: &mut FrameBuffer,
        chunk: &mut [u8],
        descriptor: FileDescriptor,
        declared_size: u64,
    ) -> io::Result<bool> {
        let (mut sink, stored) = match self.files.create(&descriptor).await {
            Ok(writer) => (writer, true),
            Err(e) => {
                warn!(
                    "Cannot store {} from {}, discarding payload: {}",
                    descriptor.file_name, self.address, e
                );
                (Box::new(tokio::io::sink()) as BoxedWriter, false)
            }
        };

        let mut progress =
            FileTransferProgress::new(TransferDirection::Receiving, descriptor, declared_size);
        self.begin_transfer(&progress);
        let result = self
            .receive_file(reader, frames, chunk, &mut sink, &mut progress)
            .await;
        self.end_transfer(&progress);

        match result {
            Ok(()) => {
                debug!(
                    "Received {} ({} bytes) from {}",
                    progress.descriptor.file_name, declared_size, self.address
                );
                Ok(stored)
            }
            Err(e) => {
                if stored {
                    if let Err(discard) = self.files.discard(&progress.descriptor).await {
                        debug!("Failed to discard partial file: {}", discard);
                    }
                }
                Err(e)
            }
        }
    }

    async fn receive_file(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
        frames: &mut FrameBuffer,
        chunk: &mut [u8],
        sink: &mut BoxedWriter,
        progress: &mut FileTransferProgress,
    ) -> io::Result<()> {
        let buffered = frames.take_up_to(progress.remaining(usize::MAX));
        if !buffered.is_empty() {
            sink.write_all(&buffered).await?;
            progress.transferred += buffered.len() as u64;
            self.publish_progress(progress);
        }

        while progress.transferred < progress.declared_size {
            let want = progress.remaining(chunk.len());
            let n = reader.read(&mut chunk[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a file transfer",
                ));
            }
            sink.write_all(&chunk[..n]).await?;
            progress.transferred += n as u64;
            self.publish_progress(progress);
        }
        sink.shutdown().await
    }

    fn descriptor_for(&self, response: &FileResponse) -> FileDescriptor {
        // User pictures are always served by their owner
        let owner = (response.file_type == FileType::UserPicture).then(|| self.address.clone());
        FileDescriptor {
            file_type: response.file_type,
            chat_id: response.chat_id.clone(),
            owner,
            file_name: response.file_name.clone(),
        }
    }

    fn event(&self, kind: InboundKind) -> InboundEvent {
        InboundEvent {
            from: self.address.clone(),
            kind,
        }
    }

    // ------------------------------------------------------------------------
    // State Transitions
    // ------------------------------------------------------------------------

    fn begin_transfer(&self, progress: &FileTransferProgress) {
        self.state.send_if_modified(|state| {
            if state.is_disconnected() {
                return false;
            }
            *state = ConnectionState::FileTransfer(progress.clone());
            true
        });
    }

    fn publish_progress(&self, progress: &FileTransferProgress) {
        self.state.send_if_modified(|state| match state {
            ConnectionState::FileTransfer(current) if current.same_transfer(progress) => {
                *current = progress.clone();
                true
            }
            _ => false,
        });
    }

    fn end_transfer(&self, progress: &FileTransferProgress) {
        self.state.send_if_modified(|state| match state {
            ConnectionState::FileTransfer(current) if current.same_transfer(progress) => {
                *state = ConnectionState::Listening;
                true
            }
            _ => false,
        });
    }

    /// Enter the terminal state. Returns `false` if it was already entered.
    fn mark_disconnected(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_disconnected() {
                return false;
            }
            *state = ConnectionState::Disconnected;
            true
        })
    }

    /// Close the connection and shut the write side of the stream down
    pub async fn close(&self) {
        if self.mark_disconnected() {
            debug!("Closing connection to {}", self.address);
        }
        match tokio::time::timeout(self.config.disconnect_grace(), self.writer.lock()).await {
            Ok(mut writer) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Shutdown of stream to {} failed: {}", self.address, e);
                }
            }
            Err(_) => debug!("Send lock of {} still held, not shutting down", self.address),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("role", &self.role)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

async fn write_frame(writer: &mut WriteHalf<BoxedStream>, text: &str) -> io::Result<()> {
    writer.write_all(&frame(text)).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFileStore;
    use linkchat_core::protocol::envelope::{encode, encode_parts};
    use linkchat_core::protocol::messages::{GroupMessage, UserInfoRequest};
    use linkchat_core::LinkchatConfig;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn config() -> ConnectionConfig {
        LinkchatConfig::fast().connection
    }

    fn connection(address: &str, stream: DuplexStream) -> Arc<Connection> {
        Connection::new(
            PeerAddress::new(address),
            address.to_string(),
            Role::Client,
            Box::new(stream),
            config(),
            Arc::new(MemoryFileStore::new()),
        )
    }

    async fn wait_disconnected(connection: &Connection) {
        let mut states = connection.subscribe_state();
        tokio::time::timeout(Duration::from_secs(2), states.wait_for(|s| s.is_disconnected()))
            .await
            .expect("connection did not close")
            .unwrap();
    }

    fn user_info_request() -> ProtocolMessage {
        ProtocolMessage::Group(GroupMessage::UserInfoRequest(UserInfoRequest::default()))
    }

    #[tokio::test]
    async fn test_message_reaches_peer() {
        let (left, right) = tokio::io::duplex(1024);
        let a = connection("b", left);
        let b = connection("a", right);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(b.clone().run_read_loop(tx));

        let text = encode(&user_info_request()).unwrap();
        assert!(a.send_message(&text).await);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.from, PeerAddress::new("a"));
        assert_eq!(event.kind, InboundKind::Message(user_info_request()));
        assert_eq!(b.state(), ConnectionState::Listening);
    }

    #[tokio::test]
    async fn test_incompatible_version_reports_then_disconnects() {
        let (mut raw, right) = tokio::io::duplex(1024);
        let b = connection("a", right);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(b.clone().run_read_loop(tx));

        raw.write_all(&frame("9|Group.Unheard.Of|{not json")).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            InboundKind::IncompatibleProtocol { mine: 1, theirs: 9 }
        );
        wait_disconnected(&b).await;
    }

    #[tokio::test]
    async fn test_unknown_type_is_fatal() {
        let (mut raw, right) = tokio::io::duplex(1024);
        let b = connection("a", right);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(b.clone().run_read_loop(tx));

        raw.write_all(&frame(&encode_parts("Group.Unheard.Of", "{}")))
            .await
            .unwrap();
        wait_disconnected(&b).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_bad_payload_is_skipped() {
        let (mut raw, right) = tokio::io::duplex(1024);
        let b = connection("a", right);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(b.clone().run_read_loop(tx));

        raw.write_all(&frame(&encode_parts("Group.FileReady", "{}")))
            .await
            .unwrap();
        raw.write_all(&frame(&encode(&user_info_request()).unwrap()))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, InboundKind::Message(user_info_request()));
    }

    #[tokio::test]
    async fn test_eof_disconnects_and_send_fails() {
        let (raw, right) = tokio::io::duplex(1024);
        let b = connection("a", right);
        let (tx, _rx) = mpsc::channel(8);
        tokio::spawn(b.clone().run_read_loop(tx));

        drop(raw);
        wait_disconnected(&b).await;
        assert!(!b.send_message("1|x|{}").await);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (_raw, right) = tokio::io::duplex(1024);
        let b = connection("a", right);
        b.close().await;
        assert!(b.is_disconnected());
        b.close().await;
        assert_eq!(b.state(), ConnectionState::Disconnected);
    }
}
