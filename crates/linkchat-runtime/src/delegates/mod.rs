//! Protocol delegates
//!
//! Each delegate owns one slice of the protocol:
//! - [`HandshakeDelegate`] runs the per-connection digest exchange
//! - [`GroupDelegate`] implements host-mediated group chats
//! - [`PrivateDelegate`] implements two-party chats
//! - [`FileDelegate`] serves and fetches pictures and attachments
//!
//! The [`Dispatcher`] is the single consumer of the manager's merged inbound
//! stream and routes every event by message category. Handler failures are
//! logged and dropped; the next reconciliation round repairs whatever state
//! they left behind.

pub mod file;
pub mod group;
pub mod handshake;
pub mod private;

use std::sync::Arc;

use linkchat_core::protocol::messages::CommonMessage;
use linkchat_core::{LinkchatResult, PeerAddress, ProtocolMessage, SyncConfig, User};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::collab::{ChatStore, FileStore, Session};
use crate::connection::{InboundEvent, InboundKind};
use crate::manager::ConnectionManager;

pub use file::FileDelegate;
pub use group::GroupDelegate;
pub use handshake::HandshakeDelegate;
pub use private::PrivateDelegate;

// ----------------------------------------------------------------------------
// Shared Context
// ----------------------------------------------------------------------------

/// Whether incoming invitations are accepted without asking
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvitePolicy {
    pub auto_accept: bool,
}

impl InvitePolicy {
    /// Accept every invitation
    pub fn accept_all() -> Self {
        Self { auto_accept: true }
    }

    /// Queue invitations until the user answers them
    pub fn manual() -> Self {
        Self { auto_accept: false }
    }
}

/// Collaborators every delegate works with
#[derive(Clone)]
pub struct DelegateContext {
    pub manager: ConnectionManager,
    pub store: Arc<dyn ChatStore>,
    pub files: Arc<dyn FileStore>,
    pub session: Arc<dyn Session>,
    pub config: SyncConfig,
}

impl DelegateContext {
    pub fn local_address(&self) -> PeerAddress {
        self.session.local_address()
    }

    /// Local profile, falling back to a bare profile named after the address
    pub async fn local_user(&self) -> LinkchatResult<User> {
        let address = self.local_address();
        Ok(self
            .store
            .user(&address)
            .await?
            .unwrap_or_else(|| User::new(address.clone(), address.to_string())))
    }

    /// Send one message to one peer
    pub async fn send<M: Into<ProtocolMessage>>(&self, to: &PeerAddress, message: M) -> bool {
        self.manager.send_to(to, &message.into()).await
    }

    /// Send one message to several peers, returning how many sends succeeded
    pub async fn send_all<M: Into<ProtocolMessage>>(
        &self,
        to: &[PeerAddress],
        message: M,
    ) -> usize {
        if to.is_empty() {
            return 0;
        }
        self.manager.send(&message.into(), to).await
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

/// Routes inbound events to the delegates
#[derive(Clone)]
pub struct Dispatcher {
    handshake: HandshakeDelegate,
    group: GroupDelegate,
    private: PrivateDelegate,
    files: FileDelegate,
}

impl Dispatcher {
    pub fn new(
        handshake: HandshakeDelegate,
        group: GroupDelegate,
        private: PrivateDelegate,
        files: FileDelegate,
    ) -> Self {
        Self {
            handshake,
            group,
            private,
            files,
        }
    }

    /// Consume the inbound stream in arrival order until it closes
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = inbound.recv().await {
            self.dispatch(event).await;
        }
        debug!("Inbound stream closed, dispatcher stopped");
    }

    /// Handle one inbound event
    pub async fn dispatch(&self, event: InboundEvent) {
        let InboundEvent { from, kind } = event;
        let result = match kind {
            InboundKind::Message(message) => {
                let tag = message.type_tag();
                debug!("Dispatching {} from {}", tag, from);
                self.dispatch_message(&from, message)
                    .await
                    .map_err(|e| (tag, e))
            }
            InboundKind::FileDownloaded(descriptor) => {
                self.files.handle_downloaded(&from, descriptor);
                Ok(())
            }
            InboundKind::IncompatibleProtocol { mine, theirs } => {
                warn!(
                    "Peer {} uses protocol version {}, this device speaks {}",
                    from, theirs, mine
                );
                Ok(())
            }
        };

        if let Err((tag, e)) = result {
            warn!("Failed to handle {} from {}: {}", tag, from, e);
        }
    }

    async fn dispatch_message(
        &self,
        from: &PeerAddress,
        message: ProtocolMessage,
    ) -> LinkchatResult<()> {
        match message {
            ProtocolMessage::Common(common) => match common {
                CommonMessage::InitConnectionRequest(request) => {
                    self.handshake.handle_request(from, request).await
                }
                CommonMessage::InitConnectionResponse(response) => {
                    self.handshake.handle_response(from, response).await
                }
                CommonMessage::FileRequest(request) => self.files.handle_request(from, request).await,
                // Consumed by the connection together with its payload
                CommonMessage::FileResponse(_) => Ok(()),
            },
            ProtocolMessage::Group(group) => self.group.handle(from, group).await,
            ProtocolMessage::Private(private) => self.private.handle(from, private).await,
        }
    }
}
