//! linkchat Engine
//!
//! Wires the connection manager and the protocol delegates together and runs
//! the background tasks:
//! - the dispatcher, single consumer of the merged inbound stream
//! - the handshake runner, which starts a handshake on every new connection
//! - optionally the listener accepting server streams
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use linkchat_core::{LinkchatConfig, PeerAddress};
//! use linkchat_runtime::{Collaborators, Engine, MemoryChatStore, MemoryFileStore, MemoryNetwork, StaticSession};
//!
//! # #[tokio::main]
//! # async fn main() -> linkchat_core::LinkchatResult<()> {
//! let network = MemoryNetwork::new();
//! let address = PeerAddress::new("device-a");
//! let mut engine = Engine::start(
//!     LinkchatConfig::default(),
//!     Collaborators {
//!         link: Arc::new(network.link(address.clone(), "Device A")),
//!         store: Arc::new(MemoryChatStore::new()),
//!         files: Arc::new(MemoryFileStore::new()),
//!         session: Arc::new(StaticSession::new(address)),
//!     },
//! )?;
//! engine.listen();
//! engine.connect(&PeerAddress::new("device-b")).await;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use linkchat_core::{LinkchatConfig, LinkchatError, LinkchatResult, PeerAddress};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collab::{ChatStore, DeviceLink, FileStore, Session};
use crate::delegates::{
    DelegateContext, Dispatcher, FileDelegate, GroupDelegate, HandshakeDelegate, InvitePolicy,
    PrivateDelegate,
};
use crate::manager::ConnectionManager;

/// External collaborators the engine runs against
#[derive(Clone)]
pub struct Collaborators {
    pub link: Arc<dyn DeviceLink>,
    pub store: Arc<dyn ChatStore>,
    pub files: Arc<dyn FileStore>,
    pub session: Arc<dyn Session>,
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

/// Running connection and protocol engine of one device
pub struct Engine {
    config: LinkchatConfig,
    link: Arc<dyn DeviceLink>,
    store: Arc<dyn ChatStore>,
    manager: ConnectionManager,
    handshake: HandshakeDelegate,
    group: GroupDelegate,
    private: PrivateDelegate,
    files: FileDelegate,
    /// Dispatcher task handle
    dispatcher_handle: Option<JoinHandle<()>>,
    /// Handshake runner task handle
    handshake_handle: Option<JoinHandle<()>>,
    /// Listener task handle, present once `listen` was called
    listener_handle: Option<JoinHandle<LinkchatResult<()>>>,
}

impl Engine {
    /// Start an engine that queues invitations until they are answered.
    /// Must be called from within a tokio runtime.
    pub fn start(config: LinkchatConfig, collaborators: Collaborators) -> LinkchatResult<Self> {
        Self::start_with_policy(config, collaborators, InvitePolicy::manual())
    }

    /// Start an engine with an explicit invitation policy
    pub fn start_with_policy(
        config: LinkchatConfig,
        collaborators: Collaborators,
        policy: InvitePolicy,
    ) -> LinkchatResult<Self> {
        config.validate()?;
        let Collaborators {
            link,
            store,
            files: file_store,
            session,
        } = collaborators;

        let local = session.local_address();
        let manager = ConnectionManager::new(
            local.clone(),
            Arc::clone(&link),
            Arc::clone(&file_store),
            config.connection.clone(),
        );
        let inbound = manager
            .take_inbound()
            .ok_or_else(|| LinkchatError::channel_error("inbound stream already taken"))?;

        let ctx = DelegateContext {
            manager: manager.clone(),
            store: Arc::clone(&store),
            files: file_store,
            session,
            config: config.sync.clone(),
        };
        let files = FileDelegate::new(ctx.clone());
        let group = GroupDelegate::new(ctx.clone(), files.clone(), policy);
        let private = PrivateDelegate::new(ctx.clone(), files.clone(), policy);
        let handshake = HandshakeDelegate::new(ctx, group.clone(), files.clone());

        // Subscribe before anything can connect
        let new_connections = manager.subscribe_new_connections();
        let handshake_handle = tokio::spawn(run_handshakes(new_connections, handshake.clone()));
        let dispatcher = Dispatcher::new(
            handshake.clone(),
            group.clone(),
            private.clone(),
            files.clone(),
        );
        let dispatcher_handle = tokio::spawn(dispatcher.run(inbound));

        info!("linkchat engine started for {}", local);
        Ok(Self {
            config,
            link,
            store,
            manager,
            handshake,
            group,
            private,
            files,
            dispatcher_handle: Some(dispatcher_handle),
            handshake_handle: Some(handshake_handle),
            listener_handle: None,
        })
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Start accepting connection requests in the background
    pub fn listen(&mut self) {
        if self
            .listener_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            debug!("Already listening");
            return;
        }
        let manager = self.manager.clone();
        self.listener_handle = Some(tokio::spawn(async move {
            let result = manager
                .listen_for_connection_requests(|address| {
                    info!("Accepted connection from {}", address);
                })
                .await;
            if let Err(e) = &result {
                warn!("Stopped listening: {}", e);
            }
            result
        }));
    }

    /// Whether the listener is running
    pub fn is_listening(&self) -> bool {
        self.listener_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Connect to a peer as client
    pub async fn connect(&self, address: &PeerAddress) -> bool {
        self.manager.connect_to_as_client(address).await
    }

    /// Connect to every paired device not connected yet. Returns how many
    /// connections were opened.
    pub async fn connect_to_paired(&self) -> LinkchatResult<usize> {
        let mut opened = 0;
        for device in self.link.paired_devices().await? {
            if self.manager.is_connected(&device.address) {
                continue;
            }
            if self.manager.connect_to_as_client(&device.address).await {
                opened += 1;
            }
        }
        Ok(opened)
    }

    pub async fn disconnect(&self, address: &PeerAddress) -> bool {
        self.manager.disconnect(address).await
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn local_address(&self) -> &PeerAddress {
        self.manager.local_address()
    }

    pub fn config(&self) -> &LinkchatConfig {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn handshake(&self) -> &HandshakeDelegate {
        &self.handshake
    }

    pub fn group(&self) -> &GroupDelegate {
        &self.group
    }

    pub fn private(&self) -> &PrivateDelegate {
        &self.private
    }

    pub fn files(&self) -> &FileDelegate {
        &self.files
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop listening, close every connection and stop the background tasks
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
        }
        self.manager.disconnect_all().await;
        self.abort_tasks();
        info!("linkchat engine for {} stopped", self.local_address());
    }

    fn abort_tasks(&mut self) {
        for handle in [self.dispatcher_handle.take(), self.handshake_handle.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Run the handshake on every new connection
async fn run_handshakes(
    mut new_connections: broadcast::Receiver<PeerAddress>,
    handshake: HandshakeDelegate,
) {
    loop {
        match new_connections.recv().await {
            Ok(peer) => match handshake.initiate(&peer).await {
                Ok(true) => debug!("Sent handshake to {}", peer),
                Ok(false) => warn!("Could not send handshake to {}", peer),
                Err(e) => warn!("Failed to build handshake for {}: {}", peer, e),
            },
            Err(RecvError::Lagged(missed)) => {
                warn!("Missed handshakes for {} new connections", missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
