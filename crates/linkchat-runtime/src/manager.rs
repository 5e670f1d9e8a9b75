//! Connection Manager
//!
//! The manager is the single owner of the `address -> Connection` registry.
//! Every registry mutation happens under one lock; observers read a
//! copy-on-write [`ManagerSnapshot`] published through a `watch` channel, so
//! deriving views never holds the registry lock.
//!
//! Each registered connection gets two tasks: its read loop, feeding the
//! merged inbound queue, and a state forwarder that pushes the connection's
//! state changes into the snapshot. Once a connection reaches
//! `Disconnected`, the forwarder waits for the grace delay, removes the entry
//! and cancels the read loop.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use futures::future::join_all;
use linkchat_core::protocol::envelope::encode;
use linkchat_core::{ConnectionConfig, LinkchatResult, PeerAddress, ProtocolMessage};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::collab::{BoxedStream, DeviceLink, FileStore};
use crate::connection::{
    Connection, ConnectionState, FileTransferProgress, InboundEvent, Role, TransferDirection,
};

// ----------------------------------------------------------------------------
// Aggregated State
// ----------------------------------------------------------------------------

/// Connection status of a peer as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// Published view of one registered connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub connection_id: u64,
    pub name: String,
    pub state: ConnectionState,
}

/// Published view of the whole registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub connections: BTreeMap<PeerAddress, ConnectionSnapshot>,
    /// Client connections being opened
    pub connecting: BTreeSet<PeerAddress>,
}

impl ManagerSnapshot {
    pub fn peer_state(&self, address: &PeerAddress) -> PeerState {
        match self.connections.get(address) {
            Some(entry) if !entry.state.is_disconnected() => PeerState::Connected,
            _ if self.connecting.contains(address) => PeerState::Connecting,
            _ => PeerState::Disconnected,
        }
    }

    pub fn connected_addresses(&self) -> Vec<PeerAddress> {
        self.connections
            .iter()
            .filter(|(_, entry)| !entry.state.is_disconnected())
            .map(|(address, _)| address.clone())
            .collect()
    }

    pub fn connected_names(&self) -> Vec<String> {
        self.connections
            .values()
            .filter(|entry| !entry.state.is_disconnected())
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Incoming file transfers in progress, by peer
    pub fn receiving(&self) -> impl Iterator<Item = (&PeerAddress, &FileTransferProgress)> {
        self.connections.iter().filter_map(|(address, entry)| {
            entry
                .state
                .transfer()
                .filter(|progress| progress.direction == TransferDirection::Receiving)
                .map(|progress| (address, progress))
        })
    }
}

// ----------------------------------------------------------------------------
// Connection Manager
// ----------------------------------------------------------------------------

struct Entry {
    connection: Arc<Connection>,
    read_task: JoinHandle<()>,
    state_task: JoinHandle<()>,
}

impl Entry {
    fn abort_tasks(&self) {
        self.read_task.abort();
        self.state_task.abort();
    }
}

struct ManagerInner {
    local: PeerAddress,
    link: Arc<dyn DeviceLink>,
    files: Arc<dyn FileStore>,
    config: ConnectionConfig,
    registry: Mutex<HashMap<PeerAddress, Entry>>,
    snapshot: watch::Sender<ManagerSnapshot>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    inbound_rx: std::sync::Mutex<Option<mpsc::Receiver<InboundEvent>>>,
    new_connections: broadcast::Sender<PeerAddress>,
}

/// Owns every peer connection of the local device
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        local: PeerAddress,
        link: Arc<dyn DeviceLink>,
        files: Arc<dyn FileStore>,
        config: ConnectionConfig,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer_size.max(1));
        let (snapshot, _) = watch::channel(ManagerSnapshot::default());
        let (new_connections, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                local,
                link,
                files,
                config,
                registry: Mutex::new(HashMap::new()),
                snapshot,
                inbound_tx,
                inbound_rx: std::sync::Mutex::new(Some(inbound_rx)),
                new_connections,
            }),
        }
    }

    pub fn local_address(&self) -> &PeerAddress {
        &self.inner.local
    }

    /// Take the merged inbound stream. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.inner
            .inbound_rx
            .lock()
            .ok()
            .and_then(|mut receiver| receiver.take())
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Observe the aggregated state
    pub fn subscribe_states(&self) -> watch::Receiver<ManagerSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Observe newly registered connections
    pub fn subscribe_new_connections(&self) -> broadcast::Receiver<PeerAddress> {
        self.inner.new_connections.subscribe()
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn peer_state(&self, address: &PeerAddress) -> PeerState {
        self.inner.snapshot.borrow().peer_state(address)
    }

    pub fn is_connected(&self, address: &PeerAddress) -> bool {
        self.peer_state(address) == PeerState::Connected
    }

    pub fn connected_addresses(&self) -> Vec<PeerAddress> {
        self.inner.snapshot.borrow().connected_addresses()
    }

    pub fn connected_names(&self) -> Vec<String> {
        self.inner.snapshot.borrow().connected_names()
    }

    /// Live connection to `address`
    pub async fn connection(&self, address: &PeerAddress) -> Option<Arc<Connection>> {
        let registry = self.inner.registry.lock().await;
        registry
            .get(address)
            .map(|entry| Arc::clone(&entry.connection))
            .filter(|connection| !connection.is_disconnected())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open a client stream to `address` and register it
    pub async fn connect_to_as_client(&self, address: &PeerAddress) -> bool {
        if self.is_connected(address) {
            debug!("Already connected to {}", address);
            return true;
        }

        self.set_connecting(address, true);
        let connected = match self.inner.link.connect(address).await {
            Ok(stream) => {
                self.register(address.clone(), Role::Client, stream).await;
                true
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                false
            }
        };
        self.set_connecting(address, false);
        connected
    }

    /// Accept server streams until the device link fails, registering each
    /// and reporting it to `on_new`
    pub async fn listen_for_connection_requests<F>(&self, mut on_new: F) -> LinkchatResult<()>
    where
        F: FnMut(PeerAddress) + Send,
    {
        info!("Listening for connection requests");
        loop {
            let (address, stream) = self.inner.link.accept().await?;
            if self.register(address.clone(), Role::Server, stream).await {
                on_new(address);
            }
        }
    }

    /// Register an established stream, replacing any previous connection to
    /// the same peer. Returns whether the stream was kept.
    ///
    /// When both devices dial each other at the same time each ends up with
    /// two streams. Both keep the one opened by the lower address, so they
    /// agree on a single stream.
    pub async fn register(&self, address: PeerAddress, role: Role, stream: BoxedStream) -> bool {
        let inner = &self.inner;
        let name = inner
            .link
            .display_name(&address)
            .unwrap_or_else(|| address.to_string());
        let connection = Connection::new(
            address.clone(),
            name.clone(),
            role,
            stream,
            inner.config.clone(),
            Arc::clone(&inner.files),
        );

        let mut registry = inner.registry.lock().await;
        if let Some(existing) = registry.get(&address) {
            let existing = &existing.connection;
            if !existing.is_disconnected()
                && existing.role() != role
                && existing.role() == self.preferred_role(&address)
            {
                drop(registry);
                debug!("Dropping duplicate {:?} stream with {}", role, address);
                connection.close().await;
                return false;
            }
        }
        let replaced = registry.remove(&address);
        if let Some(old) = &replaced {
            old.abort_tasks();
        }

        inner.snapshot.send_modify(|snapshot| {
            snapshot.connections.insert(
                address.clone(),
                ConnectionSnapshot {
                    connection_id: connection.id(),
                    name,
                    state: connection.state(),
                },
            );
        });
        let read_task = tokio::spawn(
            Arc::clone(&connection).run_read_loop(inner.inbound_tx.clone()),
        );
        let state_task = tokio::spawn(forward_state(
            Arc::downgrade(inner),
            Arc::clone(&connection),
        ));
        registry.insert(
            address.clone(),
            Entry {
                connection,
                read_task,
                state_task,
            },
        );
        drop(registry);

        if let Some(old) = replaced {
            debug!("Replaced previous connection with {}", address);
            old.connection.close().await;
        }
        info!("Registered {:?} connection with {}", role, address);
        // Nobody listening for new connections is fine
        let _ = inner.new_connections.send(address);
        true
    }

    /// Close the connection to `address` and forget it
    pub async fn disconnect(&self, address: &PeerAddress) -> bool {
        let removed = self.inner.registry.lock().await.remove(address);
        match removed {
            Some(entry) => {
                entry.abort_tasks();
                entry.connection.close().await;
                self.inner.forget(address, entry.connection.id());
                info!("Disconnected from {}", address);
                true
            }
            None => false,
        }
    }

    /// Close every connection
    pub async fn disconnect_all(&self) {
        let entries: Vec<(PeerAddress, Entry)> =
            self.inner.registry.lock().await.drain().collect();
        for (address, entry) in entries {
            entry.abort_tasks();
            entry.connection.close().await;
            self.inner.forget(&address, entry.connection.id());
        }
        info!("Disconnected from all peers");
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send envelope text to every listed peer, best effort. Returns how many
    /// sends succeeded.
    pub async fn send_message(&self, text: &str, addresses: &[PeerAddress]) -> usize {
        let connections: Vec<Arc<Connection>> = {
            let registry = self.inner.registry.lock().await;
            addresses
                .iter()
                .filter_map(|address| match registry.get(address) {
                    Some(entry) => Some(Arc::clone(&entry.connection)),
                    None => {
                        debug!("Not connected to {}, skipping", address);
                        None
                    }
                })
                .collect()
        };

        join_all(connections.iter().map(|connection| connection.send_message(text)))
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count()
    }

    /// Encode and send a protocol message to every listed peer
    pub async fn send(&self, message: &ProtocolMessage, addresses: &[PeerAddress]) -> usize {
        match encode(message) {
            Ok(text) => self.send_message(&text, addresses).await,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.type_tag(), e);
                0
            }
        }
    }

    /// Encode and send a protocol message to one peer
    pub async fn send_to(&self, address: &PeerAddress, message: &ProtocolMessage) -> bool {
        self.send(message, std::slice::from_ref(address)).await == 1
    }

    fn preferred_role(&self, peer: &PeerAddress) -> Role {
        if &self.inner.local < peer {
            Role::Client
        } else {
            Role::Server
        }
    }

    fn set_connecting(&self, address: &PeerAddress, connecting: bool) {
        self.inner.snapshot.send_if_modified(|snapshot| {
            if connecting {
                snapshot.connecting.insert(address.clone())
            } else {
                snapshot.connecting.remove(address)
            }
        });
    }
}

impl ManagerInner {
    fn publish_state(&self, connection: &Connection, state: ConnectionState) {
        self.snapshot
            .send_if_modified(|snapshot| match snapshot.connections.get_mut(connection.address()) {
                Some(entry) if entry.connection_id == connection.id() && entry.state != state => {
                    entry.state = state;
                    true
                }
                _ => false,
            });
    }

    /// Drop the published entry of a connection, unless it was replaced
    fn forget(&self, address: &PeerAddress, connection_id: u64) {
        self.snapshot.send_if_modified(|snapshot| {
            let current = snapshot
                .connections
                .get(address)
                .is_some_and(|entry| entry.connection_id == connection_id);
            if current {
                snapshot.connections.remove(address);
            }
            current
        });
    }

    /// Remove a disconnected connection if it is still the registered one
    async fn remove_if_current(&self, connection: &Connection) {
        let mut registry = self.registry.lock().await;
        let current = registry
            .get(connection.address())
            .is_some_and(|entry| entry.connection.id() == connection.id());
        if current {
            if let Some(entry) = registry.remove(connection.address()) {
                entry.read_task.abort();
            }
        }
        drop(registry);
        self.forget(connection.address(), connection.id());
        if current {
            debug!("Removed connection to {} from registry", connection.address());
        }
    }
}

/// Push a connection's state into the manager snapshot; after it
/// disconnects, wait for the grace delay and remove it
async fn forward_state(manager: Weak<ManagerInner>, connection: Arc<Connection>) {
    let mut states = connection.subscribe_state();
    let grace = loop {
        let state = states.borrow_and_update().clone();
        let Some(inner) = manager.upgrade() else {
            return;
        };
        let disconnected = state.is_disconnected();
        inner.publish_state(&connection, state);
        if disconnected {
            break inner.config.disconnect_grace();
        }
        drop(inner);
        if states.changed().await.is_err() {
            return;
        }
    };

    tokio::time::sleep(grace).await;
    if let Some(inner) = manager.upgrade() {
        inner.remove_if_current(&connection).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryFileStore, MemoryNetwork};
    use linkchat_core::LinkchatConfig;

    fn manager(network: &MemoryNetwork, address: &str) -> ConnectionManager {
        let link = network.link(PeerAddress::new(address), address.to_uppercase());
        ConnectionManager::new(
            PeerAddress::new(address),
            Arc::new(link),
            Arc::new(MemoryFileStore::new()),
            LinkchatConfig::fast().connection,
        )
    }

    #[test]
    fn test_peer_state_prefers_live_connection() {
        let mut snapshot = ManagerSnapshot::default();
        let peer = PeerAddress::new("p");
        assert_eq!(snapshot.peer_state(&peer), PeerState::Disconnected);

        snapshot.connecting.insert(peer.clone());
        assert_eq!(snapshot.peer_state(&peer), PeerState::Connecting);

        snapshot.connections.insert(
            peer.clone(),
            ConnectionSnapshot {
                connection_id: 1,
                name: "P".into(),
                state: ConnectionState::Listening,
            },
        );
        assert_eq!(snapshot.peer_state(&peer), PeerState::Connected);
        assert_eq!(snapshot.connected_names(), vec!["P".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_to_unknown_device_fails() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        assert!(!a.connect_to_as_client(&PeerAddress::new("nobody")).await);
        assert_eq!(
            a.peer_state(&PeerAddress::new("nobody")),
            PeerState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_simultaneous_dial_keeps_lower_address_stream() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");

        // "a" is the lower address, so its client stream wins
        let (_client_end, server_end) = tokio::io::duplex(1024);
        assert!(a.register(PeerAddress::new("b"), Role::Client, Box::new(server_end)).await);
        let (_other, accepted) = tokio::io::duplex(1024);
        assert!(!a.register(PeerAddress::new("b"), Role::Server, Box::new(accepted)).await);

        let kept = a.connection(&PeerAddress::new("b")).await.unwrap();
        assert_eq!(kept.role(), Role::Client);
    }

    #[tokio::test]
    async fn test_name_comes_from_device_link() {
        let network = MemoryNetwork::new();
        let a = manager(&network, "a");
        let b = manager(&network, "b");
        let listener = b.clone();
        tokio::spawn(async move { listener.listen_for_connection_requests(|_| {}).await });

        assert!(a.connect_to_as_client(&PeerAddress::new("b")).await);
        assert_eq!(a.connected_names(), vec!["B".to_string()]);
        assert!(a.take_inbound().is_some());
        assert!(a.take_inbound().is_none());
    }
}
