//! Device link over TCP
//!
//! Paired devices come from the configuration file. The connecting side
//! introduces itself with a single line holding its address, after which the
//! socket is handed to the engine untouched.

use std::net::SocketAddr;

use async_trait::async_trait;
use linkchat_core::{LinkchatError, LinkchatResult, PeerAddress};
use linkchat_runtime::{BoxedStream, DeviceLink, PairedDevice};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::PeerConfig;

const MAX_HELLO_LEN: usize = 256;

pub struct TcpLink {
    local: PeerAddress,
    listener: TcpListener,
    peers: Vec<PeerConfig>,
}

impl TcpLink {
    /// Bind the listening socket
    pub async fn bind(
        local: PeerAddress,
        listen: SocketAddr,
        peers: Vec<PeerConfig>,
    ) -> LinkchatResult<Self> {
        let listener = TcpListener::bind(listen).await?;
        info!("Accepting connections on {}", listener.local_addr()?);
        Ok(Self {
            local,
            listener,
            peers,
        })
    }

    pub fn local_socket(&self) -> LinkchatResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn peer(&self, address: &PeerAddress) -> Option<&PeerConfig> {
        self.peers
            .iter()
            .find(|peer| peer.address == address.as_str())
    }
}

/// Read the introduction line one byte at a time so nothing after it is
/// consumed from the socket
async fn read_hello(stream: &mut TcpStream) -> LinkchatResult<PeerAddress> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_HELLO_LEN {
            return Err(LinkchatError::connection_failed(
                "unknown",
                "introduction line too long",
            ));
        }
        line.push(byte);
    }
    let address = String::from_utf8(line)
        .map_err(|_| LinkchatError::connection_failed("unknown", "introduction is not utf-8"))?;
    let address = address.trim();
    if address.is_empty() {
        return Err(LinkchatError::connection_failed("unknown", "empty introduction"));
    }
    Ok(PeerAddress::new(address))
}

#[async_trait]
impl DeviceLink for TcpLink {
    async fn paired_devices(&self) -> LinkchatResult<Vec<PairedDevice>> {
        Ok(self
            .peers
            .iter()
            .map(|peer| PairedDevice {
                address: peer.peer_address(),
                name: peer.display_name(),
            })
            .collect())
    }

    async fn connect(&self, address: &PeerAddress) -> LinkchatResult<BoxedStream> {
        let peer = self
            .peer(address)
            .ok_or_else(|| LinkchatError::connection_failed(address.as_str(), "device not paired"))?;
        let mut stream = TcpStream::connect(peer.socket)
            .await
            .map_err(|e| LinkchatError::connection_failed(address.as_str(), e.to_string()))?;
        stream.set_nodelay(true)?;
        stream
            .write_all(format!("{}\n", self.local).as_bytes())
            .await?;
        debug!("Connected to {} at {}", address, peer.socket);
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> LinkchatResult<(PeerAddress, BoxedStream)> {
        loop {
            let (mut stream, remote) = self.listener.accept().await?;
            match read_hello(&mut stream).await {
                Ok(address) => {
                    stream.set_nodelay(true)?;
                    debug!("{} connected from {}", address, remote);
                    return Ok((address, Box::new(stream) as BoxedStream));
                }
                Err(e) => debug!("Dropping connection from {}: {}", remote, e),
            }
        }
    }

    fn display_name(&self, address: &PeerAddress) -> Option<String> {
        self.peer(address).map(PeerConfig::display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_port() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_connect_introduces_local_address() {
        let server = TcpLink::bind(PeerAddress::new("server"), any_port(), Vec::new())
            .await
            .unwrap();
        let client = TcpLink::bind(
            PeerAddress::new("client"),
            any_port(),
            vec![PeerConfig {
                address: "server".to_string(),
                socket: server.local_socket().unwrap(),
                name: Some("Server".to_string()),
            }],
        )
        .await
        .unwrap();

        let server_address = PeerAddress::new("server");
        assert_eq!(client.display_name(&server_address).as_deref(), Some("Server"));
        assert_eq!(client.paired_devices().await.unwrap().len(), 1);

        let (accepted, connected) = tokio::join!(server.accept(), client.connect(&server_address));
        let (address, mut accepted) = accepted.unwrap();
        let mut connected = connected.unwrap();
        assert_eq!(address, PeerAddress::new("client"));

        // Bytes after the introduction reach the engine intact
        connected.write_all(b"\x02hi\x03").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x02hi\x03");
    }

    #[tokio::test]
    async fn test_connect_to_unpaired_device_fails() {
        let link = TcpLink::bind(PeerAddress::new("a"), any_port(), Vec::new())
            .await
            .unwrap();
        assert!(link.connect(&PeerAddress::new("b")).await.is_err());
    }
}
