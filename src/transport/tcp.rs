//! TCP transport: connector, transceiver and acceptor.
//!
//! The accepting side validates a new connection by sending a fixed
//! [`VALIDATE_CONNECTION`] header; the connecting side reads and checks it.
//! Nothing else is read or written here: framing belongs to the protocol
//! layer.

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::SocketAddrs;
use crate::transport::connector::{Connect, Connector};
use crate::transport::endpoint::{Endpoint, Protocol};
use crate::transport::transceiver::{Acceptor, Transceiver};
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const HEADER_SIZE: usize = 14;

/// Magic, protocol 1.0, encoding 1.0, message type 3 (validate connection),
/// compression 0, total size 14 (little endian).
pub const VALIDATE_CONNECTION: [u8; HEADER_SIZE] =
    [b'R', b'P', b'C', b'N', 1, 0, 1, 0, 3, 0, 14, 0, 0, 0];

const VALIDATE_CONNECTION_MSG: u8 = 3;

fn check_validation(header: &[u8; HEADER_SIZE]) -> Result<(), NetError> {
    if header[..4] != VALIDATE_CONNECTION[..4] {
        return Err(NetError::HandshakeFailed(format!("bad magic {:?}", &header[..4])));
    }
    if header[8] != VALIDATE_CONNECTION_MSG {
        return Err(NetError::HandshakeFailed(format!(
            "expected validate connection message, got type {}",
            header[8]
        )));
    }
    let size = i32::from_le_bytes([header[10], header[11], header[12], header[13]]);
    if size != HEADER_SIZE as i32 {
        return Err(NetError::HandshakeFailed(format!("bad validation message size {}", size)));
    }
    Ok(())
}

/// A TCP channel, either connected by us or accepted from a peer.
#[derive(Debug)]
pub struct TcpTransceiver {
    stream: TcpStream,
    peer: SocketAddr,
    incoming: bool,
}

impl TcpTransceiver {
    pub fn outgoing(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer, incoming: false }
    }

    pub fn incoming(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer, incoming: true }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transceiver for TcpTransceiver {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn initialize(&mut self) -> BoxFuture<'_, Result<(), NetError>> {
        Box::pin(async move {
            if self.incoming {
                self.stream.write_all(&VALIDATE_CONNECTION).await.handshake_context()?;
                self.stream.flush().await.handshake_context()?;
            } else {
                let mut header = [0u8; HEADER_SIZE];
                self.stream.read_exact(&mut header).await.handshake_context()?;
                check_validation(&header)?;
            }
            tracing::debug!(peer = %self.peer, incoming = self.incoming, "connection validated");
            Ok(())
        })
    }

    fn write<'a>(&'a mut self, buf: &'a [u8]) -> BoxFuture<'a, Result<(), NetError>> {
        Box::pin(async move {
            let host = self.peer.ip().to_string();
            self.stream.write_all(buf).await.connection_context(&host, self.peer.port())
        })
    }

    fn close(self: Box<Self>) {
        tracing::debug!(peer = %self.peer, incoming = self.incoming, "closing tcp transceiver");
    }
}

/// Blocking TCP connect with a timeout.
#[derive(Debug, Clone)]
pub struct TcpConnect {
    timeout: Duration,
}

impl TcpConnect {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Connect for TcpConnect {
    fn connect(&self, connector: &Connector) -> Result<Box<dyn Transceiver>, NetError> {
        if connector.protocol() != Protocol::Tcp {
            return Err(NetError::UnsupportedProtocol(connector.protocol().to_string()));
        }

        let addr = connector.addr();
        let host = addr.ip().to_string();
        tracing::debug!(connector = %connector, timeout_ms = self.timeout.as_millis() as u64, "connecting");

        let stream = std::net::TcpStream::connect_timeout(&addr, self.timeout)
            .connection_context(&host, addr.port())?;
        stream.set_nodelay(true).connection_context(&host, addr.port())?;
        stream.set_nonblocking(true).connection_context(&host, addr.port())?;
        let stream = TcpStream::from_std(stream).connection_context(&host, addr.port())?;

        Ok(Box::new(TcpTransceiver::outgoing(stream, addr)))
    }
}

/// Listening TCP socket.
#[derive(Debug)]
pub struct TcpAcceptor {
    endpoint: Endpoint,
    listener: Mutex<Option<Arc<TcpListener>>>,
}

impl TcpAcceptor {
    /// Binds to `endpoint`. Port 0 picks a free port; [`Acceptor::endpoint`]
    /// reports the real one.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, NetError> {
        if endpoint.protocol() != Protocol::Tcp {
            return Err(NetError::UnsupportedProtocol(endpoint.protocol().to_string()));
        }

        let bound = match SocketAddrs::try_parse(endpoint.host()) {
            Some(ip) => TcpListener::bind(SocketAddr::new(ip, endpoint.port())).await,
            None => TcpListener::bind((endpoint.host(), endpoint.port())).await,
        };
        let listener = bound.map_err(|e| {
            tracing::debug!(endpoint = %endpoint, error = %e, "bind failed");
            match e.kind() {
                std::io::ErrorKind::AddrInUse => NetError::AddressInUse,
                _ => NetError::AddressInvalid,
            }
        })?;

        let port = listener
            .local_addr()
            .connection_context(endpoint.host(), endpoint.port())?
            .port();
        tracing::debug!(endpoint = %endpoint, port, "listening");

        Ok(Self {
            endpoint: endpoint.with_port(port),
            listener: Mutex::new(Some(Arc::new(listener))),
        })
    }
}

impl Acceptor for TcpAcceptor {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn accept(&self) -> BoxFuture<'_, Result<Box<dyn Transceiver>, NetError>> {
        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Box::pin(async move {
            let listener = listener.ok_or(NetError::ConnectionAborted)?;
            let (stream, peer) = listener
                .accept()
                .await
                .connection_context(self.endpoint.host(), self.endpoint.port())?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "set_nodelay failed");
            }
            Ok(Box::new(TcpTransceiver::incoming(stream, peer)) as Box<dyn Transceiver>)
        })
    }

    fn close(&self) {
        if self.listener.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            tracing::debug!(endpoint = %self.endpoint, "acceptor closed");
        }
    }
}
