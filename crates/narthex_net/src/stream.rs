//! The stream interface the gateway core consumes.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A byte stream with enough metadata for routing decisions: peer/local
/// addresses for the `Forwarded` header and whether the transport is
/// already secured (drives `https`/`wss` scheme derivation).
pub trait NetStream: AsyncRead + AsyncWrite + Unpin + Send {
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn local_addr(&self) -> Option<SocketAddr>;
    fn is_secure(&self) -> bool;
}

pub type BoxedStream = Box<dyn NetStream>;

impl NetStream for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn is_secure(&self) -> bool {
        false
    }
}

impl NetStream for tokio_rustls::server::TlsStream<TcpStream> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr().ok()
    }

    fn is_secure(&self) -> bool {
        true
    }
}

impl NetStream for tokio_rustls::client::TlsStream<TcpStream> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.peer_addr().ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.get_ref().0.local_addr().ok()
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// In-memory stream pair, used by tests exercising the connection machinery
/// without sockets.
impl NetStream for tokio::io::DuplexStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_secure(&self) -> bool {
        false
    }
}
