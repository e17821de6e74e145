//! Pluggable raw-socket acquisition for the Connect Handler. Most
//! deployments just want the socket `accept()` already handed them by the
//! outer listener; environments embedding the proxy behind their own
//! connection management (a transparent redirect, a custom multiplexer)
//! implement this trait instead. Grounded on the "Raw-socket hijacking is
//! host-specific" design note, and on the boxed-future `App` trait shape
//! used for the gateway seam.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::TcpStream;

/// Supplies the raw, not-yet-TLS-terminated socket for a tunnel.
pub trait SocketHijacker: Send + Sync + 'static {
    fn accept(&self) -> Pin<Box<dyn Future<Output = std::io::Result<(TcpStream, SocketAddr)>> + Send + '_>>;
}

/// The default hijacker: a plain `TcpListener::accept()`.
pub struct DirectAcceptHijacker {
    listener: tokio::net::TcpListener,
}

impl DirectAcceptHijacker {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            listener: tokio::net::TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl SocketHijacker for DirectAcceptHijacker {
    fn accept(&self) -> Pin<Box<dyn Future<Output = std::io::Result<(TcpStream, SocketAddr)>> + Send + '_>> {
        Box::pin(async move { self.listener.accept().await })
    }
}
