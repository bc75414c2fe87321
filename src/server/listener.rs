//! Listening socket.
//!
//! The socket is created through `socket2` so the configured backlog is
//! passed to `listen(2)`, then handed to tokio.

use crate::endpoint::Endpoint;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::info;

/// Startup failure binding the listening socket.
#[derive(Debug)]
pub enum BindError {
    /// Endpoint host did not resolve
    Resolve(Endpoint, io::Error),
    /// Another socket already owns the address
    AddrInUse(SocketAddr),
    /// Not allowed to bind the address (e.g. privileged port)
    PermissionDenied(SocketAddr),
    /// Any other socket setup failure
    Io(SocketAddr, io::Error),
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::Resolve(endpoint, e) => {
                write!(f, "Failed to resolve '{}': {}", endpoint, e)
            }
            BindError::AddrInUse(addr) => write!(f, "Address {} already in use", addr),
            BindError::PermissionDenied(addr) => {
                write!(f, "Permission denied binding {}", addr)
            }
            BindError::Io(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BindError::Resolve(_, e) | BindError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

impl BindError {
    fn from_io(addr: SocketAddr, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::AddrInUse => BindError::AddrInUse(addr),
            io::ErrorKind::PermissionDenied => BindError::PermissionDenied(addr),
            _ => BindError::Io(addr, e),
        }
    }
}

/// Result of waiting for a connection.
#[derive(Debug)]
pub enum Accepted {
    Connection(TcpStream, SocketAddr),
    /// The listener was asked to stop.
    Cancelled,
}

pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind `endpoint` and start listening with the given backlog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(endpoint: &Endpoint, backlog: u32) -> Result<Self, BindError> {
        let addr = endpoint
            .resolve()
            .map_err(|e| BindError::Resolve(endpoint.clone(), e))?;
        let std_listener = create_listener(addr, backlog).map_err(|e| BindError::from_io(addr, e))?;
        let inner = TcpListener::from_std(std_listener).map_err(|e| BindError::Io(addr, e))?;
        let local_addr = inner.local_addr().map_err(|e| BindError::Io(addr, e))?;

        info!(address = %local_addr, backlog, "Listening");
        Ok(Self { inner, local_addr })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next connection or for `stop` to become `true`.
    ///
    /// Cancellation takes priority over a pending connection.
    pub async fn accept(&self, stop: &mut watch::Receiver<bool>) -> io::Result<Accepted> {
        tokio::select! {
            biased;
            _ = stop.wait_for(|stop| *stop) => Ok(Accepted::Cancelled),
            res = self.inner.accept() => {
                let (stream, addr) = res?;
                Ok(Accepted::Connection(stream, addr))
            }
        }
    }

    /// Close the listening socket. Connections attempted afterwards are
    /// refused by the OS.
    pub fn stop(self) {
        info!(address = %self.local_addr, "Listener stopped");
    }
}

fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_ephemeral_port() {
        let listener = Listener::start(&Endpoint::new("127.0.0.1", 0), 10).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_addr_in_use() {
        let first = Listener::start(&Endpoint::new("127.0.0.1", 0), 10).unwrap();
        let taken = Endpoint::from(first.local_addr());

        match Listener::start(&taken, 10) {
            Err(BindError::AddrInUse(addr)) => assert_eq!(addr, first.local_addr()),
            other => panic!("unexpected: {:?}", other.map(|l| l.local_addr())),
        }
    }

    #[tokio::test]
    async fn test_accept_connection() {
        let listener = Listener::start(&Endpoint::new("127.0.0.1", 0), 10).unwrap();
        let (_tx, mut stop) = watch::channel(false);

        let client = TcpStream::connect(listener.local_addr()).await.unwrap();
        match listener.accept(&mut stop).await.unwrap() {
            Accepted::Connection(_, addr) => assert_eq!(addr, client.local_addr().unwrap()),
            Accepted::Cancelled => panic!("unexpected cancel"),
        }
    }

    #[tokio::test]
    async fn test_stop_cancels_accept() {
        let listener = Listener::start(&Endpoint::new("127.0.0.1", 0), 10).unwrap();
        let (tx, mut stop) = watch::channel(false);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            tx.send_replace(true);
        });

        assert!(matches!(listener.accept(&mut stop).await.unwrap(), Accepted::Cancelled));
        stopper.await.unwrap();

        let addr = listener.local_addr();
        listener.stop();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
