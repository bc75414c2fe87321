//! TCP server for length-prefixed request/response connections.
//!
//! The server is made of four parts:
//! - [`listener`]: binds the socket and accepts connections
//! - [`handler`]: runs the read/dispatch/write loop of one connection
//! - [`registry`]: tracks live connections
//! - [`shutdown`]: stops the listener, drains, then force-closes
//! - [`signals`]: forwards SIGINT/SIGTERM to the shutdown coordinator

pub mod connection;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod shutdown;
pub mod signals;

pub use connection::{ConnState, Connection, ConnectionError};
pub use listener::{Accepted, BindError, Listener};
pub use registry::{ConnectionId, ConnectionInfo, ConnectionRegistry};
pub use shutdown::{DrainOutcome, Phase, ShutdownCoordinator, ShutdownReport, Trigger};

use crate::apps::Application;
use crate::config::Config;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. EMFILE) before retrying
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    listener: Listener,
    app: Arc<dyn Application>,
    registry: Arc<ConnectionRegistry>,
    coordinator: Arc<ShutdownCoordinator>,
    connection_limit: Option<Arc<Semaphore>>,
    max_message_bytes: usize,
    stats_interval: u64,
}

impl Server {
    /// Bind the listening socket. Must be called from within a tokio runtime.
    pub fn bind(config: &Config, app: Arc<dyn Application>) -> Result<Self, BindError> {
        let listener = Listener::start(&config.endpoint(), config.backlog)?;
        let registry = Arc::new(ConnectionRegistry::new());
        let coordinator = Arc::new(ShutdownCoordinator::new(
            Arc::clone(&registry),
            config.drain_deadline(),
        ));
        let connection_limit = match config.max_connections {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        Ok(Server {
            listener,
            app,
            registry,
            coordinator,
            connection_limit,
            max_message_bytes: config.max_message_bytes,
            stats_interval: config.stats_interval,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle for triggering and observing shutdown.
    pub fn shutdown_handle(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Accept connections until shutdown is triggered, then drain.
    pub async fn run(self) -> ShutdownReport {
        if self.stats_interval > 0 {
            let registry = Arc::clone(&self.registry);
            let phase = self.coordinator.subscribe();
            let interval = self.stats_interval;
            tokio::spawn(async move {
                stats_task(registry, interval, phase).await;
            });
        }

        self.accept_loop().await;
        let Server {
            listener,
            coordinator,
            ..
        } = self;
        listener.stop();

        coordinator.drain().await
    }

    async fn accept_loop(&self) {
        let mut stop = self.coordinator.subscribe_stop();

        loop {
            // Wait for a connection slot
            let permit = match &self.connection_limit {
                Some(limit) => tokio::select! {
                    biased;
                    _ = stop.wait_for(|stop| *stop) => return,
                    permit = Arc::clone(limit).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                },
                None => None,
            };

            match self.listener.accept(&mut stop).await {
                Ok(Accepted::Connection(stream, peer)) => {
                    self.spawn_connection(stream, peer, permit);
                }
                Ok(Accepted::Cancelled) => return,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    if pause_after_accept_error(&mut stop).await {
                        return;
                    }
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let mut conn = Connection::open(stream, peer, Arc::clone(&self.registry));
        let id = conn.id();
        debug!(conn = %id, peer = %peer, "New connection");

        let app = Arc::clone(&self.app);
        let max_message_bytes = self.max_message_bytes;
        let mut phase = self.coordinator.subscribe();

        let handle = tokio::spawn(async move {
            let result =
                handler::handle_connection(&mut conn, app.as_ref(), max_message_bytes, &mut phase)
                    .await;
            log_close(id, result);
            drop(permit);
        });

        self.registry.attach_abort(id, handle.abort_handle());
    }
}

fn log_close(id: ConnectionId, result: Result<(), ConnectionError>) {
    match result {
        Ok(()) => debug!(conn = %id, "Connection closed by peer"),
        Err(e) if !e.is_failure() => debug!(conn = %id, "Connection closed for shutdown"),
        Err(ConnectionError::Application(e)) => {
            warn!(conn = %id, error = %e, "Application failed, closing connection")
        }
        Err(e) => debug!(conn = %id, error = %e, "Connection error"),
    }
}

/// Wait out the accept-error pause. Returns `true` if the listener was asked
/// to stop in the meantime.
async fn pause_after_accept_error(stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(ACCEPT_ERROR_PAUSE) => false,
        _ = stop.wait_for(|stop| *stop) => true,
    }
}

/// Background task that periodically logs the live connection count.
///
/// Returns the number of reports logged once the phase reaches `Terminated`.
async fn stats_task(
    registry: Arc<ConnectionRegistry>,
    interval_secs: u64,
    mut phase: watch::Receiver<Phase>,
) -> usize {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    // First tick completes immediately
    interval.tick().await;

    let mut reports = 0;
    loop {
        let terminated = tokio::select! {
            _ = interval.tick() => false,
            _ = phase.wait_for(|phase| *phase == Phase::Terminated) => true,
        };
        if terminated {
            return reports;
        }

        let current = *phase.borrow();
        let connections = registry.describe();
        match connections.first() {
            Some(oldest) => info!(
                connections = connections.len(),
                phase = ?current,
                oldest = %oldest.id,
                oldest_peer = %oldest.remote,
                oldest_age_secs = (Utc::now() - oldest.created_at).num_seconds(),
                "Connection stats"
            ),
            None => info!(connections = 0, phase = ?current, "Connection stats"),
        }
        reports += 1;
    }
}
