//! Registry of live connections.
//!
//! The registry is the only state shared between connection tasks. It holds
//! a small record per connection (never the socket itself) and is the
//! enumeration source for coordinated shutdown.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Process-unique connection identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Registry record for a live connection.
#[derive(Debug)]
struct Entry {
    remote: SocketAddr,
    created_at: DateTime<Utc>,
    /// Handle used to force-close the connection's task.
    /// `None` until the task has been spawned.
    abort: Option<AbortHandle>,
}

/// Point-in-time description of a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe registry of live connections.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
    /// Live connection count, updated under the map lock.
    live: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            live: watch::channel(0).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        // Entries are plain data, so a poisoned lock is still consistent.
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new connection and return its id.
    pub fn register(&self, remote: SocketAddr, created_at: DateTime<Utc>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut connections = self.lock();
        connections.insert(
            id,
            Entry {
                remote,
                created_at,
                abort: None,
            },
        );
        self.live.send_replace(connections.len());
        id
    }

    /// Attach the abort handle of the task serving `id`.
    ///
    /// Returns `false` if the connection has already deregistered.
    pub fn attach_abort(&self, id: ConnectionId, abort: AbortHandle) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.abort = Some(abort);
                true
            }
            None => false,
        }
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn deregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.lock();
        let removed = connections.remove(&id).is_some();
        if removed {
            self.live.send_replace(connections.len());
        }
        removed
    }

    /// Ids of all live connections.
    pub fn snapshot(&self) -> BTreeSet<ConnectionId> {
        self.lock().keys().copied().collect()
    }

    /// Details of all live connections, ordered by id.
    pub fn describe(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                remote: entry.remote,
                created_at: entry.created_at,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until no connections are registered.
    pub async fn wait_empty(&self) {
        let mut live = self.live.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = live.wait_for(|count| *count == 0).await;
    }

    /// Abort the task of every live connection.
    ///
    /// Entries are not removed here; each connection deregisters itself when
    /// its task is dropped. Returns the ids that were aborted.
    pub fn force_close_all(&self) -> Vec<ConnectionId> {
        let connections = self.lock();
        let mut aborted: Vec<ConnectionId> = connections
            .iter()
            .filter_map(|(id, entry)| {
                entry.abort.as_ref().map(|abort| {
                    abort.abort();
                    *id
                })
            })
            .collect();
        aborted.sort();
        aborted
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
