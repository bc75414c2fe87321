//! Shutdown coordination.
//!
//! ```text
//! Running --trigger--> Draining --empty | deadline | escalate--> Terminated
//! ```
//!
//! The first trigger asks the listener to stop. Once the listening socket is
//! closed the coordinator enters `Draining`, which every handler observes at
//! its next message boundary. Handlers still open when the deadline fires
//! (or when a second trigger arrives) are aborted.

use crate::server::registry::{ConnectionId, ConnectionRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tracing::{info, warn};

/// How long to wait for aborted tasks to drop their connections.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Coordinator phase, as observed by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Draining,
    Terminated,
}

/// Effect of a call to [`ShutdownCoordinator::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Graceful shutdown started.
    Started,
    /// Shutdown was already in progress; escalated to force-close.
    Escalated,
    /// Already terminated.
    Ignored,
}

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed on its own.
    Drained,
    /// The drain deadline elapsed.
    DeadlineElapsed,
    /// A second trigger arrived while draining.
    Escalated,
}

/// Summary of a completed shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub outcome: DrainOutcome,
    /// Connections live when draining began.
    pub draining: usize,
    /// Connections aborted after the deadline or on escalation.
    pub forced: Vec<ConnectionId>,
    pub elapsed: Duration,
}

pub struct ShutdownCoordinator {
    registry: Arc<ConnectionRegistry>,
    deadline: Duration,
    stop_accepting: watch::Sender<bool>,
    phase: watch::Sender<Phase>,
    force: Notify,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<ConnectionRegistry>, deadline: Duration) -> Self {
        Self {
            registry,
            deadline,
            stop_accepting: watch::channel(false).0,
            phase: watch::channel(Phase::Running).0,
            force: Notify::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver that observes phase changes.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Receiver that turns `true` once the listener has been asked to stop.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_accepting.subscribe()
    }

    /// Signal shutdown.
    ///
    /// The first call starts a graceful shutdown. A later call while still
    /// draining escalates to an immediate force-close.
    pub fn trigger(&self) -> Trigger {
        let started = self.stop_accepting.send_if_modified(|stop| {
            if *stop {
                false
            } else {
                *stop = true;
                true
            }
        });

        if started {
            info!("Shutdown requested, stopping listener");
            Trigger::Started
        } else if self.phase() == Phase::Terminated {
            Trigger::Ignored
        } else {
            warn!("Second shutdown request, escalating to force-close");
            // Stores a permit if `drain` is not waiting yet
            self.force.notify_one();
            Trigger::Escalated
        }
    }

    /// Wait until the coordinator reaches `phase` (or a later one).
    pub async fn wait_for(&self, phase: Phase) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|current| rank(*current) >= rank(phase)).await;
    }

    /// Drain live connections and move to `Terminated`.
    ///
    /// Must be called after the listener has stopped accepting.
    pub async fn drain(&self) -> ShutdownReport {
        let started = Instant::now();
        let draining = self.registry.len();
        self.phase.send_replace(Phase::Draining);

        info!(
            connections = draining,
            deadline_ms = self.deadline.as_millis() as u64,
            "Draining connections"
        );

        let outcome = tokio::select! {
            _ = self.registry.wait_empty() => DrainOutcome::Drained,
            _ = tokio::time::sleep(self.deadline) => DrainOutcome::DeadlineElapsed,
            _ = self.force.notified() => DrainOutcome::Escalated,
        };

        let forced = if outcome == DrainOutcome::Drained {
            Vec::new()
        } else {
            let forced = self.registry.force_close_all();
            if !forced.is_empty() {
                warn!(
                    count = forced.len(),
                    outcome = ?outcome,
                    "Force-closing connections"
                );
            }
            if tokio::time::timeout(FORCE_CLOSE_GRACE, self.registry.wait_empty())
                .await
                .is_err()
            {
                warn!(
                    remaining = self.registry.len(),
                    "Connections still registered after force-close"
                );
            }
            forced
        };

        self.phase.send_replace(Phase::Terminated);

        let report = ShutdownReport {
            outcome,
            draining,
            forced,
            elapsed: started.elapsed(),
        };
        info!(
            outcome = ?report.outcome,
            drained = report.draining.saturating_sub(report.forced.len()),
            forced = report.forced.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );
        report
    }
}

fn rank(phase: Phase) -> u8 {
    match phase {
        Phase::Running => 0,
        Phase::Draining => 1,
        Phase::Terminated => 2,
    }
}
