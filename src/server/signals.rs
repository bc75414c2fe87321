//! Process signal forwarding.
//!
//! Signal handlers are installed once, before the first signal is awaited,
//! so a second signal arriving right after the first is never lost.

use crate::server::shutdown::{ShutdownCoordinator, Trigger};
use std::io;
use std::sync::Arc;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// SIGINT and SIGTERM listeners.
#[cfg(unix)]
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    /// Register the handlers. Must be called from within a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal. Returns its name, or `None` if the
    /// listeners were shut down.
    pub async fn recv(&mut self) -> Option<&'static str> {
        tokio::select! {
            res = self.interrupt.recv() => res.map(|_| "SIGINT"),
            res = self.terminate.recv() => res.map(|_| "SIGTERM"),
        }
    }
}

/// Ctrl-C listener.
#[cfg(not(unix))]
pub struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    pub async fn recv(&mut self) -> Option<&'static str> {
        self.ctrl_c.recv().await.map(|_| "CTRL-C")
    }
}

/// Forward signals to the coordinator. The first signal starts a graceful
/// shutdown, the second forces it.
pub async fn forward_signals(mut signals: ShutdownSignals, coordinator: Arc<ShutdownCoordinator>) {
    while let Some(name) = signals.recv().await {
        match coordinator.trigger() {
            Trigger::Started => info!(signal = name, "Shutdown signal received"),
            Trigger::Escalated => info!(signal = name, "Second shutdown signal received"),
            Trigger::Ignored => return,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::server::registry::ConnectionRegistry;
    use crate::server::shutdown::DrainOutcome;
    use chrono::Utc;
    use std::process::Command;
    use std::time::Duration;

    fn send_sigterm() {
        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_back_to_back_signals_escalate() {
        let registry = Arc::new(ConnectionRegistry::new());
        // Keeps the drain from completing on its own
        registry.register("127.0.0.1:4000".parse().unwrap(), Utc::now());
        let coordinator = Arc::new(ShutdownCoordinator::new(
            Arc::clone(&registry),
            Duration::from_secs(60),
        ));

        let signals = ShutdownSignals::install().unwrap();
        tokio::spawn(forward_signals(signals, Arc::clone(&coordinator)));

        let mut stop = coordinator.subscribe_stop();
        send_sigterm();
        tokio::time::timeout(Duration::from_secs(5), stop.wait_for(|stop| *stop))
            .await
            .unwrap()
            .unwrap();

        // Sent immediately after the first trigger
        send_sigterm();

        let report = tokio::time::timeout(Duration::from_secs(10), coordinator.drain())
            .await
            .unwrap();
        assert_eq!(report.outcome, DrainOutcome::Escalated);
    }
}
