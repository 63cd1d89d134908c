//! Graceful shutdown coordinator.
//!
//! - `SIGTERM` / `SIGINT` → cancel the stop token, drain live connections, exit
//!
//! Every long-running loop (HTTP server, connection routers, persistence
//! consumer) watches the stop token. Connections hold a [`ConnectionGuard`]
//! so the coordinator can wait for them to finish before the process exits.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Signal that triggered shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT / Ctrl-C
    Interrupt,
    /// Stopped programmatically through the stop token
    Requested,
}

/// Counts one live connection until dropped.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.counter.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

/// Coordinator for graceful shutdown with connection draining.
pub struct GracefulShutdown {
    stop: CancellationToken,
    connection_count: Arc<AtomicUsize>,
    drain_notify: Arc<Notify>,
    drain_timeout: Duration,
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            stop: CancellationToken::new(),
            connection_count: Arc::new(AtomicUsize::new(0)),
            drain_notify: Arc::new(Notify::new()),
            drain_timeout,
        }
    }

    /// Token cancelled when the process should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Register a live connection; released when the guard drops.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            counter: Arc::clone(&self.connection_count),
            notify: Arc::clone(&self.drain_notify),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Wait for SIGTERM or SIGINT.
    pub async fn wait_for_signal(&self) -> io::Result<ShutdownSignal> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    Ok(ShutdownSignal::Terminate)
                }
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received SIGINT, initiating graceful shutdown");
                    Ok(ShutdownSignal::Interrupt)
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await?;
            info!("Received Ctrl-C, initiating graceful shutdown");
            Ok(ShutdownSignal::Interrupt)
        }
    }

    /// Cancel the stop token without a signal.
    pub fn trigger_stop(&self) {
        self.stop.cancel();
    }

    /// Wait for all connections to finish or the drain timeout.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn drain(&self) -> bool {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_secs = self.drain_timeout.as_secs(),
            "Draining active connections"
        );

        tokio::select! {
            _ = self.wait_for_drain() => {
                info!("All connections drained cleanly");
                true
            }
            _ = tokio::time::sleep(self.drain_timeout) => {
                warn!(
                    remaining_connections = self.active_connections(),
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Drain timeout expired"
                );
                false
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            let drained = self.drain_notify.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.connection_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Run the shutdown lifecycle: wait for a signal (or a programmatic
    /// stop), cancel the stop token, then drain.
    pub async fn run(&self) -> ShutdownSignal {
        let signal = tokio::select! {
            result = self.wait_for_signal() => match result {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "Failed to listen for shutdown signals");
                    self.stop.cancelled().await;
                    ShutdownSignal::Requested
                }
            },
            _ = self.stop.cancelled() => ShutdownSignal::Requested,
        };

        info!(?signal, "Stopping");
        self.stop.cancel();

        if !self.drain().await {
            error!(
                remaining_connections = self.active_connections(),
                "Exiting with connections still open"
            );
        }

        signal
    }
}
