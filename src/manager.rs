//! Accepts connections, spawns a [`crate::session`] per socket, and reaps
//! sessions on terminal error. Mirrors the teacher's `serverless::task_main`
//! shape: a `tokio::spawn`'d task per accepted connection, a `DashMap` of
//! live sessions keyed by a monotonic id, and a `CancellationToken` that
//! fans out shutdown to every session at once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::session::{self, SessionReport};

/// What the manager keeps per live session: just enough to cancel it and
/// wait for its driver task to wind down. The manager never touches a
/// session's codecs directly — only [`session::run`] owns those.
struct SessionHandle {
    shutdown: CancellationToken,
    driver: tokio::task::JoinHandle<()>,
}

/// Accepts connections on `config.listen_addr` and owns every session's
/// lifecycle. Construct with [`Manager::new`], then run [`Manager::start`]
/// to bind and serve until the passed-in cancellation token fires.
pub struct Manager {
    config: Arc<ProxyConfig>,
    sessions: Arc<DashMap<u64, SessionHandle>>,
    next_session_id: AtomicU64,
}

impl Manager {
    pub fn new(config: ProxyConfig) -> Arc<Self> {
        Arc::new(Manager {
            config: Arc::new(config),
            sessions: Arc::new(DashMap::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Binds the listen address, accepts connections until `cancel` fires,
    /// then closes every remaining session and returns. Only a bind
    /// failure is fatal; every per-connection and per-accept error is
    /// logged and the loop continues (§4.4).
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(ProxyError::Io)?;
        info!(addr = %self.config.listen_addr, "listening");

        let (report_tx, report_rx) = mpsc::channel::<SessionReport>(16);

        let collector = tokio::spawn(Self::collect_errors(
            Arc::clone(&self.sessions),
            report_rx,
        ));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_session(stream, peer, &report_tx),
                        Err(e) => {
                            warn!(error = %e, "accept failed, continuing");
                        }
                    }
                }
            }
        }

        self.shutdown_all().await;
        drop(report_tx);
        let _ = collector.await;

        Ok(())
    }

    fn spawn_session(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        report_tx: &mpsc::Sender<SessionReport>,
    ) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session_shutdown = CancellationToken::new();
        let config = Arc::clone(&self.config);
        let report_tx = report_tx.clone();
        let driver_shutdown = session_shutdown.clone();

        let driver = tokio::spawn(async move {
            info!(session_id, peer = %peer, "session accepted");
            let report = session::run(session_id, stream, config, driver_shutdown).await;
            let _ = report_tx.send(report).await;
        });

        self.sessions.insert(
            session_id,
            SessionHandle {
                shutdown: session_shutdown,
                driver,
            },
        );
    }

    /// Consumes session termination reports, removing each session from the
    /// map and demoting `ConnectionClosed` to an info-level log since a
    /// hung-up peer is the normal end of a connection, not a failure.
    async fn collect_errors(
        sessions: Arc<DashMap<u64, SessionHandle>>,
        mut reports: mpsc::Receiver<SessionReport>,
    ) {
        while let Some(report) = reports.recv().await {
            if let Some((_, handle)) = sessions.remove(&report.session_id) {
                handle.shutdown.cancel();
            }
            if report.error.is_benign() {
                info!(session_id = report.session_id, "session closed");
            } else {
                error!(session_id = report.session_id, error = %report.error, "session failed");
            }
        }
    }

    /// Drains the session map and cancels every remaining session,
    /// bounding the wait on each driver task by the configured idle
    /// timeout so a wedged session can't stall shutdown forever.
    async fn shutdown_all(&self) {
        let handles: Vec<(u64, SessionHandle)> = self
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|id| self.sessions.remove(&id))
            .collect();

        for (session_id, handle) in handles {
            handle.shutdown.cancel();
            if tokio::time::timeout(self.config.idle_timeout, handle.driver)
                .await
                .is_err()
            {
                warn!(session_id, "session did not stop within idle timeout during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfigBuilder;

    fn test_config(addr: &str) -> ProxyConfig {
        ProxyConfigBuilder::new()
            .listen_addr(addr.parse().unwrap())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn start_stops_cleanly_on_cancel_with_no_connections() {
        let manager = Manager::new(test_config("127.0.0.1:0"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        manager.start(cancel).await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_on_unbindable_address() {
        // Port 0 always binds; reusing an already-bound address does not.
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().unwrap();
        let manager = Manager::new(test_config(&addr.to_string()));
        let cancel = CancellationToken::new();
        let err = manager.start(cancel).await.unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
