//! Relay supervisor: discover, connect, run both workers, tear down on failure, reconnect.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fieldrelay_core::{DiscoveryError, PeerDescriptor};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::audit::AuditLog;
use crate::discovery::{discover, ServiceBrowser};
use crate::link::{Connector, TransferLink};
use crate::queue::OutboundQueue;
use crate::worker::{run_receive_worker, run_send_worker, WorkerOutcome, WorkerReport};

/// Timing and paths for the relay loop.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub service_name: String,
    pub discovery_poll: Duration,
    pub reconnect_delay: Duration,
    pub send_interval: Duration,
    pub receive_interval: Duration,
    pub receive_buffer_size: usize,
    pub pipe_path: PathBuf,
    pub warn_after_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Discovering,
    Connecting(PeerDescriptor),
    Active(PeerDescriptor),
    Stopped,
}

/// Health snapshot published on every phase change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub phase: Phase,
    /// Sessions that reached the active phase.
    pub sessions: u64,
    pub consecutive_failures: u32,
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    /// Process shutdown was requested.
    Shutdown,
    /// A worker failed; the message names the trigger.
    Failed(String),
}

pub struct RelaySupervisor {
    browser: Arc<dyn ServiceBrowser>,
    connector: Arc<dyn Connector>,
    queue: Arc<OutboundQueue>,
    audit: AuditLog,
    settings: RelaySettings,
    status: watch::Sender<RelayStatus>,
}

impl RelaySupervisor {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        connector: Arc<dyn Connector>,
        queue: Arc<OutboundQueue>,
        audit: AuditLog,
        settings: RelaySettings,
    ) -> Self {
        let (status, _) = watch::channel(RelayStatus {
            phase: Phase::Discovering,
            sessions: 0,
            consecutive_failures: 0,
        });
        Self {
            browser,
            connector,
            queue,
            audit,
            settings,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Run until `shutdown` is cancelled. Link failures never end the loop; only a terminal
    /// discovery environment error is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DiscoveryError> {
        self.audit.record("Starting service");
        let result = self.relay_loop(&shutdown).await;
        self.status.send_modify(|s| s.phase = Phase::Stopped);
        if let Err(e) = &result {
            self.audit.record_error(&e.to_string());
        }
        result
    }

    async fn relay_loop(&self, shutdown: &CancellationToken) -> Result<(), DiscoveryError> {
        loop {
            self.status.send_modify(|s| s.phase = Phase::Discovering);
            let peers = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                r = discover(
                    self.browser.as_ref(),
                    &self.settings.service_name,
                    self.settings.discovery_poll,
                    &self.audit,
                ) => r?,
            };
            // A single paired companion is assumed; take the first answer.
            let Some(peer) = peers.into_iter().next() else {
                continue;
            };

            self.status
                .send_modify(|s| s.phase = Phase::Connecting(peer.clone()));
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                r = self.connector.connect(&peer) => r,
            };
            let link = match connected {
                Ok(link) => link,
                Err(e) => {
                    self.connect_failed(&e.to_string());
                    if !self.pause(shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            self.audit
                .record(&format!("Connected to companion device {}", peer.addr()));
            self.status.send_modify(|s| {
                s.phase = Phase::Active(peer.clone());
                s.sessions += 1;
                s.consecutive_failures = 0;
            });

            let session_id = uuid::Uuid::new_v4();
            let span = tracing::info_span!("session", id = %session_id, peer = %peer.addr());
            match self.run_session(link, shutdown).instrument(span).await {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Failed(reason) => {
                    self.audit.record_error(&reason);
                    self.audit.record("Restarting service");
                }
            }
            if !self.pause(shutdown).await {
                return Ok(());
            }
        }
    }

    fn connect_failed(&self, reason: &str) {
        self.audit.record_error(&format!("Connection failed: {}", reason));
        let mut failures = 0;
        self.status.send_modify(|s| {
            s.consecutive_failures = s.consecutive_failures.saturating_add(1);
            failures = s.consecutive_failures;
        });
        let every = self.settings.warn_after_failures;
        if every > 0 && failures % every == 0 {
            self.audit.record_error(&format!(
                "No connection to {} after {} consecutive attempts",
                self.settings.service_name, failures
            ));
        }
    }

    /// Wait the reconnect delay. Returns false if shutdown arrived meanwhile.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.settings.reconnect_delay) => true,
        }
    }

    /// Run both workers on `link` until both have reported. The first failure cancels the
    /// session and closes the link so the other worker stops too.
    async fn run_session(&self, link: TransferLink, shutdown: &CancellationToken) -> SessionEnd {
        let link = Arc::new(link);
        let session = shutdown.child_token();
        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(2);

        tokio::spawn(
            run_send_worker(
                self.queue.clone(),
                link.clone(),
                self.audit.clone(),
                self.settings.send_interval,
                session.clone(),
                report_tx.clone(),
            )
            .in_current_span(),
        );
        tokio::spawn(
            run_receive_worker(
                link.clone(),
                self.settings.pipe_path.clone(),
                self.audit.clone(),
                self.settings.receive_interval,
                self.settings.receive_buffer_size,
                session.clone(),
                report_tx,
            )
            .in_current_span(),
        );
        tracing::info!(peer = %link.peer().addr(), "workers started");

        let mut failure: Option<String> = None;
        let mut reports = 0;
        loop {
            let report = tokio::select! {
                r = report_rx.recv() => match r {
                    Some(r) => r,
                    None => break,
                },
                // Shutdown: unblock any send or receive still in flight.
                _ = session.cancelled(), if !link.is_closed() => {
                    link.close();
                    continue;
                }
            };
            reports += 1;
            match report.outcome {
                WorkerOutcome::Failed(e) => {
                    tracing::warn!(worker = %report.kind, "worker failed: {}", e);
                    failure.get_or_insert_with(|| format!("{} worker: {}", report.kind, e));
                    session.cancel();
                    link.close();
                }
                WorkerOutcome::Cancelled => {
                    tracing::debug!(worker = %report.kind, "worker cancelled");
                }
            }
        }
        link.close();
        session.cancel();

        if reports < 2 && failure.is_none() && !shutdown.is_cancelled() {
            failure = Some("worker exited without reporting".to_string());
        }
        match failure {
            _ if shutdown.is_cancelled() => SessionEnd::Shutdown,
            Some(reason) => SessionEnd::Failed(reason),
            None => SessionEnd::Failed("session ended".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemorySink;
    use crate::discovery::tests::ScriptedBrowser;
    use crate::link::tests::test_peer;
    use crate::queue::tests::{enqueue, scratch_dir};
    use async_trait::async_trait;
    use fieldrelay_core::LinkError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Fails the first `failures` attempts, then hands out duplex links; peer ends go to the test.
    struct FlakyConnector {
        failures: usize,
        attempts: AtomicUsize,
        ends_tx: mpsc::UnboundedSender<DuplexStream>,
    }

    impl FlakyConnector {
        fn new(failures: usize) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
            let (ends_tx, ends_rx) = mpsc::unbounded_channel();
            (
                Self {
                    failures,
                    attempts: AtomicUsize::new(0),
                    ends_tx,
                },
                ends_rx,
            )
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, peer: &PeerDescriptor) -> Result<TransferLink, LinkError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(LinkError::Connect {
                    addr: peer.addr().to_string(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let (r, w) = tokio::io::split(ours);
            let _ = self.ends_tx.send(theirs);
            Ok(TransferLink::new(peer.clone(), r, w))
        }
    }

    fn settings(pipe_path: PathBuf) -> RelaySettings {
        RelaySettings {
            service_name: fieldrelay_core::DEFAULT_SERVICE_NAME.to_string(),
            discovery_poll: Duration::from_millis(5),
            reconnect_delay: Duration::ZERO,
            send_interval: Duration::from_millis(10),
            receive_interval: Duration::from_millis(10),
            receive_buffer_size: 1600,
            pipe_path,
            warn_after_failures: 3,
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<RelayStatus>,
        pred: impl Fn(&RelayStatus) -> bool,
    ) -> RelayStatus {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
            .await
            .expect("status not reached in time")
            .expect("supervisor dropped")
            .clone()
    }

    #[tokio::test]
    async fn session_starts_only_after_connect_succeeds() {
        let dir = scratch_dir("supervisor");
        let queue = Arc::new(OutboundQueue::new(dir.join("out"), None));
        queue.ensure_dirs().await.unwrap();
        let browser = Arc::new(ScriptedBrowser::new(vec![], vec![test_peer()]));
        let (connector, _ends) = FlakyConnector::new(3);
        let connector = Arc::new(connector);
        let mem = MemorySink::default();
        let supervisor = Arc::new(RelaySupervisor::new(
            browser,
            connector.clone(),
            queue,
            AuditLog::from_writer(mem.clone()),
            settings(dir.join("gpsfifo")),
        ));
        let mut status = supervisor.subscribe();
        let shutdown = CancellationToken::new();
        let handle = {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        };

        let active = wait_for(&mut status, |s| matches!(s.phase, Phase::Active(_))).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(active.sessions, 1);
        assert_eq!(active.consecutive_failures, 0);
        assert_eq!(mem.count_prefixed("Connection failed"), 3);
        assert_eq!(mem.count_prefixed("No connection to EyeOfTechnology after 3"), 1);
        assert_eq!(mem.count_prefixed("Connected to companion device"), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(supervisor.subscribe().borrow().phase, Phase::Stopped);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn receive_failure_tears_down_and_reconnects() {
        let dir = scratch_dir("supervisor");
        let queue = Arc::new(OutboundQueue::new(dir.join("out"), None));
        queue.ensure_dirs().await.unwrap();
        let browser = Arc::new(ScriptedBrowser::new(vec![], vec![test_peer()]));
        let (connector, mut ends) = FlakyConnector::new(0);
        let mem = MemorySink::default();
        let supervisor = Arc::new(RelaySupervisor::new(
            browser.clone(),
            Arc::new(connector),
            queue.clone(),
            AuditLog::from_writer(mem.clone()),
            settings(dir.join("gpsfifo")),
        ));
        let mut status = supervisor.subscribe();
        let shutdown = CancellationToken::new();
        let handle = {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        };

        let first = ends.recv().await.unwrap();
        wait_for(&mut status, |s| s.sessions == 1).await;
        // Companion hangs up: receive sees EOF, the send side must stop with it.
        drop(first);

        let mut second = ends.recv().await.unwrap();
        wait_for(&mut status, |s| s.sessions == 2).await;
        assert_eq!(browser.calls.load(Ordering::SeqCst), 2);
        assert_eq!(mem.count_prefixed("Restarting service"), 1);
        assert_eq!(mem.count_prefixed("receive worker: peer closed"), 1);

        // The new session carries captures.
        enqueue(queue.dir(), &[("a.pcap", b"AAA")]);
        let mut got = [0u8; 3];
        tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"AAA");

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn shutdown_unblocks_send_to_stalled_peer() {
        let dir = scratch_dir("supervisor");
        let queue = Arc::new(OutboundQueue::new(dir.join("out"), None));
        queue.ensure_dirs().await.unwrap();
        // Larger than the duplex buffer; the peer never reads it.
        let big = vec![7u8; 256 * 1024];
        enqueue(queue.dir(), &[("big.pcap", &big[..])]);
        let browser = Arc::new(ScriptedBrowser::new(vec![], vec![test_peer()]));
        let (connector, mut ends) = FlakyConnector::new(0);
        let supervisor = Arc::new(RelaySupervisor::new(
            browser,
            Arc::new(connector),
            queue.clone(),
            AuditLog::from_writer(MemorySink::default()),
            settings(dir.join("gpsfifo")),
        ));
        let shutdown = CancellationToken::new();
        let handle = {
            let supervisor = supervisor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        };

        let _stalled = ends.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run must return while a send is stuck")
            .unwrap()
            .unwrap();
        assert_eq!(supervisor.subscribe().borrow().phase, Phase::Stopped);
        assert_eq!(crate::queue::tests::remaining(queue.dir()), ["big.pcap"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn terminal_discovery_error_ends_run() {
        let dir = scratch_dir("supervisor");
        let browser = Arc::new(ScriptedBrowser::new(
            vec![Err(DiscoveryError::Environment(
                std::io::ErrorKind::PermissionDenied.into(),
            ))],
            vec![],
        ));
        let (connector, _ends) = FlakyConnector::new(0);
        let supervisor = RelaySupervisor::new(
            browser,
            Arc::new(connector),
            Arc::new(OutboundQueue::new(&dir, None)),
            AuditLog::from_writer(MemorySink::default()),
            settings(dir.join("gpsfifo")),
        );
        let r = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(r, Err(DiscoveryError::Environment(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn shutdown_during_discovery_returns_ok() {
        let dir = scratch_dir("supervisor");
        let browser = Arc::new(ScriptedBrowser::new(vec![], vec![]));
        let (connector, _ends) = FlakyConnector::new(0);
        let supervisor = RelaySupervisor::new(
            browser,
            Arc::new(connector),
            Arc::new(OutboundQueue::new(&dir, None)),
            AuditLog::from_writer(MemorySink::default()),
            settings(dir.join("gpsfifo")),
        );
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });
        supervisor.run(shutdown).await.unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
