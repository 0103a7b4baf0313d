//! Send and receive workers. Both run until their session token is cancelled or the link fails,
//! then report exactly one [`WorkerReport`] on the session's fan-in channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fieldrelay_core::integrity::hex_digest;
use fieldrelay_core::RelayError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLog;
use crate::channel::{append_line, is_no_reader};
use crate::link::TransferLink;
use crate::queue::OutboundQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Send,
    Receive,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Send => f.write_str("send"),
            WorkerKind::Receive => f.write_str("receive"),
        }
    }
}

#[derive(Debug)]
pub enum WorkerOutcome {
    Cancelled,
    Failed(RelayError),
}

#[derive(Debug)]
pub struct WorkerReport {
    pub kind: WorkerKind,
    pub outcome: WorkerOutcome,
}

/// Sleep for `interval` unless the session is cancelled first. Returns false on cancellation.
async fn tick(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

/// One pass over a queue snapshot. Returns the number of files sent.
/// Unreadable or undeletable files are skipped and retried next pass; a link error aborts the pass.
/// Cancellation is honoured between files: a file whose bytes went out is always completed.
pub async fn drain_once(
    queue: &OutboundQueue,
    link: &TransferLink,
    audit: &AuditLog,
    cancel: &CancellationToken,
) -> Result<usize, RelayError> {
    let files = queue.snapshot().await?;
    let mut sent = 0;
    for file in files {
        if cancel.is_cancelled() {
            break;
        }
        if queue.is_delivered(&file) {
            if let Err(e) = queue.complete(&file).await {
                audit.record_error(&e.to_string());
            }
            continue;
        }
        let bytes = match queue.read(&file).await {
            Ok(b) => b,
            Err(e) => {
                audit.record_error(&e.to_string());
                continue;
            }
        };
        // Session teardown closes the link, which ends a stuck send.
        link.send(&bytes).await?;
        audit.record(&format!(
            "Sending {} ({} bytes, sha256 {})",
            file.name,
            bytes.len(),
            hex_digest(&bytes)
        ));
        sent += 1;
        if let Err(e) = queue.complete(&file).await {
            audit.record_error(&e.to_string());
        }
    }
    Ok(sent)
}

pub async fn run_send_worker(
    queue: Arc<OutboundQueue>,
    link: Arc<TransferLink>,
    audit: AuditLog,
    interval: Duration,
    cancel: CancellationToken,
    report: mpsc::Sender<WorkerReport>,
) {
    let outcome = loop {
        if !tick(&cancel, interval).await {
            break WorkerOutcome::Cancelled;
        }
        match drain_once(&queue, &link, &audit, &cancel).await {
            Ok(0) => {}
            Ok(n) => tracing::debug!(files = n, "send pass complete"),
            Err(e) if e.is_link_fatal() => break WorkerOutcome::Failed(e),
            Err(e) => audit.record_error(&e.to_string()),
        }
    };
    tracing::debug!("send worker stopped");
    let _ = report
        .send(WorkerReport {
            kind: WorkerKind::Send,
            outcome,
        })
        .await;
}

/// One receive; appends whatever arrived to the pipe. Returns the byte count.
pub async fn receive_once(
    link: &TransferLink,
    pipe_path: &std::path::Path,
    buf: &mut [u8],
) -> Result<usize, RelayError> {
    let n = link.receive(buf).await?;
    if n > 0 {
        append_line(pipe_path, &buf[..n]).await?;
    }
    Ok(n)
}

pub async fn run_receive_worker(
    link: Arc<TransferLink>,
    pipe_path: PathBuf,
    audit: AuditLog,
    interval: Duration,
    buffer_size: usize,
    cancel: CancellationToken,
    report: mpsc::Sender<WorkerReport>,
) {
    let mut buf = vec![0u8; buffer_size];
    let outcome = loop {
        if !tick(&cancel, interval).await {
            break WorkerOutcome::Cancelled;
        }
        let r = tokio::select! {
            _ = cancel.cancelled() => break WorkerOutcome::Cancelled,
            r = receive_once(&link, &pipe_path, &mut buf) => r,
        };
        match r {
            Ok(n) => tracing::trace!(bytes = n, "telemetry received"),
            Err(e) if e.is_link_fatal() => break WorkerOutcome::Failed(e),
            Err(RelayError::LocalIo(e)) if is_no_reader(&e) => {
                tracing::debug!(path = %pipe_path.display(), "no telemetry consumer, reading dropped");
            }
            Err(e) => audit.record_error(&e.to_string()),
        }
    };
    tracing::debug!("receive worker stopped");
    let _ = report
        .send(WorkerReport {
            kind: WorkerKind::Receive,
            outcome,
        })
        .await;
}
