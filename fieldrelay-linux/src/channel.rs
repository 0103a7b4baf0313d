//! Local telemetry pipe: the receive path appends lines, the location consumer reads the latest one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fieldrelay_core::location::latest_line;
use fieldrelay_core::{LocalIoError, LocationRecord, LocationState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Append `bytes` plus a newline to the pipe. The handle is opened and closed per message.
/// The open never waits for a reader: a FIFO nobody reads fails with ENXIO (see [`is_no_reader`]).
pub async fn append_line(path: &Path, bytes: &[u8]) -> Result<(), LocalIoError> {
    let mut line = Vec::with_capacity(bytes.len() + 1);
    line.extend_from_slice(bytes);
    line.push(b'\n');
    let mut fd = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .await
        .map_err(|e| LocalIoError::new("open", path, e))?;
    fd.write_all(&line)
        .await
        .map_err(|e| LocalIoError::new("write", path, e))?;
    fd.flush()
        .await
        .map_err(|e| LocalIoError::new("write", path, e))
}

/// The pipe is a FIFO with no process reading it.
pub fn is_no_reader(e: &LocalIoError) -> bool {
    e.source.raw_os_error() == Some(libc::ENXIO)
}

/// Read everything currently buffered without waiting for a writer.
async fn read_available(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut fd = tokio::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .await?;
    let mut content = Vec::new();
    match fd.read_to_end(&mut content).await {
        Ok(_) => Ok(content),
        // Writer attached but idle: keep what was already drained.
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(content),
        Err(e) => Err(e),
    }
}

/// Create a FIFO at `path` unless something already exists there.
#[cfg(unix)]
pub fn ensure_fifo(path: &Path) -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    if path.exists() {
        return Ok(());
    }
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(err);
        }
    }
    Ok(())
}

/// What one poll of the pipe produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Pipe missing; the backoff has already been waited.
    Missing,
    /// Nothing written since the last read.
    Empty,
    Updated(LocationRecord),
    /// Latest line was malformed or out of range; the previous record is kept.
    Rejected,
}

/// Most-recent-wins view of the telemetry pipe.
pub struct LocationChannel {
    path: PathBuf,
    backoff: Duration,
    state: LocationState,
}

impl LocationChannel {
    pub fn new(path: impl Into<PathBuf>, backoff: Duration) -> Self {
        Self {
            path: path.into(),
            backoff,
            state: LocationState::new(),
        }
    }

    pub fn latest(&self) -> Option<&LocationRecord> {
        self.state.latest()
    }

    /// Read whatever is in the pipe and apply only its last line.
    pub async fn poll(&mut self) -> Result<PollOutcome, LocalIoError> {
        let content = match read_available(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "telemetry pipe missing");
                tokio::time::sleep(self.backoff).await;
                return Ok(PollOutcome::Missing);
            }
            Err(e) => return Err(LocalIoError::new("read", &self.path, e)),
        };
        let content = String::from_utf8_lossy(&content);
        let Some(line) = latest_line(&content) else {
            return Ok(PollOutcome::Empty);
        };
        match self.state.apply(line) {
            Ok(record) => Ok(PollOutcome::Updated(record)),
            Err(e) => {
                tracing::warn!("discarding telemetry: {}", e);
                Ok(PollOutcome::Rejected)
            }
        }
    }
}
