//! Append-only audit log. Every entry is also emitted as a tracing event.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use fieldrelay_core::audit::format_now;

/// Cloneable handle to the audit sink. Writes are unbuffered, one line per entry.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl AuditLog {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(w: impl Write + Send + 'static) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(w))),
        }
    }

    pub fn record(&self, message: &str) {
        tracing::info!(target: "fieldrelay::audit", "{}", message);
        self.write_line(message);
    }

    /// Record an error condition; logged at warn level.
    pub fn record_error(&self, message: &str) {
        tracing::warn!(target: "fieldrelay::audit", "{}", message);
        self.write_line(message);
    }

    fn write_line(&self, message: &str) {
        let line = format_now(message);
        let mut sink = match self.sink.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = sink.write_all(line.as_bytes()).and_then(|_| sink.flush()) {
            tracing::error!("audit log write failed: {}", e);
        }
    }
}

/// In-memory sink shared with tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemorySink(pub Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Lines whose message (after the timestamp) starts with `prefix`.
    pub fn count_prefixed(&self, prefix: &str) -> usize {
        self.lines()
            .iter()
            .filter(|l| {
                l.split_once(": ")
                    .map_or(false, |(_, msg)| msg.starts_with(prefix))
            })
            .count()
    }
}

#[cfg(test)]
impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
