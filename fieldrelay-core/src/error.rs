//! Error taxonomy. Only [`LinkError`] ends a relay session; the rest are handled where they occur.

use std::io;
use std::path::PathBuf;

/// Failure on the transfer link. Always link-fatal.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("link closed")]
    Closed,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("link i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failure while browsing for the service advertisement.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Adapter not ready or temporarily unavailable; retried without logging.
    #[error("discovery device busy")]
    Busy,
    /// The host cannot do discovery at all (e.g. socket bind refused). Terminal.
    #[error("discovery unavailable: {0}")]
    Environment(#[source] io::Error),
    #[error("discovery i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("bad discovery frame: {0}")]
    Protocol(String),
}

/// Malformed or out-of-range telemetry line. Recovered locally.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry line does not match grammar: {0:?}")]
    Grammar(String),
    #[error("telemetry out of range: lon={longitude} lat={latitude} alt={altitude}")]
    OutOfRange {
        longitude: f64,
        latitude: f64,
        altitude: f64,
    },
}

/// Local filesystem failure on the outbound queue or the telemetry pipe.
#[derive(Debug, thiserror::Error)]
#[error("{op} {}: {source}", .path.display())]
pub struct LocalIoError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl LocalIoError {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Umbrella error for relay components.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    LocalIo(#[from] LocalIoError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

impl RelayError {
    /// True when the error means the current link can no longer be used.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, RelayError::Link(_))
    }
}
