//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::RelaySettings;

/// Floor for every loop period; a zero in the file would otherwise busy-spin.
const MIN_PERIOD: Duration = Duration::from_secs(1);
const MIN_DISCOVERY_WINDOW: Duration = Duration::from_millis(100);

fn secs_at_least_one(secs: u64) -> Duration {
    Duration::from_secs(secs).max(MIN_PERIOD)
}

/// Daemon configuration. File: ~/.config/fieldrelay/config.toml or /etc/fieldrelay/config.toml.
/// Env overrides: FIELDRELAY_<KEY> for each key, e.g. FIELDRELAY_QUEUE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Outbound capture queue (default /tmp/pcaps).
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,
    /// Telemetry pipe written by the receive path (default /tmp/gpsfifo).
    #[serde(default = "default_pipe_path")]
    pub pipe_path: PathBuf,
    /// Append-only audit log (default /var/log/iot.log).
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// When set, sent captures are moved here instead of deleted.
    #[serde(default)]
    pub sent_dir: Option<PathBuf>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// How long one browse round collects advertisements.
    #[serde(default = "default_discovery_window_ms")]
    pub discovery_window_ms: u64,
    /// Pause between browse rounds that found nothing.
    #[serde(default = "default_discovery_poll_secs")]
    pub discovery_poll_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_send_interval_secs")]
    pub send_interval_secs: u64,
    #[serde(default = "default_receive_interval_secs")]
    pub receive_interval_secs: u64,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Wait after the telemetry pipe is found missing.
    #[serde(default = "default_pipe_backoff_secs")]
    pub pipe_backoff_secs: u64,
    /// Warn after this many consecutive connect failures (0 disables).
    #[serde(default = "default_warn_after_failures")]
    pub warn_after_failures: u32,
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("/tmp/pcaps")
}
fn default_pipe_path() -> PathBuf {
    PathBuf::from("/tmp/gpsfifo")
}
fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/iot.log")
}
fn default_service_name() -> String {
    fieldrelay_core::DEFAULT_SERVICE_NAME.to_string()
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_discovery_window_ms() -> u64 {
    1500
}
fn default_discovery_poll_secs() -> u64 {
    2
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_reconnect_delay_secs() -> u64 {
    1
}
fn default_send_interval_secs() -> u64 {
    2
}
fn default_receive_interval_secs() -> u64 {
    7
}
fn default_receive_buffer_size() -> usize {
    1600
}
fn default_pipe_backoff_secs() -> u64 {
    5
}
fn default_warn_after_failures() -> u32 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
            pipe_path: default_pipe_path(),
            log_file: default_log_file(),
            sent_dir: None,
            service_name: default_service_name(),
            discovery_port: default_discovery_port(),
            discovery_window_ms: default_discovery_window_ms(),
            discovery_poll_secs: default_discovery_poll_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            send_interval_secs: default_send_interval_secs(),
            receive_interval_secs: default_receive_interval_secs(),
            receive_buffer_size: default_receive_buffer_size(),
            pipe_backoff_secs: default_pipe_backoff_secs(),
            warn_after_failures: default_warn_after_failures(),
        }
    }
}

impl Config {
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            service_name: self.service_name.clone(),
            discovery_poll: secs_at_least_one(self.discovery_poll_secs),
            reconnect_delay: secs_at_least_one(self.reconnect_delay_secs),
            send_interval: secs_at_least_one(self.send_interval_secs),
            receive_interval: secs_at_least_one(self.receive_interval_secs),
            receive_buffer_size: self.receive_buffer_size.max(1),
            pipe_path: self.pipe_path.clone(),
            warn_after_failures: self.warn_after_failures,
        }
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_millis(self.discovery_window_ms).max(MIN_DISCOVERY_WINDOW)
    }

    pub fn connect_timeout(&self) -> Duration {
        secs_at_least_one(self.connect_timeout_secs)
    }

    pub fn pipe_backoff(&self) -> Duration {
        secs_at_least_one(self.pipe_backoff_secs)
    }
}
