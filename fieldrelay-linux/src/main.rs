// Field relay daemon: ships capture files to the paired companion and feeds its telemetry
// into the local GPS pipe.

mod audit;
mod channel;
mod config;
mod discovery;
mod link;
mod queue;
mod supervisor;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fieldrelay=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

fn main() -> anyhow::Result<()> {
    let mut follow_location = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fieldrelay-linux {}", VERSION);
                return Ok(());
            }
            "--follow-location" => follow_location = true,
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    init_logging();
    let cfg = config::load();
    tracing::debug!(?cfg, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown_signal().await {
                tracing::error!("signal handler failed: {}", e);
            }
            tracing::info!("received shutdown signal");
            stopper.cancel();
        });

        if follow_location {
            follow(&cfg, shutdown).await
        } else {
            relay(&cfg, shutdown).await
        }
    })
}

async fn relay(cfg: &config::Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    channel::ensure_fifo(&cfg.pipe_path)
        .with_context(|| format!("creating telemetry pipe {}", cfg.pipe_path.display()))?;
    let audit = audit::AuditLog::open(&cfg.log_file)
        .with_context(|| format!("opening audit log {}", cfg.log_file.display()))?;
    let queue = Arc::new(queue::OutboundQueue::new(&cfg.queue_dir, cfg.sent_dir.clone()));
    queue.ensure_dirs().await?;
    tracing::info!(queue = %queue.dir().display(), pipe = %cfg.pipe_path.display(), "relay starting");

    let supervisor = supervisor::RelaySupervisor::new(
        Arc::new(discovery::MulticastBrowser::new(
            cfg.discovery_port,
            cfg.discovery_window(),
        )),
        Arc::new(link::TcpConnector::new(cfg.connect_timeout())),
        queue,
        audit,
        cfg.relay_settings(),
    );

    let mut status = supervisor.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let s = status.borrow_and_update().clone();
            tracing::debug!(
                phase = ?s.phase,
                sessions = s.sessions,
                failures = s.consecutive_failures,
                "relay status"
            );
        }
    });

    supervisor.run(shutdown).await?;
    tracing::info!("relay stopped");
    Ok(())
}

/// Act as the local location consumer: poll the pipe and log each accepted fix.
async fn follow(cfg: &config::Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut location = channel::LocationChannel::new(&cfg.pipe_path, cfg.pipe_backoff());
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            r = location.poll() => r,
        };
        match polled {
            Ok(channel::PollOutcome::Updated(r)) => tracing::info!(
                longitude = r.longitude,
                latitude = r.latitude,
                altitude = r.altitude,
                "location"
            ),
            Ok(channel::PollOutcome::Rejected) => {
                if let Some(r) = location.latest() {
                    tracing::debug!(age = ?r.age(), "keeping previous fix");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("{}", e),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
