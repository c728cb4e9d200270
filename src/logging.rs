//! Tracing setup for the command line tool.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the host. The CLI logs to journald on Linux when available and to a
//! daily rolling file otherwise. `--verbose` sends events to stderr instead.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter, e.g. `PROMPT_CLUSTER_LOG=debug`
/// or `PROMPT_CLUSTER_LOG=prompt_cluster::clustering=trace`.
pub const LOG_ENV: &str = "PROMPT_CLUSTER_LOG";

/// Where log events end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// journald on Linux, falling back to a file under `log_dir`.
    System { log_dir: Option<PathBuf> },
    /// Human-readable output on stderr.
    Stderr,
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber. Call once at startup.
pub fn init(target: LogTarget) -> Result<()> {
    let log_dir = match target {
        LogTarget::Stderr => {
            tracing_subscriber::registry()
                .with(filter("debug"))
                .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init()?;
            return Ok(());
        }
        LogTarget::System { log_dir } => log_dir,
    };

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter("info"))
                .with(journald_layer.with_syslog_identifier("prompt-cluster".to_string()))
                .try_init()?;

            tracing::info!("Logging initialized with journald backend");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "prompt-cluster.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // Dropping the guard stops the writer thread, so it lives for the process.
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter("info"))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!("Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prompt-cluster")
        .join("logs")
}
