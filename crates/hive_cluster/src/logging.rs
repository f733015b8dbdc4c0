//! Tracing setup for binaries embedding the channel.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. `RUST_LOG` overrides the filter passed in.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter: channel internals at debug, everything else at info.
pub const DEFAULT_FILTER: &str = "info,hive_cluster=debug";

fn env_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter))
}

/// Compact console output with thread names, so reader/writer/pinger lines
/// are distinguishable.
pub fn init_logging(filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(fmt::layer().with_target(false).with_thread_names(true).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

/// Console output plus a daily-rotated `hive-cluster` log file in `logs_dir`.
/// Keep the returned guard alive until exit or buffered lines are lost.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "hive-cluster");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(filter))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .with(fmt::layer().with_target(false).with_thread_names(true).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}
