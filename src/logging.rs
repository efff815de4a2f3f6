//! Daily-rolling file logger, lifted out of `main` so both the binary and
//! `Session` (for tests that want real log output) can set it up the same
//! way.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{VoxError, VoxResult};

/// Initializes the global `tracing` subscriber with a daily-rolling file
/// writer under `logs/`. The returned guard must be held for the lifetime
/// of the process (or `Session`, which keeps it) — dropping it flushes and
/// stops the background writer thread.
pub fn init(log_dir: &str, log_prefix: &str) -> VoxResult<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(log_dir, log_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_timer(
                    fmt::time::OffsetTime::local_rfc_3339()
                        .map_err(|e| VoxError::Config(format!("local time offset: {e}")))?,
                )
                .with_ansi(false),
        )
        .with(filter)
        .try_init()
        .map_err(|e| VoxError::Config(format!("tracing init: {e}")))?;

    Ok(guard)
}
