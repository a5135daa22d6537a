use anyhow::{Context, Result};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::LocalTime},
    prelude::*,
    EnvFilter,
};

pub const LOG_DIR_ENV: &str = "BATCH_PRINTER_LOG_DIR";
const DEFAULT_FILTER: &str = "info,batch_printer=debug,rumqttc=warn";

/// Human readable logs on stderr plus a daily JSON log file. `RUST_LOG`
/// overrides the default filter. Keep the guard alive until exit or the file
/// writer drops buffered lines.
pub fn init_logs() -> Result<WorkerGuard> {
    let log_dir = std::env::var(LOG_DIR_ENV).unwrap_or_else(|_| "logs".to_string());
    let file_appender = tracing_appender::rolling::daily(&log_dir, "batch_printer.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .context("invalid log filter")?;

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .json()
        .with_timer(LocalTime::rfc_3339())
        .with_writer(file_writer)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")?;
    tracing_log::LogTracer::init().context("forwarding log records")?;

    Ok(guard)
}
