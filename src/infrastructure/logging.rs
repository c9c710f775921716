use crate::infrastructure::error::InfraError;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_FILE_NAME: &str = "commands.log";
const DEFAULT_FILTER: &str = "todo_client=info";

/// Installs the global subscriber: human-readable output on stderr plus one JSON
/// object per event appended to `<logs_dir>/commands.log`.
///
/// The returned guard flushes the file writer when dropped; keep it alive for the
/// lifetime of the application.
pub fn init_logging(logs_dir: &Path) -> Result<WorkerGuard, InfraError> {
    fs::create_dir_all(logs_dir)?;
    let appender = tracing_appender::rolling::never(logs_dir, LOG_FILE_NAME);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().json().with_writer(writer))
        .try_init()
        .map_err(|error| InfraError::InvalidConfig(format!("logging already initialized: {error}")))?;

    Ok(guard)
}
