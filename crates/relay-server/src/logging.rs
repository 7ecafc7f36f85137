use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "relay.log";

/// JSON lines into a daily file under `log_dir`, plus human-readable stderr when
/// asked. The returned guard flushes the file writer on drop.
pub(crate) fn init_tracing(log_dir: &Path, log_to_stderr: bool) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(writer)
        .with_target(false)
        .with_current_span(false);
    let stderr = log_to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json)
        .with(stderr)
        .try_init()?;
    Ok(guard)
}
