//! Tracing setup for the command-line front end.

use std::path::Path;

use diskattach_shared::errors::{DiskError, DiskResult};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

const LOG_FILE: &str = "diskattach.log";

/// Initialize tracing.
///
/// Logs go to stderr (captured by journald when run from the boot unit).
/// With `log_dir`, they are also written to `<log_dir>/diskattach.log` with
/// daily rotation. Uses `RUST_LOG` for filtering, defaulting to `info`
/// (`debug` when `debug` is set).
///
/// The returned guard flushes the file writer when dropped; hold it until
/// the process is done logging.
pub fn init_logging(debug: bool, log_dir: Option<&Path>) -> DiskResult<Option<WorkerGuard>> {
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir).map_err(|e| {
            DiskError::Storage(format!(
                "Failed to create log directory {}: {}",
                dir.display(),
                e
            ))
        })?;
    }

    let default_level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (subscriber, guard) = subscriber(env_filter, log_dir);
    // Ignore the error if the host already installed a subscriber.
    let _ = tracing::subscriber::set_global_default(subscriber);
    Ok(guard)
}

fn subscriber(
    env_filter: EnvFilter,
    log_dir: Option<&Path>,
) -> (impl Subscriber + Send + Sync + 'static, Option<WorkerGuard>) {
    let (writer, guard, ansi) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (
                BoxMakeWriter::new(std::io::stderr.and(non_blocking)),
                Some(guard),
                false,
            )
        }
        None => (BoxMakeWriter::new(std::io::stderr), None, true),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .finish();
    (subscriber, guard)
}
