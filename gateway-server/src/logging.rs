//! Tracing setup: stderr always, an optional non-blocking file layer.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Holds the file-appender worker guard. Dropping it stops the background
/// flush thread, so the caller must keep it alive for the process lifetime.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initializes the global tracing subscriber.
///
/// `logfile` is `None` when `--nologfile` was passed or config disabled it.
pub fn init(logfile: Option<&Path>) -> LoggingGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let (file_layer, file_guard) = match logfile {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("gateway.log"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(non_blocking)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LoggingGuard { _file_guard: file_guard }
}
