use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ENV_LOG_FILTER;

pub const DEFAULT_FILTER: &str = "mediashift=info,sqlx=warn";
pub const LOG_FILE_PREFIX: &str = "mediashift.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG_FILTER).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the JSON subscriber on stderr and, when `log_dir` is given, a
/// daily rolling file sink next to it.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process. Calling this twice is harmless.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let _ = tracing_log::LogTracer::init();

    let stderr_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            if let Err(err) = std::fs::create_dir_all(dir) {
                eprintln!("log directory {} unavailable: {err}", dir.display());
                (None, None)
            } else {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .json()
                    .with_target(true)
                    .with_ansi(false)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
        }
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    guard
}
