//! Logging setup for uagents using tracing.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_NAME: &str = "uagents.log";
const DEFAULT_FILTER: &str = "info,uagents=debug";

/// Set to `json` to write the log file as JSON lines.
const LOG_FORMAT_ENV: &str = "UAGENTS_LOG_FORMAT";

/// Initialize logging: console on stderr plus a daily rolling file in the
/// platform data directory. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// as long as the process logs.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_NAME));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let text_file = (!json).then(|| {
        fmt::layer()
            .with_writer(writer.clone())
            .with_ansi(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });
    let json_file = json.then(|| {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_thread_ids(true)
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(text_file)
        .with(json_file)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()?;

    tracing::debug!(log_dir = %log_dir.display(), json, "logging initialized");
    Ok((guard, log_dir))
}

fn get_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "uagents", "uagents")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
    Ok(dirs.data_dir().join("logs"))
}

/// Console-only subscriber for tests. Later calls are no-ops.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
