//! Tracing setup.
//!
//! Environment:
//!   NOTESYNC_LOG      - env filter (default: "notesync=info")
//!   NOTESYNC_LOG_FILE - path of a daily-rolling log file; console only when unset

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "notesync=info";

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init(verbose: bool) -> Result<Option<WorkerGuard>> {
  let env_filter = if verbose {
    EnvFilter::new("notesync=debug")
  } else {
    EnvFilter::try_from_env("NOTESYNC_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
  };
  let registry = tracing_subscriber::registry().with(env_filter);

  let log_file = std::env::var("NOTESYNC_LOG_FILE").ok();
  let guard = if let Some(ref path) = log_file {
    let path = Path::new(path);
    let dir = path.parent().unwrap_or(Path::new("."));
    let file_name = path
      .file_name()
      .and_then(|f| f.to_str())
      .unwrap_or("notesync.log");

    let file_appender = tracing_appender::rolling::daily(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_writer(non_blocking)
          .with_ansi(false),
      )
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    Some(guard)
  } else {
    registry
      .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    None
  };

  tracing::debug!(
    log_file = log_file.as_deref().unwrap_or("(stderr)"),
    "logging initialized"
  );
  Ok(guard)
}
