//! Tracing setup for the `dashq` binary.
//!
//! Events go to a daily rolling file under the user data directory. The
//! `watch` command also mirrors them to stderr.

use std::io;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "dashq=info";
const LOG_FILE: &str = "dashq.log";

/// Where log files are written: `$XDG_DATA_HOME/dashq/logs`, or `./logs`.
pub fn log_dir() -> PathBuf {
  dirs::data_dir()
    .map(|dir| dir.join("dashq").join("logs"))
    .unwrap_or_else(|| PathBuf::from("logs"))
}

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
///
/// The returned guard flushes buffered lines on drop; keep it alive until
/// exit.
pub fn init(to_stderr: bool) -> io::Result<WorkerGuard> {
  let dir = log_dir();
  std::fs::create_dir_all(&dir)?;

  let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE);
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  let file_layer = tracing_subscriber::fmt::layer()
    .with_writer(non_blocking)
    .with_ansi(false)
    .with_target(true)
    .with_filter(env_filter());

  let stderr_layer = to_stderr.then(|| {
    tracing_subscriber::fmt::layer()
      .with_writer(io::stderr)
      .compact()
      .with_filter(env_filter())
  });

  tracing_subscriber::registry()
    .with(file_layer)
    .with(stderr_layer)
    .init();

  tracing::debug!(dir = %dir.display(), "logging initialized");
  Ok(guard)
}
