use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;

/// Keeps the background log writer alive; logs are flushed on drop.
pub struct Logger {
  _guard: WorkerGuard,
}

impl Logger {
  /// Log to a daily rolling file so stdout stays free for command output.
  ///
  /// RUST_LOG takes precedence over the configured level.
  pub fn init(config: &Config) -> Result<Self> {
    let filter = EnvFilter::try_from_default_env()
      .or_else(|_| EnvFilter::try_new(&config.log.level))
      .map_err(|e| eyre!("Invalid log level {:?}: {}", config.log.level, e))?;

    let log_dir = config.log_dir()?;
    std::fs::create_dir_all(&log_dir)
      .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(&log_dir, "replenish.log"));

    let file_layer = tracing_subscriber::fmt::layer()
      .with_writer(writer)
      .with_ansi(false)
      .with_target(true)
      .with_filter(filter);

    tracing_subscriber::registry()
      .with(file_layer)
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

    Ok(Self { _guard: guard })
  }
}
