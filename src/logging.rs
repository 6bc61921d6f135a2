//! Tracing subscriber setup.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{Config, LogConfig, LogOutput};

/// Environment variable that overrides the configured filter.
pub const LOG_ENV: &str = "TIDEWATER_LOG";

const LOG_FILE_PREFIX: &str = "tidewater.log";

/// Install the global subscriber.
///
/// File output is written through a non-blocking appender; keep the returned
/// guard alive until exit or buffered lines are lost.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
  let filter = build_env_filter(config)?;
  let registry = Registry::default().with(filter);

  match config.output {
    LogOutput::Stderr => {
      registry
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(None)
    }
    LogOutput::File => {
      let directory = log_directory(config)?;
      std::fs::create_dir_all(&directory)
        .map_err(|e| eyre!("Failed to create log directory: {}", e))?;

      let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      registry
        .with(
          fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;
      Ok(Some(guard))
    }
  }
}

fn build_env_filter(config: &LogConfig) -> Result<EnvFilter> {
  if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
    return Ok(filter);
  }
  EnvFilter::try_new(&config.level)
    .map_err(|e| eyre!("Invalid log level '{}': {}", config.level, e))
}

fn log_directory(config: &LogConfig) -> Result<PathBuf> {
  match &config.directory {
    Some(dir) => Ok(dir.clone()),
    None => Ok(Config::data_dir()?.join("logs")),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_invalid_level_is_rejected() {
    let config = LogConfig {
      level: "tidewater=notalevel".to_string(),
      ..LogConfig::default()
    };
    if std::env::var(LOG_ENV).is_err() {
      assert!(build_env_filter(&config).is_err());
    }
  }

  #[test]
  fn test_explicit_directory_wins() {
    let config = LogConfig {
      directory: Some(PathBuf::from("/tmp/tidewater-logs")),
      ..LogConfig::default()
    };
    assert_eq!(
      log_directory(&config).unwrap(),
      PathBuf::from("/tmp/tidewater-logs")
    );
  }
}
