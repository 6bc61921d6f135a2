use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub queue: QueueConfig,
  pub cache: CacheConfig,
  pub prefetch: PrefetchConfig,
  pub network: NetworkConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Retry ceiling for requests that don't set their own
  pub default_max_retries: u32,
  /// Base delay before a failed request becomes eligible again; doubles per retry
  pub retry_delay_ms: u64,
  /// Per-attempt timeout; unset means an attempt may run forever
  pub operation_timeout_ms: Option<u64>,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      default_max_retries: 3,
      retry_delay_ms: 0,
      operation_timeout_ms: None,
    }
  }
}

impl QueueConfig {
  pub fn retry_delay(&self) -> Duration {
    Duration::from_millis(self.retry_delay_ms)
  }

  pub fn operation_timeout(&self) -> Option<Duration> {
    self.operation_timeout_ms.map(Duration::from_millis)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long before cached data is considered stale
  pub stale_time_secs: u64,
  /// Share of all entries removed by a pressure prune
  pub prune_fraction: f64,
  /// Write cache entries to storage on shutdown and restore them on startup
  pub persist: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      prune_fraction: 0.25,
      persist: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
  pub enabled: bool,
  /// Detail items warmed after a list is viewed
  pub detail_limit: usize,
  /// Number of most recent keys the rules look at
  pub history_limit: usize,
  /// Background fetches allowed at once; extra predictions are skipped
  pub max_in_flight: usize,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      detail_limit: 3,
      history_limit: 5,
      max_in_flight: 4,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// URL hit with HEAD to detect connectivity. Without one the layer stays online
  /// unless told otherwise.
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  pub probe_timeout_ms: u64,
  /// Probe latency above this marks the link as slow
  pub slow_threshold_ms: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 30,
      probe_timeout_ms: 3000,
      slow_threshold_ms: 800,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite database path (default: $XDG_DATA_HOME/tidewater/state.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
  /// Daily-rotated file in the log directory
  #[default]
  File,
  Stderr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive; TIDEWATER_LOG overrides it
  pub level: String,
  pub output: LogOutput,
  /// Log directory (default: $XDG_DATA_HOME/tidewater/logs)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      output: LogOutput::File,
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tidewater.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tidewater/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("tidewater.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tidewater").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    let fraction = self.cache.prune_fraction;
    if !(fraction > 0.0 && fraction <= 1.0) {
      return Err(eyre!(
        "cache.prune_fraction must be in (0, 1], got {}",
        fraction
      ));
    }
    if self.prefetch.detail_limit == 0 {
      return Err(eyre!("prefetch.detail_limit must be at least 1"));
    }
    if self.prefetch.max_in_flight == 0 {
      return Err(eyre!("prefetch.max_in_flight must be at least 1"));
    }
    Ok(())
  }

  /// Directory for persisted state and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tidewater"))
  }

  pub fn storage_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("state.db")),
    }
  }
}
