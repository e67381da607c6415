use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::RetryPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:3001";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// API origin; request paths already start with `/api`
  pub base_url: String,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: DEFAULT_API_URL.to_string(),
      timeout_secs: 10,
    }
  }
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How often the background sweep evicts expired entries
  pub gc_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      gc_interval_secs: 60,
    }
  }
}

impl CacheConfig {
  pub fn gc_interval(&self) -> Duration {
    Duration::from_secs(self.gc_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl RetrySettings {
  fn policy(&self) -> RetryPolicy {
    RetryPolicy::new(
      self.max_attempts,
      Duration::from_millis(self.base_delay_ms),
      Duration::from_millis(self.max_delay_ms),
    )
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub queries: RetrySettings,
  pub mutations: RetrySettings,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      queries: RetrySettings {
        max_attempts: 3,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
      },
      mutations: RetrySettings {
        max_attempts: 2,
        base_delay_ms: 1_000,
        max_delay_ms: 30_000,
      },
    }
  }
}

impl RetryConfig {
  pub fn query_policy(&self) -> RetryPolicy {
    self.queries.policy()
  }

  /// Mutations only ever retry transient failures.
  pub fn mutation_policy(&self) -> RetryPolicy {
    self.mutations.policy().conservative()
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Log directory (defaults to the data directory)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file, then apply environment overrides.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./replenish.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/replenish/config.yaml
  ///
  /// Without a file the built-in defaults are used.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.apply_env(std::env::var("REPLENISH_API_URL").ok());
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("replenish.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("replenish").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file parses as null
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  fn apply_env(&mut self, api_url: Option<String>) {
    if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
      self.api.base_url = url;
    }
  }

  /// Bearer token from REPLENISH_AUTH_TOKEN, if set.
  pub fn auth_token() -> Option<String> {
    std::env::var("REPLENISH_AUTH_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }

  /// Directory for the preferences database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("replenish"))
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    match &self.log.dir {
      Some(dir) => Ok(dir.clone()),
      None => Ok(Self::data_dir()?.join("logs")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.api.base_url, DEFAULT_API_URL);
    assert_eq!(config.api.timeout(), Duration::from_secs(10));
    assert_eq!(config.retry.query_policy(), RetryPolicy::queries());
    assert_eq!(config.retry.mutation_policy(), RetryPolicy::mutations());
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let config = Config::parse(
      "api:\n  base_url: https://api.example.com\nretry:\n  queries:\n    max_attempts: 5\n    base_delay_ms: 200\n    max_delay_ms: 1000\n",
    )
    .unwrap();

    assert_eq!(config.api.base_url, "https://api.example.com");
    assert_eq!(config.api.timeout_secs, 10);
    assert_eq!(config.retry.query_policy().max_attempts, 5);
    assert_eq!(config.retry.query_policy().max_delay, Duration::from_secs(1));
    assert_eq!(config.retry.mutations.max_attempts, 2);
    assert_eq!(config.log.level, "info");
  }

  #[test]
  fn test_env_overrides_base_url() {
    let mut config = Config::default();
    config.apply_env(Some("https://staging.example.com".into()));
    assert_eq!(config.api.base_url, "https://staging.example.com");

    config.apply_env(Some("  ".into()));
    assert_eq!(config.api.base_url, "https://staging.example.com");
  }

  #[test]
  fn test_load_explicit_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "cache:\n  gc_interval_secs: 5").unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.cache.gc_interval(), Duration::from_secs(5));
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/replenish.yaml"))).is_err());
  }
}
