use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the list backend API
  #[serde(deserialize_with = "deserialize_base_url")]
  pub url: Url,
  /// Identity passed to every remote mutation
  pub actor: String,
  /// Per-request timeout enforced by the HTTP client
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
  10
}

/// Parse a base URL, normalized to end in a slash.
fn deserialize_base_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let raw = String::deserialize(deserializer)?;
  let normalized = if raw.ends_with('/') {
    raw
  } else {
    format!("{}/", raw)
  };
  Url::parse(&normalized).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite file under the data directory (or `storage.path`)
  #[default]
  Sqlite,
  /// Process memory only; nothing survives a restart
  Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  /// Override for the SQLite database location
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Dispatch attempts before a mutation is abandoned
  pub max_attempts: u32,
  pub base_backoff_ms: u64,
  pub max_backoff_ms: u64,
  /// Upper bound on a single dispatch attempt
  pub dispatch_timeout_ms: u64,
  /// Periodic flush, independent of connectivity events
  pub flush_interval_secs: u64,
  pub probe_interval_secs: u64,
  /// How often list views re-fetch the remote snapshot
  pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_backoff_ms: 1_000,
      max_backoff_ms: 30_000,
      dispatch_timeout_ms: 10_000,
      flush_interval_secs: 30,
      probe_interval_secs: 15,
      poll_interval_secs: 5,
    }
  }
}

impl SyncConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts.max(1),
      base_backoff: Duration::from_millis(self.base_backoff_ms),
      max_backoff: Duration::from_millis(self.max_backoff_ms.max(self.base_backoff_ms)),
      dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms.max(1)),
    }
  }

  pub fn flush_interval(&self) -> Duration {
    Duration::from_secs(self.flush_interval_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./listsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/listsync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create ./listsync.yaml or ~/.config/listsync/config.yaml\n\
                 See config.example.yaml in the listsync sources for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("listsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("listsync").join("config.yaml");
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

  /// Bearer token for the backend, from `LISTSYNC_TOKEN` if set.
  pub fn get_api_token() -> Option<String> {
    std::env::var("LISTSYNC_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.backend.request_timeout_secs.max(1))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml(
      "backend:\n  url: https://lists.example.com/api\n  actor: user_1\n",
    )
    .unwrap();

    assert_eq!(config.backend.url.as_str(), "https://lists.example.com/api/");
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.sync.max_attempts, 3);

    let policy = config.sync.retry_policy();
    assert_eq!(policy.base_backoff, Duration::from_secs(1));
    assert_eq!(policy.max_backoff, Duration::from_secs(30));
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
backend:
  url: http://localhost:8080/
  actor: me
  request_timeout_secs: 3
storage:
  backend: memory
sync:
  max_attempts: 5
  poll_interval_secs: 1
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert_eq!(config.sync.max_attempts, 5);
    assert_eq!(config.sync.flush_interval_secs, 30);
    assert_eq!(config.request_timeout(), Duration::from_secs(3));
    assert_eq!(config.backend.url.as_str(), "http://localhost:8080/");
  }

  #[test]
  fn test_example_config_parses() {
    let config = Config::from_yaml(include_str!("../config.example.yaml")).unwrap();
    assert_eq!(config.backend.actor, "user_123");
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert_eq!(config.storage.path, None);
    assert_eq!(config.sync.retry_policy(), SyncConfig::default().retry_policy());
  }

  #[test]
  fn test_rejects_bad_url() {
    assert!(Config::from_yaml("backend:\n  url: not a url\n  actor: me\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_errors() {
    let result = Config::load(Some(Path::new("/nonexistent/listsync.yaml")));
    assert!(result.is_err());
  }
}
