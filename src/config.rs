use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{Tag, TagRelations};
use crate::client::ClientOptions;
use crate::dashboard;
use crate::fetch::RetryPolicy;
use crate::polling::PollingIntervals;

const DEFAULT_TOKEN_ENV: &str = "DASHQ_API_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  /// Replaces the built-in invalidation cascade when set
  #[serde(default)]
  pub tag_relations: Option<BTreeMap<Tag, Vec<Tag>>>,
  /// Poll interval in seconds per resource class; 0 disables
  #[serde(default = "default_polling")]
  pub polling: BTreeMap<String, u64>,
  #[serde(default)]
  pub watch: Vec<WatchConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  pub base_url: String,
  /// Environment variable holding the bearer token
  #[serde(default = "default_token_env")]
  pub token_env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub keep_unused_data_for_secs: u64,
  pub request_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      keep_unused_data_for_secs: 300,
      request_timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub backoff_multiplier: u32,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_retries: policy.max_retries,
      base_delay_ms: policy.base_delay.as_millis() as u64,
      backoff_multiplier: policy.backoff_multiplier,
      max_delay_ms: policy.max_delay.as_millis() as u64,
    }
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      base_delay: Duration::from_millis(config.base_delay_ms),
      backoff_multiplier: config.backoff_multiplier,
      max_delay: Duration::from_millis(config.max_delay_ms),
    }
  }
}

/// An endpoint the `watch` command subscribes to.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
  pub endpoint: String,
  #[serde(default)]
  pub args: serde_json::Value,
}

fn default_token_env() -> String {
  DEFAULT_TOKEN_ENV.to_string()
}

fn default_polling() -> BTreeMap<String, u64> {
  BTreeMap::from([
    (dashboard::MESSAGES_CLASS.to_string(), 30),
    (dashboard::ANALYTICS_CLASS.to_string(), 300),
  ])
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dashq.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dashq/config.yaml
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
        "No configuration file found. Create one at ~/.config/dashq/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dashq.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("dashq").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    // Fail early on a cyclic cascade
    config.tag_relations()?;
    Ok(config)
  }

  /// The configured invalidation cascade, or the dashboard default.
  pub fn tag_relations(&self) -> Result<TagRelations> {
    let relations = match &self.tag_relations {
      Some(edges) => TagRelations::new(edges.clone())?,
      None => dashboard::default_relations()?,
    };
    Ok(relations)
  }

  pub fn polling_intervals(&self) -> PollingIntervals {
    PollingIntervals::new(
      self
        .polling
        .iter()
        .map(|(class, secs)| (class.clone(), Duration::from_secs(*secs)))
        .collect(),
    )
  }

  pub fn client_options(&self) -> ClientOptions {
    ClientOptions {
      keep_unused_data_for: Duration::from_secs(self.cache.keep_unused_data_for_secs),
      request_timeout: Duration::from_secs(self.cache.request_timeout_secs),
      retry: RetryPolicy::from(&self.retry),
      polling: self.polling_intervals(),
      ..ClientOptions::default()
    }
  }

  /// Get the API token from the configured environment variable.
  ///
  /// Returns `None` when unset; the API may allow anonymous reads.
  pub fn get_api_token(&self) -> Option<String> {
    std::env::var(&self.api.token_env)
      .ok()
      .filter(|token| !token.is_empty())
  }
}
