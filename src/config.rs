use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mail::gmail::DEFAULT_API_BASE;
use crate::mail::server::DEFAULT_SERVER_URL;
use crate::mail::CoordinatorOptions;

/// Environment variable holding an access token for the native backend.
/// When set, the proxy's `/auth/token` endpoint is not consulted.
pub const ACCESS_TOKEN_VAR: &str = "MAILROOM_ACCESS_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the proxy server
  pub server_url: String,
  pub native: NativeConfig,
  pub cache: CacheConfig,
  pub prefetch: PrefetchConfig,
  /// Default page size for list requests
  pub page_size: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server_url: DEFAULT_SERVER_URL.to_string(),
      native: NativeConfig::default(),
      cache: CacheConfig::default(),
      prefetch: PrefetchConfig::default(),
      page_size: 20,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NativeConfig {
  /// Use the Gmail API directly before falling back to the server
  pub enabled: bool,
  pub api_base: String,
}

impl Default for NativeConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      api_base: DEFAULT_API_BASE.trim_end_matches('/').to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Seconds a cached first page is served without revalidation
  pub collection_ttl_secs: u64,
  /// Seconds a fetched message body is kept
  pub item_ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      collection_ttl_secs: 30,
      item_ttl_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
  /// Worker pool width; 0 disables prefetch
  pub workers: usize,
  /// Bodies prefetched per first page
  pub count: usize,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self {
      workers: 3,
      count: 5,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./mailroom.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/mailroom/config.yaml
  ///
  /// No file at all means defaults; an explicit path that does not exist
  /// is an error.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("mailroom.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("mailroom").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse YAML text. Empty text yields defaults.
  pub fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    if config.page_size == 0 {
      return Err(eyre!("page_size must be at least 1"));
    }
    Ok(config)
  }

  pub fn coordinator_options(&self) -> CoordinatorOptions {
    CoordinatorOptions {
      collection_ttl: Duration::from_secs(self.cache.collection_ttl_secs),
      item_ttl: Duration::from_secs(self.cache.item_ttl_secs),
      prefetch_workers: self.prefetch.workers,
      prefetch_count: self.prefetch.count,
    }
  }

  /// Access token from the environment, if one is set and non-empty.
  pub fn access_token_from_env() -> Option<String> {
    std::env::var(ACCESS_TOKEN_VAR)
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
