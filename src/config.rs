use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  /// Origin to fetch from. Without it the cache runs in local mode.
  pub remote: Option<RemoteConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL; the cache key is appended to it for each fetch
  pub base_url: String,
  /// Request timeout in seconds
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  30
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
  /// SQLite database on disk
  #[default]
  Sqlite,
  /// Process memory, gone when the command exits
  Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long fetched values stay fresh
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  #[serde(default)]
  pub storage: StorageKind,
  /// Override for the SQLite database location
  pub path: Option<PathBuf>,
  /// Namespace inside the store
  #[serde(default = "default_box_name")]
  pub box_name: String,
}

fn default_ttl_secs() -> u64 {
  300
}

fn default_box_name() -> String {
  "default".to_string()
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      storage: StorageKind::default(),
      path: None,
      box_name: default_box_name(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./keycache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/keycache/config.yaml
  ///
  /// Falls back to defaults (local mode) when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(p) = explicit_path {
      if !p.exists() {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
      return Self::load_from_path(p);
    }

    match Self::find_config_file() {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("keycache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("keycache").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Get the API token for the origin from the environment, if set.
  ///
  /// Checks KEYCACHE_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("KEYCACHE_API_TOKEN")
      .ok()
      .filter(|token| !token.is_empty())
  }
}
