use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the origin server that serves the SPA
  pub origin: Option<String>,
  /// Address the proxy listens on
  #[serde(default = "default_listen")]
  pub listen: String,
  #[serde(default)]
  pub cache: CacheConfig,
  /// Paths that must be present in the store right after install
  #[serde(default = "default_seed_assets")]
  pub seed_assets: Vec<String>,
  /// URL substrings that are never cached
  #[serde(default = "default_exclude")]
  pub exclude: Vec<String>,
  /// Activate a freshly installed version without waiting
  #[serde(default = "default_true")]
  pub skip_waiting: bool,
  #[serde(default)]
  pub update: UpdateConfig,
  #[serde(default)]
  pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Store name prefix; the version is appended (e.g. "ham-prep-v1")
  #[serde(default = "default_cache_name")]
  pub name: String,
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// SQLite database path (default: $XDG_DATA_HOME/shellcache/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: default_cache_name(),
      version: default_cache_version(),
      path: None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePolicy {
  /// Log that a new version is waiting
  #[default]
  Log,
  /// Tell the waiting version to activate right away
  Reload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
  /// Seconds between update checks
  #[serde(default = "default_update_interval")]
  pub interval_secs: u64,
  #[serde(default)]
  pub policy: UpdatePolicy,
}

impl Default for UpdateConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_update_interval(),
      policy: UpdatePolicy::default(),
    }
  }
}

impl UpdateConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_secs(self.interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout(),
    }
  }
}

fn default_listen() -> String {
  "127.0.0.1:8080".to_string()
}

fn default_cache_name() -> String {
  "ham-prep".to_string()
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_seed_assets() -> Vec<String> {
  [
    "/",
    "/manifest.json",
    "/favicon.svg",
    "/icons/icon-192.png",
    "/icons/icon-512.png",
    "/apple-touch-icon.png",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_exclude() -> Vec<String> {
  ["/rest/", "/auth/", "supabase"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_true() -> bool {
  true
}

fn default_update_interval() -> u64 {
  60 * 60
}

fn default_timeout() -> u64 {
  30
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      listen: default_listen(),
      cache: CacheConfig::default(),
      seed_assets: default_seed_assets(),
      exclude: default_exclude(),
      skip_waiting: true,
      update: UpdateConfig::default(),
      network: NetworkConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    match Self::locate(explicit_path)? {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  /// Resolve the config file that `load` would read, if any.
  fn locate(explicit_path: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(p) = explicit_path {
      if p.exists() {
        return Ok(Some(p.to_path_buf()));
      }
      return Err(eyre!("Config file not found: {}", p.display()));
    }
    Ok(Self::find_config_file())
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Name of the store that belongs to the configured version.
  pub fn version_tag(&self) -> String {
    format!("{}-{}", self.cache.name, self.cache.version)
  }

  /// Parsed origin URL, normalized to scheme://host[:port]/.
  pub fn origin_url(&self) -> Result<Url> {
    let raw = self
      .origin
      .as_deref()
      .ok_or_else(|| eyre!("No origin configured. Set `origin` in the config file or pass --origin."))?;

    let mut url = Url::parse(raw).map_err(|e| eyre!("Invalid origin URL '{}': {}", raw, e))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
      return Err(eyre!("Origin must be an http(s) URL with a host: {}", raw));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
  }

  /// Resolve the cache database path, falling back to the data directory.
  pub fn cache_path(&self) -> Result<PathBuf> {
    if let Some(p) = &self.cache.path {
      return Ok(p.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_match_app_shell() {
    let config = Config::parse("origin: http://localhost:5173\n").unwrap();
    assert_eq!(config.version_tag(), "ham-prep-v1");
    assert_eq!(config.seed_assets.len(), 6);
    assert_eq!(config.seed_assets[0], "/");
    assert_eq!(config.exclude, vec!["/rest/", "/auth/", "supabase"]);
    assert!(config.skip_waiting);
    assert_eq!(config.update.interval(), Duration::from_secs(3600));
    assert_eq!(config.update.policy, UpdatePolicy::Log);
  }

  #[test]
  fn test_overrides() {
    let yaml = r#"
origin: https://prep.example.org
cache:
  name: exam
  version: v7
seed_assets: ["/", "/manifest.json"]
exclude: ["/api/"]
skip_waiting: false
update:
  interval_secs: 60
  policy: reload
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.version_tag(), "exam-v7");
    assert_eq!(config.seed_assets, vec!["/", "/manifest.json"]);
    assert!(!config.skip_waiting);
    assert_eq!(config.update.policy, UpdatePolicy::Reload);
  }

  #[test]
  fn test_origin_is_normalized() {
    let config = Config {
      origin: Some("https://prep.example.org/some/path?x=1".to_string()),
      ..Config::default()
    };
    assert_eq!(config.origin_url().unwrap().as_str(), "https://prep.example.org/");
  }

  #[test]
  fn test_missing_origin_is_an_error() {
    assert!(Config::default().origin_url().is_err());
  }

  #[test]
  fn test_rejects_non_http_origin() {
    let config = Config {
      origin: Some("ftp://example.org".to_string()),
      ..Config::default()
    };
    assert!(config.origin_url().is_err());
  }
}
