use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin server the worker sits in front of
  pub origin: String,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  /// Paths added to the static partition at install time
  pub precache: Vec<String>,
  pub sync: SyncConfig,
  pub periodic: PeriodicConfig,
  pub notifications: NotificationsConfig,
  pub network: NetworkConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      precache: [
        "/",
        "/offline.html",
        "/manifest.json",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .map(String::from)
      .to_vec(),
      sync: SyncConfig::default(),
      periodic: PeriodicConfig::default(),
      notifications: NotificationsConfig::default(),
      network: NetworkConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Leading component of every long-lived partition name
  pub prefix: String,
  /// Version token; bumping it evicts the previous generation on activation
  pub version: String,
  pub limits: PartitionLimits,
  /// SQLite file (default: $XDG_DATA_HOME/offgrid/cache.db)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "solar".to_string(),
      version: "v2".to_string(),
      limits: PartitionLimits::default(),
      database: None,
    }
  }
}

/// Maximum entry counts. The static partition is unbounded.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PartitionLimits {
  pub dynamic: usize,
  pub api: usize,
  pub images: usize,
}

impl Default for PartitionLimits {
  fn default() -> Self {
    Self {
      dynamic: 50,
      api: 30,
      images: 100,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// `/api/` prefixes safe to serve stale
  pub read_only_api: Vec<String>,
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub image_extensions: BTreeSet<String>,
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
  /// Build output served with content hashes
  pub build_prefixes: Vec<String>,
  pub offline_page: String,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      read_only_api: [
        "/api/dashboard/overview",
        "/api/analytics",
        "/api/reports",
        "/api/products",
      ]
      .map(String::from)
      .to_vec(),
      image_extensions: ["png", "jpg", "jpeg", "gif", "webp", "svg", "avif"]
        .map(String::from)
        .into(),
      static_extensions: ["js", "css", "woff", "woff2", "ttf", "eot", "ico"]
        .map(String::from)
        .into(),
      build_prefixes: vec!["/_next/static/".to_string()],
      offline_page: "/offline.html".to_string(),
    }
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Entity types with an offline queue (`offline-<type>`, tag `sync-<type>`)
  pub types: Vec<String>,
  /// How often `serve` retries non-empty queues
  pub retry_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      types: vec!["quotes".to_string(), "projects".to_string()],
      retry_interval_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PeriodicConfig {
  pub tag: String,
  pub min_interval_hours: u64,
  pub endpoint: String,
}

impl Default for PeriodicConfig {
  fn default() -> Self {
    Self {
      tag: "update-dashboard".to_string(),
      min_interval_hours: 24,
      endpoint: "/api/dashboard/updates".to_string(),
    }
  }
}

impl PeriodicConfig {
  pub fn min_interval(&self) -> Duration {
    Duration::from_secs(self.min_interval_hours * 60 * 60)
  }
}

/// Default notification template; push payload fields override these.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  /// Deep link used when the payload carries no `data.url`
  pub default_url: String,
  /// Host of application windows to focus (defaults to the origin host)
  pub app_domain: Option<String>,
}

impl Default for NotificationsConfig {
  fn default() -> Self {
    Self {
      title: "Solar Platform".to_string(),
      body: "You have a new notification".to_string(),
      icon: "/icons/icon-192x192.png".to_string(),
      badge: "/icons/icon-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
      default_url: "/dashboard".to_string(),
      app_domain: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Write daily rolling log files here instead of stderr
  pub dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists. `OFFGRID_ORIGIN`
  /// overrides the origin either way.
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

    if let Ok(origin) = std::env::var("OFFGRID_ORIGIN") {
      config.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Get the cache database path.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid").join("cache.db"))
  }
}

/// The long-lived partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKind {
  Static,
  Dynamic,
  Api,
  Images,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 4] = [Self::Static, Self::Dynamic, Self::Api, Self::Images];

  fn label(self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Api => "api",
      Self::Images => "images",
    }
  }
}

/// Resolved settings handed to the router, strategies and worker at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub origin: Url,
  pub prefix: String,
  pub version: String,
  pub limits: PartitionLimits,
  pub routes: RoutesConfig,
  pub precache: Vec<Url>,
  pub offline_page: Url,
  pub sync_types: Vec<String>,
  pub periodic: PeriodicConfig,
  pub notifications: NotificationsConfig,
  /// Host that identifies application windows
  pub app_domain: String,
}

impl WorkerConfig {
  pub fn from_config(config: &Config) -> Result<Self> {
    let origin = Url::parse(&config.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", config.origin, e))?;

    let precache = config
      .precache
      .iter()
      .map(|path| join(&origin, path))
      .collect::<Result<Vec<_>>>()?;
    let offline_page = join(&origin, &config.routes.offline_page)?;

    let app_domain = match &config.notifications.app_domain {
      Some(domain) => domain.clone(),
      None => origin
        .host_str()
        .map(String::from)
        .ok_or_else(|| eyre!("Origin '{}' has no host", origin))?,
    };

    Ok(Self {
      origin,
      prefix: config.cache.prefix.clone(),
      version: config.cache.version.clone(),
      limits: config.cache.limits,
      routes: config.routes.clone(),
      precache,
      offline_page,
      sync_types: config.sync.types.clone(),
      periodic: config.periodic.clone(),
      notifications: config.notifications.clone(),
      app_domain,
    })
  }

  /// Versioned partition name, e.g. `solar-images-v2`.
  pub fn partition_name(&self, kind: PartitionKind) -> String {
    format!("{}-{}-{}", self.prefix, kind.label(), self.version)
  }

  /// Entry bound for a partition, if any.
  pub fn limit(&self, kind: PartitionKind) -> Option<usize> {
    match kind {
      PartitionKind::Static => None,
      PartitionKind::Dynamic => Some(self.limits.dynamic),
      PartitionKind::Api => Some(self.limits.api),
      PartitionKind::Images => Some(self.limits.images),
    }
  }

  pub fn offline_partition(&self, entity_type: &str) -> String {
    format!("offline-{}", entity_type)
  }

  /// Every partition that survives activation: the current generation of
  /// long-lived partitions plus the offline queues.
  pub fn active_partitions(&self) -> Vec<String> {
    PartitionKind::ALL
      .iter()
      .map(|kind| self.partition_name(*kind))
      .chain(self.sync_types.iter().map(|t| self.offline_partition(t)))
      .collect()
  }

  pub fn url(&self, path: &str) -> Result<Url> {
    join(&self.origin, path)
  }

  pub fn sync_endpoint(&self, entity_type: &str) -> Result<Url> {
    self.url(&format!("/api/{}/sync", entity_type))
  }
}

fn join(origin: &Url, path: &str) -> Result<Url> {
  origin
    .join(path)
    .map_err(|e| eyre!("Invalid path '{}' for origin {}: {}", path, origin, e))
}
