use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::cache::SqliteStorage;
use crate::routes::Matcher;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Prefix of every store name; stores outside it are never touched
  pub namespace: String,
  /// Current cache generation. Bumping it is what triggers an upgrade.
  pub version: String,
  /// The agent's own origin; manifest paths are resolved against it
  pub origin: Url,
  /// Paths fetched and stored before a generation counts as installed
  #[serde(default)]
  pub precache: Vec<String>,
  /// Page served for navigations that fail on both network and store
  pub offline_document: Option<String>,
  #[serde(default)]
  pub routes: RoutesConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  /// Activate a freshly installed generation without waiting
  #[serde(default)]
  pub skip_waiting: bool,
  /// Take control of every connected client on activation
  #[serde(default)]
  pub claim_on_activate: bool,
  /// Address the proxy host listens on
  #[serde(default = "default_listen")]
  pub listen: String,
  /// Cache database (defaults to $XDG_DATA_HOME/cachet/cache.db)
  pub database: Option<PathBuf>,
  /// Directory for daily rolling log files, in addition to stderr
  pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
  /// Requests that must always reach the network
  #[serde(default = "default_network_only")]
  pub network_only: Vec<Matcher>,
  /// Static assets cached on first use
  #[serde(default = "default_lazy")]
  pub lazy: Vec<Matcher>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      network_only: default_network_only(),
      lazy: default_lazy(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  /// A fetch still pending after this long counts as a network failure
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
    }
  }
}

fn default_listen() -> String {
  "127.0.0.1:8787".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_network_only() -> Vec<Matcher> {
  vec![
    Matcher::Contains("/api/".into()),
    Matcher::Contains("supabase.co".into()),
    Matcher::Contains("analytics".into()),
  ]
}

fn default_lazy() -> Vec<Matcher> {
  let mut lazy = vec![
    Matcher::Contains("/images/".into()),
    Matcher::Contains("/icons/".into()),
  ];
  lazy.extend(
    [".jpg", ".jpeg", ".png", ".webp", ".svg", ".woff2"]
      .into_iter()
      .map(|suffix| Matcher::Suffix(suffix.into())),
  );
  lazy
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cachet.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cachet/config.yaml
  /// 4. ~/.config/cachet/config.yaml
  ///
  /// `CACHET_VERSION` overrides the configured version.
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
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/cachet/config.yaml\n\
                 See cachet.example.yaml for the format."
        ))
      }
    };

    if let Ok(version) = std::env::var("CACHET_VERSION") {
      config.version = version;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cachet.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cachet").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Check the settings that deserialization alone cannot.
  pub fn validate(&self) -> Result<()> {
    if self.namespace.is_empty() || self.version.is_empty() {
      return Err(eyre!("namespace and version must not be empty"));
    }
    if self.origin.cannot_be_a_base() {
      return Err(eyre!("origin must be an absolute http(s) URL: {}", self.origin));
    }
    if let Some(path) = self.precache.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("precache paths must start with '/': {}", path));
    }
    if let Some(offline) = &self.offline_document {
      if !self.precache.contains(offline) {
        return Err(eyre!(
          "offline_document {} must also be listed in precache",
          offline
        ));
      }
    }
    Ok(())
  }

  /// Name of the store holding this config's generation.
  pub fn store_name(&self) -> String {
    format!("{}-{}", self.namespace, self.version)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }
}
