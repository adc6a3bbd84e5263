use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the web app is served from; static manifest paths resolve against it
  pub origin: Url,
  pub backend: BackendConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  /// Where cache.db and offline.db live (defaults to $XDG_DATA_HOME/notesync)
  pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  /// Base URL of the hosted backend (e.g. https://abc.supabase.co)
  pub url: Url,
  /// Hostname substring identifying backend requests (defaults to the host of `url`)
  #[serde(default, rename = "host")]
  host_override: Option<String>,
  /// Path prefixes whose responses are note data
  #[serde(default = "default_api_prefixes")]
  pub api_prefixes: Vec<String>,
  /// Path prefix of the note save endpoint
  #[serde(default = "default_notes_path")]
  pub notes_path: String,
}

impl BackendConfig {
  pub fn host(&self) -> String {
    self
      .host_override
      .clone()
      .or_else(|| self.url.host_str().map(String::from))
      .unwrap_or_default()
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Partition name prefix
  #[serde(default = "default_cache_prefix")]
  pub prefix: String,
  /// Version tag embedded in every partition name; bump to invalidate
  #[serde(default = "default_cache_version")]
  pub version: String,
  /// Paths fetched into the static partition on install
  #[serde(default = "default_static_manifest")]
  pub static_manifest: Vec<String>,
  /// Path fragments that mark a static asset directory
  #[serde(default = "default_static_dirs")]
  pub static_dirs: Vec<String>,
  /// Path suffixes that mark a static asset (case-insensitive)
  #[serde(
    default = "default_static_extensions",
    deserialize_with = "deserialize_lowercase_list"
  )]
  pub static_extensions: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: default_cache_prefix(),
      version: default_cache_version(),
      static_manifest: default_static_manifest(),
      static_dirs: default_static_dirs(),
      static_extensions: default_static_extensions(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncConfig {
  /// Endpoint queued notes are replayed against (defaults to backend url + notes path)
  pub endpoint: Option<Url>,
  /// URL probed by the connectivity monitor (defaults to the origin)
  pub probe_url: Option<Url>,
  pub probe_interval_secs: Option<u64>,
  /// Scheduled sync interval while online
  pub interval_secs: Option<u64>,
}

impl SyncConfig {
  pub fn probe_interval_secs(&self) -> u64 {
    self.probe_interval_secs.unwrap_or(30)
  }

  pub fn interval_secs(&self) -> u64 {
    self.interval_secs.unwrap_or(300)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfig {
  /// Whole-request timeout; unset leaves it to the OS network stack
  pub timeout_secs: Option<u64>,
}

fn default_api_prefixes() -> Vec<String> {
  vec!["/api/".to_string(), "/rest/v1/".to_string()]
}

fn default_notes_path() -> String {
  "/rest/v1/notes".to_string()
}

fn default_cache_prefix() -> String {
  "notesync".to_string()
}

fn default_cache_version() -> String {
  "v1".to_string()
}

fn default_static_manifest() -> Vec<String> {
  ["/", "/index.html", "/manifest.json", "/favicon.ico"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_static_dirs() -> Vec<String> {
  vec!["/assets/".to_string(), "/uploads/".to_string()]
}

fn default_static_extensions() -> Vec<String> {
  [
    ".png",
    ".jpg",
    ".jpeg",
    ".gif",
    ".svg",
    ".webp",
    ".ico",
    ".webmanifest",
    "manifest.json",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn deserialize_lowercase_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./notesync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/notesync/config.yaml
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
        "No configuration file found. Create one at ~/.config/notesync/config.yaml\n\
                 with at least `origin:` and `backend: {{ url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("notesync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("notesync").join("config.yaml");
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
    let config: Self = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  /// Reject values that would only fail later, at runtime.
  fn validate(&self) -> Result<()> {
    let intervals = [
      ("sync.probe_interval_secs", self.sync.probe_interval_secs),
      ("sync.interval_secs", self.sync.interval_secs),
      ("network.timeout_secs", self.network.timeout_secs),
    ];
    for (name, value) in intervals {
      if value == Some(0) {
        return Err(eyre!("{} must be greater than zero", name));
      }
    }
    Ok(())
  }

  /// Get the backend API key from the environment.
  ///
  /// Checks NOTESYNC_API_KEY. Requests go out unauthenticated when unset.
  pub fn get_api_key() -> Option<String> {
    std::env::var("NOTESYNC_API_KEY")
      .ok()
      .filter(|k| !k.is_empty())
  }

  /// URL the web app saves notes to.
  pub fn notes_url(&self) -> Result<Url> {
    self
      .backend
      .url
      .join(&self.backend.notes_path)
      .map_err(|e| eyre!("Invalid notes path {}: {}", self.backend.notes_path, e))
  }

  /// Endpoint queued notes are replayed against.
  pub fn sync_endpoint(&self) -> Result<Url> {
    match &self.sync.endpoint {
      Some(url) => Ok(url.clone()),
      None => self.notes_url(),
    }
  }

  pub fn probe_url(&self) -> Url {
    self
      .sync
      .probe_url
      .clone()
      .unwrap_or_else(|| self.origin.clone())
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("notesync"))
  }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
  Config::from_yaml(
    r#"
origin: https://notes.example.com
backend:
  url: https://abc.supabase.co
"#,
  )
  .unwrap()
}
