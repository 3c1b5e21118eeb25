use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub target: TargetConfig,
  pub relay: RelayConfig,
  pub cache: CacheConfig,
  pub http: HttpConfig,
  pub server: ServerConfig,
  pub log: LogConfig,
}

/// Which requests are intercepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
  /// Exact host name to match
  pub host: String,
  /// Literal, case-sensitive substring the URL path must contain
  pub path_segment: String,
}

impl Default for TargetConfig {
  fn default() -> Self {
    Self {
      host: "camara.leg.br".to_string(),
      path_segment: "/deputado/bandep/".to_string(),
    }
  }
}

/// Cross-origin relay used when the direct fetch fails.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
  pub endpoint: Url,
  /// Query parameter that carries the percent-encoded original URL
  pub query_param: String,
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      endpoint: Url::parse("https://api.allorigins.win/raw").expect("valid default relay URL"),
      query_param: "url".to_string(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
  /// Durable SQLite store
  #[default]
  Sqlite,
  /// In-process map, lost on exit
  Memory,
  /// Caching disabled
  None,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub backend: CacheBackend,
  /// Store name; several stores can live in one database file
  pub name: String,
  /// Database file (defaults to $XDG_DATA_HOME/bandep-proxy/cache.db)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: CacheBackend::default(),
      name: "images-proxy-v1".to_string(),
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("bandep-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  pub listen: SocketAddr,
  /// Fetch and relay non-matching URLs unmodified instead of rejecting them
  pub passthrough: bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
      passthrough: false,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Also write a daily-rotated log file into this directory
  pub dir: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bandep-proxy.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bandep-proxy/config.yaml
  ///
  /// Without a config file every setting takes its default.
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

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("bandep-proxy.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("bandep-proxy").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    // An empty document deserializes to unit, not to an empty mapping
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Apply BANDEP_PROXY_LISTEN and BANDEP_PROXY_RELAY from the environment.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(listen) = std::env::var("BANDEP_PROXY_LISTEN") {
      self.server.listen = listen
        .parse()
        .map_err(|e| eyre!("Invalid BANDEP_PROXY_LISTEN '{}': {}", listen, e))?;
    }

    if let Ok(relay) = std::env::var("BANDEP_PROXY_RELAY") {
      self.relay.endpoint =
        Url::parse(&relay).map_err(|e| eyre!("Invalid BANDEP_PROXY_RELAY '{}': {}", relay, e))?;
    }

    Ok(self)
  }
}
