//! TOML-based configuration for the server.
//!
//! The server reads its configuration from the file given with `--config`,
//! or from the platform-appropriate default location:
//! - Windows:  `%APPDATA%\KVMOverIP\server.toml`
//! - Linux:    `~/.config/kvmoverip/server.toml`
//! - macOS:    `~/Library/Application Support/KVMOverIP/server.toml`
//!
//! # File layout (for beginners)
//!
//! ```toml
//! [network]
//! address = "0.0.0.0"
//! port = 24800
//!
//! [options]
//! restartable = true
//! address_in_use_backoff_secs = 10
//! heartbeat_ms = 5000
//!
//! [[screens]]
//! name = "desk"
//! aliases = ["desk.local"]
//!
//! [[screens]]
//! name = "laptop"
//!
//! [[links]]
//! screen = "desk"
//! edge = "right"
//! neighbour = "laptop"
//! ```
//!
//! Every section and field is optional.  Fields annotated with
//! `#[serde(default = "some_fn")]` take the value of `some_fn()` when absent,
//! so a missing or empty file yields a working single-screen configuration.
//!
//! # Screen names
//!
//! A screen is known by its canonical `name` and any number of `aliases`.
//! Lookups ignore ASCII case, so `DESK`, `desk` and `Desk.Local` all resolve
//! to the canonical name `desk`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use kvm_core::net::{NetworkAddress, SocketError, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A name is used by more than one screen.
    #[error("screen name `{name}` is used more than once")]
    DuplicateScreen { name: String },

    /// A name does not match any configured screen.
    #[error("unknown screen name `{name}`")]
    UnknownScreen { name: String },

    /// The listen address does not parse or resolve.
    #[error("invalid listen address: {0}")]
    Address(#[source] SocketError),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub screens: Vec<ScreenEntry>,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

/// Where the server listens for clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Host name or IP address to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_address")]
    pub address: String,
    /// TCP port clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Behaviour of the session when something goes wrong.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionsConfig {
    /// Retry recoverable failures instead of exiting.
    #[serde(default = "default_true")]
    pub restartable: bool,
    /// Seconds to wait before retrying when the listen port is taken.
    #[serde(default = "default_address_in_use_backoff_secs")]
    pub address_in_use_backoff_secs: u64,
    /// Interval of the server's client heartbeat; `0` disables it.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

/// One screen taking part in the layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScreenEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// Side of a screen the cursor leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Top,
    Bottom,
    Left,
    Right,
}

/// "Leaving `screen` through `edge` enters `neighbour`."
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkEntry {
    pub screen: String,
    pub edge: Edge,
    pub neighbour: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_true() -> bool {
    true
}
fn default_address_in_use_backoff_secs() -> u64 {
    10
}
fn default_heartbeat_ms() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            restartable: default_true(),
            address_in_use_backoff_secs: default_address_in_use_backoff_secs(),
            heartbeat_ms: default_heartbeat_ms(),
        }
    }
}

// ── Queries ───────────────────────────────────────────────────────────────────

impl ServerConfig {
    /// Resolves `name` (a canonical name or alias, any case) to the
    /// canonical screen name.
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.screens
            .iter()
            .find(|screen| {
                screen.name.eq_ignore_ascii_case(name)
                    || screen.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(name))
            })
            .map(|screen| screen.name.as_str())
    }

    pub fn is_known_screen(&self, name: &str) -> bool {
        self.canonical_name(name).is_some()
    }

    /// Adds a screen with no aliases.  Returns `false` if the name is taken.
    pub fn add_screen(&mut self, name: &str) -> bool {
        if self.is_known_screen(name) {
            return false;
        }
        self.screens.push(ScreenEntry {
            name: name.to_string(),
            aliases: Vec::new(),
        });
        true
    }

    /// The neighbour reached by leaving `screen` through `edge`.
    pub fn neighbour(&self, screen: &str, edge: Edge) -> Option<&str> {
        let screen = self.canonical_name(screen)?;
        self.links
            .iter()
            .find(|link| link.edge == edge && self.canonical_name(&link.screen) == Some(screen))
            .and_then(|link| self.canonical_name(&link.neighbour))
    }

    pub fn network_address(&self) -> NetworkAddress {
        NetworkAddress::new(self.network.address.clone(), self.network.port)
    }

    /// Resolves the configured address to the socket address to bind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Address`] if the host does not resolve.
    pub fn listen_address(&self) -> Result<SocketAddr, ConfigError> {
        let addresses = self.network_address().resolve().map_err(ConfigError::Address)?;
        addresses.into_iter().next().ok_or_else(|| {
            ConfigError::Address(SocketError::NoAddress {
                host: self.network.address.clone(),
            })
        })
    }

    /// Checks that names are unique and every link refers to known screens.
    ///
    /// # Errors
    ///
    /// [`ConfigError::DuplicateScreen`] or [`ConfigError::UnknownScreen`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: Vec<String> = Vec::new();
        for screen in &self.screens {
            for name in std::iter::once(&screen.name).chain(&screen.aliases) {
                let folded = name.to_ascii_lowercase();
                if seen.contains(&folded) {
                    return Err(ConfigError::DuplicateScreen { name: name.clone() });
                }
                seen.push(folded);
            }
        }
        for link in &self.links {
            for name in [&link.screen, &link.neighbour] {
                if !self.is_known_screen(name) {
                    return Err(ConfigError::UnknownScreen { name: name.clone() });
                }
            }
        }
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("server.toml"))
}

/// Loads and validates the config at `path`, returning
/// `ServerConfig::default()` if the file does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed, and the
/// [`ServerConfig::validate`] errors.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: ServerConfig = toml::from_str(&content)?;
            cfg.validate()?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Persists `config` to `path`, creating the parent directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &ServerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory with the `KVMOverIP` subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("KVMOverIP"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("kvmoverip"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join("Library").join("Application Support").join("KVMOverIP"))
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
