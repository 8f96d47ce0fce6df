//! Relay configuration loading.
//!
//! TOML file with built-in defaults; a missing file simply yields the
//! defaults.  Default config path: `helphub.toml` in the working
//! directory.  Secrets never live in the file: `KEYSTORE_PASSWORD` and
//! `ADMIN_PASSWORD` come from the environment only.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_FRAMED_PORT: u16 = 5000;
pub const DEFAULT_WEB_PORT: u16 = 8080;
pub const DEFAULT_ADMIN_PORT: u16 = 5001;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level relay configuration after defaults are applied.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub framed_port: u16,
    pub web_port: u16,
    pub admin_port: u16,
    /// Framed sessions with no inbound activity for this long are swept.
    pub connection_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub keystore_path: PathBuf,
    pub webapp_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Instance name announced on mDNS.
    pub service_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            framed_port: DEFAULT_FRAMED_PORT,
            web_port: DEFAULT_WEB_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            connection_timeout_secs: DEFAULT_TIMEOUT_SECS,
            data_dir: PathBuf::from("data"),
            keystore_path: PathBuf::from("helphub.keystore"),
            webapp_dir: PathBuf::from("webapp"),
            log_dir: PathBuf::from("logs"),
            service_name: "helphub".to_owned(),
        }
    }
}

impl RelayConfig {
    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("emergency.db")
    }

    pub fn message_log_path(&self) -> PathBuf {
        self.log_dir.join("messages.log")
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (every field optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    ports: Option<RawPorts>,
    timeouts: Option<RawTimeouts>,
    paths: Option<RawPaths>,
    discovery: Option<RawDiscovery>,
}

#[derive(Debug, Deserialize)]
struct RawPorts {
    framed: Option<u16>,
    web: Option<u16>,
    admin: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawTimeouts {
    connection_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPaths {
    data_dir: Option<String>,
    keystore: Option<String>,
    webapp_dir: Option<String>,
    log_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDiscovery {
    service_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "config I/O error: {s}"),
            ConfigError::Parse(s) => write!(f, "config parse error: {s}"),
            ConfigError::Invalid(s) => write!(f, "invalid config: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load config from the default path.  A missing file yields defaults.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(Path::new("helphub.toml"))
}

/// Load config from a custom path.  A missing file yields defaults; a
/// present but malformed file is an error.
pub fn load_config_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    if !path.exists() {
        return Ok(RelayConfig::default());
    }
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<RelayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let defaults = RelayConfig::default();

    let ports = raw.ports.unwrap_or(RawPorts {
        framed: None,
        web: None,
        admin: None,
    });
    let cfg = RelayConfig {
        framed_port: ports.framed.unwrap_or(defaults.framed_port),
        web_port: ports.web.unwrap_or(defaults.web_port),
        admin_port: ports.admin.unwrap_or(defaults.admin_port),
        connection_timeout_secs: raw
            .timeouts
            .and_then(|t| t.connection_secs)
            .unwrap_or(defaults.connection_timeout_secs),
        data_dir: raw
            .paths
            .as_ref()
            .and_then(|p| p.data_dir.as_deref())
            .map_or(defaults.data_dir, PathBuf::from),
        keystore_path: raw
            .paths
            .as_ref()
            .and_then(|p| p.keystore.as_deref())
            .map_or(defaults.keystore_path, PathBuf::from),
        webapp_dir: raw
            .paths
            .as_ref()
            .and_then(|p| p.webapp_dir.as_deref())
            .map_or(defaults.webapp_dir, PathBuf::from),
        log_dir: raw
            .paths
            .as_ref()
            .and_then(|p| p.log_dir.as_deref())
            .map_or(defaults.log_dir, PathBuf::from),
        service_name: raw
            .discovery
            .and_then(|d| d.service_name)
            .unwrap_or(defaults.service_name),
    };

    if cfg.connection_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "timeouts.connection_secs must be at least 1".to_owned(),
        ));
    }
    Ok(cfg)
}
