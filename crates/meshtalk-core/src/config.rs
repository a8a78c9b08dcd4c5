//! Node configuration.
//!
//! Loaded from a YAML file, by default `./config.yml` next to the
//! working directory. Every key is optional; a missing file means
//! all defaults.
//!
//! ```yaml
//! default_ip: 127.0.0.1
//! default_port: 1337
//! neighbours: 5
//! max_connections: 10
//! protocol:
//!   version: 1
//!   ttl: 5
//!   max_ttl: 7
//! bootstrap:
//!   ip: 127.0.0.1
//!   port: 1337
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file at {path}: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Node configuration as loaded from `config.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Reported local IP when hostname resolution is ambiguous; this is
    /// the address written into headers of originated messages.
    #[serde(default = "default_ip")]
    pub default_ip: Ipv4Addr,

    /// Listen port used when none is supplied on the command line.
    #[serde(default = "default_port")]
    pub default_port: u16,

    /// Target neighbour set size.
    #[serde(default = "default_neighbours")]
    pub neighbours: usize,

    /// Hard cap on outbound neighbours; also the listen backlog.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Protocol header parameters.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Default bootstrap peer, used when `-b` is not given.
    #[serde(default)]
    pub bootstrap: Option<BootstrapConfig>,
}

/// The `protocol:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Header version byte of originated messages.
    #[serde(default = "default_version")]
    pub version: u8,

    /// Initial TTL for newly originated messages.
    #[serde(default = "default_ttl")]
    pub ttl: u8,

    /// Upper bound on hop_count for forwarding.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u8,
}

/// The `bootstrap:` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl BootstrapConfig {
    /// The bootstrap peer as a socket address.
    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

fn default_ip() -> Ipv4Addr {
    Ipv4Addr::new(127, 0, 0, 1)
}

fn default_port() -> u16 {
    1337
}

fn default_neighbours() -> usize {
    5
}

fn default_max_connections() -> usize {
    10
}

fn default_version() -> u8 {
    1
}

fn default_ttl() -> u8 {
    5
}

fn default_max_ttl() -> u8 {
    7
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            version: default_version(),
            ttl: default_ttl(),
            max_ttl: default_max_ttl(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_ip: default_ip(),
            default_port: default_port(),
            neighbours: default_neighbours(),
            max_connections: default_max_connections(),
            protocol: ProtocolConfig::default(),
            bootstrap: None,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub const DEFAULT_PATH: &'static str = "config.yml";

    /// Loads the config from a specific file path.
    ///
    /// Returns `Ok(None)` if the file doesn't exist; the caller falls
    /// back to `Config::default()`.
    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_owned(),
            source: e,
        })?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseFile {
            path: path.to_owned(),
            source: e,
        })?;
        Ok(Some(config))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
