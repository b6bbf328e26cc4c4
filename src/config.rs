//! dnsferry configuration
//!
//! Both endpoints run fine on defaults; a TOML file can override them and
//! command line flags override the file.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::wire::TunnelSuffix;
use crate::{Result, TunnelError};

/// Characters refused in a destination path
pub const FORBIDDEN_PATH_CHARS: &str = "#%&{}\\<>*?$!'\":@+`|=";

/// Default DNS port
pub const DNS_PORT: u16 = 53;

/// Sender configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Upstream resolver; read from `resolv_conf` when unset
    pub upstream: Option<IpAddr>,

    /// UDP port queries are sent to
    pub port: u16,

    /// Close retries per sequence, and whole-sequence attempts per transfer
    pub max_tries: u32,

    /// How long to wait for a confirmation after each query
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Resolver configuration consulted for the upstream address
    pub resolv_conf: PathBuf,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            upstream: None,
            port: DNS_PORT,
            max_tries: 3,
            ack_timeout: Duration::from_millis(1100),
            resolv_conf: PathBuf::from(crate::resolv::DEFAULT_RESOLV_CONF),
        }
    }
}

impl SenderConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_tries == 0 {
            return Err(TunnelError::Argument(
                "max_tries must be at least 1".to_string(),
            ));
        }

        if self.ack_timeout.is_zero() {
            return Err(TunnelError::Argument(
                "ack_timeout must be greater than zero".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(TunnelError::Argument("port must not be 0".to_string()));
        }

        Ok(())
    }
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Address the receiver binds
    pub listen_addr: SocketAddr,

    /// Create missing parent directories below the output directory
    pub create_dirs: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DNS_PORT)),
            create_dirs: true,
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}

/// Check a base host's characters and split it into the tunnel suffix
pub fn validate_base_host(base_host: &str) -> Result<TunnelSuffix> {
    if let Some(c) = base_host
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.'))
    {
        return Err(TunnelError::Argument(format!(
            "invalid character in base host: '{}'",
            c
        )));
    }

    TunnelSuffix::parse(base_host)
}

/// True when `path` names something strictly below the directory it is
/// joined onto: relative, no `..`, at least one normal component
pub fn is_confined_path(path: &Path) -> bool {
    let mut has_name = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => has_name = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    has_name
}

/// Reject destination paths with shell or URL metacharacters, and paths the
/// receiver would refuse to write
pub fn validate_destination_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(TunnelError::Argument(
            "destination path must not be empty".to_string(),
        ));
    }

    if let Some(c) = path.chars().find(|c| FORBIDDEN_PATH_CHARS.contains(*c)) {
        return Err(TunnelError::Argument(format!(
            "destination path contains forbidden character: '{}'",
            c
        )));
    }

    if !is_confined_path(Path::new(path)) {
        return Err(TunnelError::Argument(format!(
            "destination path must be relative and stay below the receiver's directory: \"{}\"",
            path
        )));
    }

    Ok(())
}

/// Parse the `-u` upstream resolver address
pub fn parse_upstream(ip: &str) -> Result<IpAddr> {
    ip.parse()
        .map_err(|_| TunnelError::Argument(format!("upstream DNS IP is invalid: \"{}\"", ip)))
}
