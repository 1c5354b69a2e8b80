//! Server configuration
//!
//! Configuration is an immutable value built once at startup (TOML file,
//! then `CSAFE_*` environment overrides, then CLI flags) and handed to the
//! server and every connection factory by reference.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::constants::{BLOCK_SIZE, IV_SIZE};
use crate::env::{env_get, env_get_opt};
use crate::error::ConfigError;

/// Which readiness multiplexing call backs the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventMethod {
    Poll,
    Select,
}

impl Default for EventMethod {
    fn default() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos",
                         target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))] {
                EventMethod::Poll
            } else {
                EventMethod::Select
            }
        }
    }
}

impl std::str::FromStr for EventMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poll" => Ok(EventMethod::Poll),
            "select" => Ok(EventMethod::Select),
            _ => Err(ConfigError::Invalid("event method must be poll or select")),
        }
    }
}

/// Listener / reactor settings shared by both tiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    /// Admission-control limit on concurrently accepted connections.
    pub max_connections: usize,
    /// Reactor wait timeout. 0 blocks indefinitely and disables housekeeping.
    pub poll_timeout_ms: u64,
    /// Inactivity after which a pollable is evicted (nonzero poll timeout only).
    pub idle_timeout_secs: u64,
    pub event_method: EventMethod,
    pub block_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 8080,
            max_connections: 10,
            poll_timeout_ms: 0,
            idle_timeout_secs: 30,
            event_method: EventMethod::default(),
            block_size: BLOCK_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, address: impl Into<String>, port: u16) -> Self {
        self.bind_address = address.into();
        self.bind_port = port;
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn poll_timeout_ms(mut self, ms: u64) -> Self {
        self.poll_timeout_ms = ms;
        self
    }

    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    pub fn event_method(mut self, method: EventMethod) -> Self {
        self.event_method = method;
        self
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// `None` means wait forever.
    pub fn poll_timeout(&self) -> Option<Duration> {
        match self.poll_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Apply `CSAFE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.max_connections = env_get("CSAFE_MAX_CONNECTIONS", self.max_connections);
        self.poll_timeout_ms = env_get("CSAFE_POLL_TIMEOUT_MS", self.poll_timeout_ms);
        self.idle_timeout_secs = env_get("CSAFE_IDLE_TIMEOUT_SECS", self.idle_timeout_secs);
        if let Some(method) = env_get_opt::<EventMethod>("CSAFE_EVENT_METHOD") {
            self.event_method = method;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.block_size < 128 || self.block_size % IV_SIZE != 0 {
            return Err(ConfigError::Invalid(
                "block_size must be a multiple of 16 and at least 128",
            ));
        }
        Ok(())
    }
}

/// A `username:password` pair guarding a block device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Value carried in the `Authorization` header of block requests.
    pub fn header_value(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

/// Backend (block device) configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockDeviceConfig {
    pub server: ServerConfig,
    pub file_name: PathBuf,
    /// Capacity in bytes, rounded down to whole blocks.
    pub file_size: u64,
    pub credential: Option<Credential>,
}

impl Default for BlockDeviceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            file_name: PathBuf::from("block_device.bin"),
            file_size: 64 * 1024 * 1024,
            credential: None,
        }
    }
}

impl BlockDeviceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = load_toml(path)?;
        config.server.apply_env_overrides();
        Ok(config)
    }

    pub fn blocks(&self) -> u32 {
        let blocks = self.file_size / self.server.block_size as u64;
        u32::try_from(blocks).unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if self.blocks() == 0 {
            return Err(ConfigError::Invalid("file_size must hold at least one block"));
        }
        Ok(())
    }
}

/// One block device as seen from the frontend.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Number of blocks this device contributes to the global block space.
    pub blocks: u32,
    pub credential: Option<Credential>,
}

/// Frontend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    pub server: ServerConfig,
    /// Blocks `0..root_blocks` hold root directory entries.
    pub root_blocks: u32,
    pub admin_password: Option<String>,
    pub devices: Vec<DeviceConfig>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            root_blocks: 1,
            admin_password: None,
            devices: Vec::new(),
        }
    }
}

impl FrontendConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = load_toml(path)?;
        config.server.apply_env_overrides();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("at least one block device is required"));
        }
        if self.devices.iter().any(|d| d.blocks == 0) {
            return Err(ConfigError::Invalid("every device must contribute at least one block"));
        }
        if self.root_blocks == 0 || self.root_blocks >= self.devices[0].blocks {
            return Err(ConfigError::Invalid(
                "root_blocks must be nonzero and fit inside the first device",
            ));
        }
        Ok(())
    }
}

fn load_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    debug!("Loading config from {:?}", path);
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}
