use crate::identifier::{IdentifierError, TypeIdentifier};
use crate::mac::BridgeUsername;
use crate::paths::{StorageError, StorageRoot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Keep cached accessories whose plugin is no longer loaded.
    #[serde(default)]
    pub keep_orphans: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub accessories: Vec<AccessoryEntry>,
    #[serde(default)]
    pub platforms: Vec<PlatformEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            bridge: BridgeConfig::default(),
            keep_orphans: false,
            logging: LoggingConfig::default(),
            supervisor: SupervisorConfig::default(),
            accessories: Vec::new(),
            platforms: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_name")]
    pub name: String,
    #[serde(default = "default_bridge_username")]
    pub username: BridgeUsername,
    #[serde(default = "default_bridge_pin")]
    pub pin: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: default_bridge_name(),
            username: default_bridge_username(),
            pin: default_bridge_pin(),
        }
    }
}

/// Moves an accessory or platform out of the main bridge into its own child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildBridgeOptions {
    pub username: BridgeUsername,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessoryEntry {
    /// `plugin.Name` or a bare accessory name.
    pub accessory: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bridge: Option<ChildBridgeOptions>,
    /// Everything else is handed to the plugin untouched.
    #[serde(flatten)]
    pub settings: toml::Table,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEntry {
    /// `plugin.Name` or a bare platform name.
    pub platform: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bridge: Option<ChildBridgeOptions>,
    #[serde(flatten)]
    pub settings: toml::Table,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgedKind {
    Accessory,
    Platform,
}

/// A configured child bridge, flattened out of the accessory/platform lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildBridgeEntry {
    pub username: BridgeUsername,
    pub name: String,
    pub kind: BridgedKind,
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl SupervisorConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_timeout_secs: default_ready_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            restart_delay_secs: default_restart_delay_secs(),
            max_restarts: default_max_restarts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Mirror log lines to stderr.
    #[serde(default = "default_console_enabled")]
    pub console: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            console: default_console_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare storage directories: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("bridge username {username} is used more than once")]
    DuplicateUsername { username: BridgeUsername },
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

impl Config {
    pub fn load_or_default(storage: &StorageRoot) -> Result<Self, ConfigError> {
        storage.ensure_exists()?;
        let path = storage.config_path()?;
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_toml(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }

        for entry in &self.accessories {
            TypeIdentifier::parse(&entry.accessory)?;
        }
        for entry in &self.platforms {
            TypeIdentifier::parse(&entry.platform)?;
        }

        let mut seen = BTreeSet::from([self.bridge.username.clone()]);
        for child in self.child_bridges() {
            if !seen.insert(child.username.clone()) {
                return Err(ValidationError::DuplicateUsername {
                    username: child.username,
                });
            }
        }
        Ok(())
    }

    /// Every entry that runs in its own child bridge, accessories first.
    pub fn child_bridges(&self) -> Vec<ChildBridgeEntry> {
        let accessories = self.accessories.iter().filter_map(|entry| {
            entry.bridge.as_ref().map(|bridge| ChildBridgeEntry {
                username: bridge.username.clone(),
                name: bridge
                    .name
                    .clone()
                    .or_else(|| entry.name.clone())
                    .unwrap_or_else(|| entry.accessory.clone()),
                kind: BridgedKind::Accessory,
                identifier: entry.accessory.clone(),
            })
        });
        let platforms = self.platforms.iter().filter_map(|entry| {
            entry.bridge.as_ref().map(|bridge| ChildBridgeEntry {
                username: bridge.username.clone(),
                name: bridge
                    .name
                    .clone()
                    .or_else(|| entry.name.clone())
                    .unwrap_or_else(|| entry.platform.clone()),
                kind: BridgedKind::Platform,
                identifier: entry.platform.clone(),
            })
        });
        accessories.chain(platforms).collect()
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_bridge_name() -> String {
    "Bridgehost".to_string()
}

fn default_bridge_username() -> BridgeUsername {
    BridgeUsername::from_seed(crate::APP_NAME)
}

fn default_bridge_pin() -> String {
    "031-45-154".to_string()
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    7
}

fn default_restart_delay_secs() -> u64 {
    7
}

fn default_max_restarts() -> u32 {
    5
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_console_enabled() -> bool {
    true
}
