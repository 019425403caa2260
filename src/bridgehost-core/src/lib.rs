pub mod config;
pub mod identifier;
pub mod logging;
pub mod mac;
pub mod paths;

pub use config::{
    AccessoryEntry, BridgeConfig, BridgedKind, ChildBridgeEntry, ChildBridgeOptions, Config,
    ConfigError, LogLevel, LoggingConfig, PlatformEntry, SupervisorConfig, ValidationError,
};
pub use identifier::{IdentifierError, PluginIdentifier, TypeIdentifier};
pub use logging::{init_logging, plugin_span, LoggingError, LoggingGuard};
pub use mac::{BridgeUsername, InvalidUsername};
pub use paths::{StorageError, StorageRoot};

pub const APP_NAME: &str = "bridgehost";
pub const DEFAULT_STORAGE_DIR: &str = ".bridgehost";

/// Host version, reported to plugins and in bridge metadata.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
