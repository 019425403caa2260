//! Accessories as the host sees them.
//!
//! The protocol engine owns the real accessory object; this crate wraps it in a
//! [`PlatformAccessory`] that adds plugin bookkeeping, persists the set of known
//! accessories per bridge, and keeps that set consistent across restarts.

pub mod cache;
pub mod category;
pub mod local;
pub mod platform_accessory;
pub mod protocol;
pub mod registry;

pub use cache::{AccessoryCache, CacheError, CacheResult};
pub use category::{generate_uuid, is_valid_uuid, Category};
pub use local::{LocalAccessory, LocalAccessoryFactory};
pub use platform_accessory::{Context, PlatformAccessory, SerializedPlatformAccessory};
pub use protocol::{
    service_types, AccessoryError, AccessoryFactory, Controller, IdentifyAck, IdentifyHandler,
    ProtocolAccessory, SerializedAccessory, Service,
};
pub use registry::{AccessoryRegistry, RegistryError};
