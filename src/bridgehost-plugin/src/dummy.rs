//! `homebridge-dummy`: a plugin compiled into the host that exposes plain
//! switches. Useful for trying a configuration end to end without any real
//! devices.
//!
//! ```toml
//! [[accessories]]
//! accessory = "DummySwitch"
//! name = "Porch"
//!
//! [[platforms]]
//! platform = "homebridge-dummy.DummyPlatform"
//! switches = ["Kitchen", "Hall"]
//! ```

use crate::api::{AccessoryPlugin, ApiError, HostApi, PlatformPlugin, Plugin};
use bridgehost_accessory::{generate_uuid, service_types, Category, PlatformAccessory, Service};
use bridgehost_core::{AccessoryEntry, PlatformEntry};
use std::collections::HashMap;

pub const IDENTIFIER: &str = "homebridge-dummy";
pub const SWITCH_ACCESSORY: &str = "DummySwitch";
pub const PLATFORM: &str = "DummyPlatform";

pub struct DummyPlugin;

impl Plugin for DummyPlugin {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn initialize(&self, api: &HostApi) -> Result<(), ApiError> {
        api.register_accessory(SWITCH_ACCESSORY, |entry, _| DummySwitch::new(entry))?;
        api.register_platform(PLATFORM, |entry, api| DummyPlatform::new(entry, api.clone()))?;
        Ok(())
    }
}

pub struct DummySwitch {
    name: String,
}

impl DummySwitch {
    fn new(entry: &AccessoryEntry) -> Self {
        Self {
            name: entry.name.clone().unwrap_or_else(|| SWITCH_ACCESSORY.to_string()),
        }
    }
}

impl AccessoryPlugin for DummySwitch {
    fn services(&self) -> Vec<Service> {
        vec![Service::new(service_types::SWITCH, &self.name)]
    }

    fn identify(&self) {
        tracing::info!(name = %self.name, "identify");
    }
}

/// Keeps one switch accessory per name listed in its `switches` setting.
pub struct DummyPlatform {
    api: HostApi,
    wanted: Vec<String>,
    /// Cached accessories handed back by the host, by UUID.
    cached: HashMap<String, String>,
}

impl DummyPlatform {
    fn new(entry: &PlatformEntry, api: HostApi) -> Self {
        let wanted = entry
            .settings
            .get("switches")
            .and_then(|value| value.as_array())
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            api,
            wanted,
            cached: HashMap::new(),
        }
    }

    pub fn switch_uuid(name: &str) -> String {
        generate_uuid(format!("{IDENTIFIER}:{PLATFORM}:{name}"))
    }

    fn create_switch(&self, name: &str) -> Result<PlatformAccessory, ApiError> {
        let mut accessory =
            self.api
                .create_accessory(name, &Self::switch_uuid(name), Some(Category::SWITCH))?;
        accessory.add_service(Service::new(service_types::SWITCH, name))?;
        accessory
            .context_mut()
            .insert("switch".into(), serde_json::Value::String(name.to_string()));
        Ok(accessory)
    }

    fn reconcile(&mut self) -> Result<(), ApiError> {
        let mut added = Vec::new();
        for name in &self.wanted {
            if !self.cached.contains_key(&Self::switch_uuid(name)) {
                added.push(self.create_switch(name)?);
            }
        }

        let stale: Vec<String> = self
            .cached
            .keys()
            .filter(|uuid| !self.wanted.iter().any(|name| &Self::switch_uuid(name) == *uuid))
            .cloned()
            .collect();

        if !added.is_empty() {
            tracing::info!(count = added.len(), "adding switches");
            self.api
                .register_platform_accessories(IDENTIFIER, PLATFORM, added)?;
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "removing switches no longer configured");
            for uuid in &stale {
                self.cached.remove(uuid);
            }
            self.api
                .unregister_platform_accessories(IDENTIFIER, PLATFORM, stale)?;
        }
        Ok(())
    }
}

impl PlatformPlugin for DummyPlatform {
    fn configure_accessory(&mut self, accessory: &PlatformAccessory) {
        tracing::debug!(name = %accessory.display_name(), "restoring cached switch");
        self.cached
            .insert(accessory.uuid().to_string(), accessory.display_name().to_string());
    }

    fn did_finish_launching(&mut self) {
        if let Err(e) = self.reconcile() {
            tracing::error!(error = %e, "failed to reconcile switches");
        }
    }
}
