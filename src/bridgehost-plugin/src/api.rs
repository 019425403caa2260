//! The surface plugins program against.
//!
//! Every call on [`HostApi`] is turned into an [`InternalApiEvent`] and queued
//! for the host; nothing here touches host state directly.

use bridgehost_accessory::{
    AccessoryError, AccessoryFactory, Category, PlatformAccessory, Service,
};
use bridgehost_core::{AccessoryEntry, IdentifierError, PlatformEntry, PluginIdentifier};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Builds an accessory plugin instance for one `[[accessories]]` entry.
pub type AccessoryConstructor =
    Arc<dyn Fn(&AccessoryEntry, &HostApi) -> Box<dyn AccessoryPlugin> + Send + Sync>;

/// Builds a platform plugin instance for one `[[platforms]]` entry.
pub type PlatformConstructor =
    Arc<dyn Fn(&PlatformEntry, &HostApi) -> Box<dyn PlatformPlugin> + Send + Sync>;

/// A single accessory whose services are fixed by its plugin.
pub trait AccessoryPlugin: Send {
    fn services(&self) -> Vec<Service>;

    fn identify(&self) {}
}

/// A plugin-managed group of accessories that may change at runtime.
pub trait PlatformPlugin: Send {
    /// Called once per cached accessory that belongs to this platform, before launch finishes.
    fn configure_accessory(&mut self, _accessory: &PlatformAccessory) {}

    /// All cached accessories have been handed over.
    fn did_finish_launching(&mut self) {}

    fn shutdown(&mut self) {}
}

/// A compiled-in plugin package.
pub trait Plugin: Send + Sync {
    /// Package identifier, e.g. `homebridge-dummy` or `@scope/homebridge-dummy`.
    fn identifier(&self) -> &str;

    /// Register accessory and platform types with the host.
    fn initialize(&self, api: &HostApi) -> Result<(), ApiError>;
}

pub enum InternalApiEvent {
    RegisterAccessory {
        name: String,
        plugin: Option<PluginIdentifier>,
        constructor: AccessoryConstructor,
    },
    RegisterPlatform {
        name: String,
        plugin: Option<PluginIdentifier>,
        constructor: PlatformConstructor,
    },
    PublishExternalAccessories {
        plugin: PluginIdentifier,
        accessories: Vec<PlatformAccessory>,
    },
    RegisterPlatformAccessories {
        plugin: PluginIdentifier,
        platform: String,
        accessories: Vec<PlatformAccessory>,
    },
    UpdatePlatformAccessories(Vec<PlatformAccessory>),
    UnregisterPlatformAccessories {
        plugin: PluginIdentifier,
        platform: String,
        uuids: Vec<String>,
    },
}

impl InternalApiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterAccessory { .. } => "registerAccessory",
            Self::RegisterPlatform { .. } => "registerPlatform",
            Self::PublishExternalAccessories { .. } => "publishExternalAccessories",
            Self::RegisterPlatformAccessories { .. } => "registerPlatformAccessories",
            Self::UpdatePlatformAccessories(_) => "updatePlatformAccessories",
            Self::UnregisterPlatformAccessories { .. } => "unregisterPlatformAccessories",
        }
    }
}

impl fmt::Debug for InternalApiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegisterAccessory { name, plugin, .. }
            | Self::RegisterPlatform { name, plugin, .. } => f
                .debug_struct(self.name())
                .field("name", name)
                .field("plugin", plugin)
                .finish_non_exhaustive(),
            Self::PublishExternalAccessories {
                plugin,
                accessories,
            } => f
                .debug_struct(self.name())
                .field("plugin", plugin)
                .field("accessories", accessories)
                .finish(),
            Self::RegisterPlatformAccessories {
                plugin,
                platform,
                accessories,
            } => f
                .debug_struct(self.name())
                .field("plugin", plugin)
                .field("platform", platform)
                .field("accessories", accessories)
                .finish(),
            Self::UpdatePlatformAccessories(accessories) => {
                f.debug_tuple(self.name()).field(accessories).finish()
            }
            Self::UnregisterPlatformAccessories {
                plugin,
                platform,
                uuids,
            } => f
                .debug_struct(self.name())
                .field("plugin", plugin)
                .field("platform", platform)
                .field("uuids", uuids)
                .finish(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Identifier(#[from] IdentifierError),
    #[error("'{name}' is not a valid accessory or platform name")]
    InvalidName { name: String },
    #[error("external accessory {uuid} must not be associated with platform '{platform}'")]
    ExternalWithPlatform { uuid: String, platform: String },
    #[error(transparent)]
    Accessory(#[from] AccessoryError),
    #[error("the host is no longer accepting events")]
    HostGone,
}

/// Handle given to plugins. Cheap to clone; all clones feed the same host.
#[derive(Clone)]
pub struct HostApi {
    events: mpsc::UnboundedSender<InternalApiEvent>,
    factory: Arc<dyn AccessoryFactory>,
}

impl HostApi {
    pub fn new(
        factory: Arc<dyn AccessoryFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<InternalApiEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events, factory }, rx)
    }

    pub fn version(&self) -> &'static str {
        bridgehost_core::version()
    }

    /// Register an accessory type for the plugin currently being initialized.
    pub fn register_accessory<F, A>(&self, name: &str, constructor: F) -> Result<(), ApiError>
    where
        F: Fn(&AccessoryEntry, &HostApi) -> A + Send + Sync + 'static,
        A: AccessoryPlugin + 'static,
    {
        self.emit(InternalApiEvent::RegisterAccessory {
            name: valid_name(name)?,
            plugin: None,
            constructor: accessory_constructor(constructor),
        })
    }

    /// Register an accessory type on behalf of a named plugin.
    pub fn register_accessory_for<F, A>(
        &self,
        plugin: &str,
        name: &str,
        constructor: F,
    ) -> Result<(), ApiError>
    where
        F: Fn(&AccessoryEntry, &HostApi) -> A + Send + Sync + 'static,
        A: AccessoryPlugin + 'static,
    {
        self.emit(InternalApiEvent::RegisterAccessory {
            name: valid_name(name)?,
            plugin: Some(PluginIdentifier::parse(plugin)?),
            constructor: accessory_constructor(constructor),
        })
    }

    pub fn register_platform<F, P>(&self, name: &str, constructor: F) -> Result<(), ApiError>
    where
        F: Fn(&PlatformEntry, &HostApi) -> P + Send + Sync + 'static,
        P: PlatformPlugin + 'static,
    {
        self.emit(InternalApiEvent::RegisterPlatform {
            name: valid_name(name)?,
            plugin: None,
            constructor: platform_constructor(constructor),
        })
    }

    pub fn register_platform_for<F, P>(
        &self,
        plugin: &str,
        name: &str,
        constructor: F,
    ) -> Result<(), ApiError>
    where
        F: Fn(&PlatformEntry, &HostApi) -> P + Send + Sync + 'static,
        P: PlatformPlugin + 'static,
    {
        self.emit(InternalApiEvent::RegisterPlatform {
            name: valid_name(name)?,
            plugin: Some(PluginIdentifier::parse(plugin)?),
            constructor: platform_constructor(constructor),
        })
    }

    /// Build a new accessory backed by the host's protocol engine.
    pub fn create_accessory(
        &self,
        display_name: &str,
        uuid: &str,
        category: Option<Category>,
    ) -> Result<PlatformAccessory, ApiError> {
        Ok(PlatformAccessory::new(
            self.factory.as_ref(),
            display_name,
            uuid,
            category,
        )?)
    }

    /// Publish accessories that are not bridged, each advertised on its own.
    pub fn publish_external_accessories(
        &self,
        plugin: &str,
        mut accessories: Vec<PlatformAccessory>,
    ) -> Result<(), ApiError> {
        let plugin = PluginIdentifier::parse(plugin)?;
        for accessory in &mut accessories {
            if let Some(platform) = accessory.associated_platform() {
                return Err(ApiError::ExternalWithPlatform {
                    uuid: accessory.uuid().to_string(),
                    platform: platform.to_string(),
                });
            }
            accessory.associate(plugin.clone(), None);
        }
        self.emit(InternalApiEvent::PublishExternalAccessories {
            plugin,
            accessories,
        })
    }

    pub fn register_platform_accessories(
        &self,
        plugin: &str,
        platform: &str,
        mut accessories: Vec<PlatformAccessory>,
    ) -> Result<(), ApiError> {
        let plugin = PluginIdentifier::parse(plugin)?;
        let platform = valid_name(platform)?;
        for accessory in &mut accessories {
            if accessory.associated_plugin().is_none() || accessory.associated_platform().is_none() {
                accessory.associate(plugin.clone(), Some(platform.clone()));
            }
        }
        self.emit(InternalApiEvent::RegisterPlatformAccessories {
            plugin,
            platform,
            accessories,
        })
    }

    pub fn update_platform_accessories(
        &self,
        accessories: Vec<PlatformAccessory>,
    ) -> Result<(), ApiError> {
        self.emit(InternalApiEvent::UpdatePlatformAccessories(accessories))
    }

    pub fn unregister_platform_accessories(
        &self,
        plugin: &str,
        platform: &str,
        uuids: Vec<String>,
    ) -> Result<(), ApiError> {
        self.emit(InternalApiEvent::UnregisterPlatformAccessories {
            plugin: PluginIdentifier::parse(plugin)?,
            platform: valid_name(platform)?,
            uuids,
        })
    }

    fn emit(&self, event: InternalApiEvent) -> Result<(), ApiError> {
        tracing::trace!(event = event.name(), "api event");
        self.events.send(event).map_err(|_| ApiError::HostGone)
    }
}

fn accessory_constructor<F, A>(constructor: F) -> AccessoryConstructor
where
    F: Fn(&AccessoryEntry, &HostApi) -> A + Send + Sync + 'static,
    A: AccessoryPlugin + 'static,
{
    Arc::new(
        move |entry: &AccessoryEntry, api: &HostApi| -> Box<dyn AccessoryPlugin> {
            Box::new(constructor(entry, api))
        },
    )
}

fn platform_constructor<F, P>(constructor: F) -> PlatformConstructor
where
    F: Fn(&PlatformEntry, &HostApi) -> P + Send + Sync + 'static,
    P: PlatformPlugin + 'static,
{
    Arc::new(
        move |entry: &PlatformEntry, api: &HostApi| -> Box<dyn PlatformPlugin> {
            Box::new(constructor(entry, api))
        },
    )
}

fn valid_name(name: &str) -> Result<String, ApiError> {
    if name.is_empty() || name.contains(['.', '/']) {
        return Err(ApiError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridgehost_accessory::{generate_uuid, service_types, LocalAccessoryFactory};

    struct ExampleAccessory;

    impl AccessoryPlugin for ExampleAccessory {
        fn services(&self) -> Vec<Service> {
            vec![Service::new(service_types::SWITCH, "TestSwitch")]
        }
    }

    struct ExamplePlatform;

    impl PlatformPlugin for ExamplePlatform {}

    const PLUGIN: &str = "homebridge-example";
    const ACCESSORY: &str = "MyCoolAccessory";
    const PLATFORM: &str = "MyCoolPlatform";

    fn api() -> (HostApi, mpsc::UnboundedReceiver<InternalApiEvent>) {
        HostApi::new(Arc::new(LocalAccessoryFactory))
    }

    fn example_accessory(_: &AccessoryEntry, _: &HostApi) -> ExampleAccessory {
        ExampleAccessory
    }

    fn example_platform(_: &PlatformEntry, _: &HostApi) -> ExamplePlatform {
        ExamplePlatform
    }

    #[test]
    fn register_accessory_with_plugin_identifier() {
        let (api, mut events) = api();
        api.register_accessory_for(PLUGIN, ACCESSORY, example_accessory)
            .unwrap();
        match events.try_recv().unwrap() {
            InternalApiEvent::RegisterAccessory { name, plugin, .. } => {
                assert_eq!(name, ACCESSORY);
                assert_eq!(plugin.unwrap().as_str(), PLUGIN);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn register_accessory_without_plugin_identifier() {
        let (api, mut events) = api();
        api.register_accessory(ACCESSORY, example_accessory)
            .unwrap();
        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            InternalApiEvent::RegisterAccessory { ref name, plugin: None, .. } if name == ACCESSORY
        ));
    }

    #[test]
    fn register_platform_with_plugin_identifier() {
        let (api, mut events) = api();
        api.register_platform_for(PLUGIN, PLATFORM, example_platform)
            .unwrap();
        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            InternalApiEvent::RegisterPlatform { ref name, plugin: Some(ref p), .. }
                if name == PLATFORM && p.as_str() == PLUGIN
        ));
    }

    #[test]
    fn register_platform_without_plugin_identifier() {
        let (api, mut events) = api();
        api.register_platform(PLATFORM, example_platform).unwrap();
        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            InternalApiEvent::RegisterPlatform { plugin: None, .. }
        ));
    }

    #[test]
    fn malformed_plugin_identifier_is_rejected() {
        let (api, mut events) = api();
        let err = api
            .register_platform_for("example", PLATFORM, example_platform)
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::Identifier(IdentifierError::InvalidPlugin { ref identifier }) if identifier == "example"
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn dotted_names_are_rejected() {
        let (api, _events) = api();
        let err = api
            .register_accessory("bad.name", example_accessory)
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidName { .. }));
    }

    #[test]
    fn platform_accessories_get_associated() {
        let (api, mut events) = api();
        let accessory = api
            .create_accessory("Lamp", &generate_uuid("lamp"), None)
            .unwrap();
        api.register_platform_accessories(PLUGIN, PLATFORM, vec![accessory])
            .unwrap();

        match events.try_recv().unwrap() {
            InternalApiEvent::RegisterPlatformAccessories { accessories, .. } => {
                let accessory = &accessories[0];
                assert_eq!(accessory.associated_plugin().unwrap().as_str(), PLUGIN);
                assert_eq!(accessory.associated_platform(), Some(PLATFORM));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn external_accessory_with_platform_is_rejected() {
        let (api, mut events) = api();
        let mut accessory = api
            .create_accessory("TV", &generate_uuid("tv"), Some(Category::TELEVISION))
            .unwrap();
        accessory.associate(PluginIdentifier::parse(PLUGIN).unwrap(), Some(PLATFORM.into()));

        let err = api
            .publish_external_accessories(PLUGIN, vec![accessory])
            .unwrap_err();
        assert!(matches!(err, ApiError::ExternalWithPlatform { .. }));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn external_accessory_is_associated_with_plugin_only() {
        let (api, mut events) = api();
        let accessory = api
            .create_accessory("TV", &generate_uuid("tv"), Some(Category::TELEVISION))
            .unwrap();
        api.publish_external_accessories(PLUGIN, vec![accessory])
            .unwrap();
        match events.try_recv().unwrap() {
            InternalApiEvent::PublishExternalAccessories { accessories, .. } => {
                assert!(accessories[0].is_external());
                assert_eq!(accessories[0].associated_plugin().unwrap().as_str(), PLUGIN);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn closed_host_reports_error() {
        let (api, events) = api();
        drop(events);
        let err = api
            .register_platform(PLATFORM, example_platform)
            .unwrap_err();
        assert!(matches!(err, ApiError::HostGone));
    }
}
