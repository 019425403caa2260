use crate::category::Category;
use crate::protocol::{
    AccessoryError, AccessoryFactory, Controller, ProtocolAccessory, SerializedAccessory, Service,
};
use bridgehost_core::PluginIdentifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

/// Plugin-owned data stored with an accessory and persisted verbatim.
pub type Context = serde_json::Map<String, serde_json::Value>;

const IDENTIFY_CHANNEL_CAPACITY: usize = 16;

/// Cache record: plugin bookkeeping plus the engine's own serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedPlatformAccessory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginIdentifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub context: Context,
    #[serde(flatten)]
    pub accessory: SerializedAccessory,
}

/// An accessory as handed to plugins.
///
/// Display name, UUID and category are copied from the protocol object when
/// the wrapper is built. Services are not copied: [`PlatformAccessory::services`]
/// always reads the protocol object's live list.
pub struct PlatformAccessory {
    display_name: String,
    uuid: String,
    category: Category,
    context: Context,
    associated_plugin: Option<PluginIdentifier>,
    associated_platform: Option<String>,
    external: Box<dyn ProtocolAccessory>,
    identify_tx: broadcast::Sender<()>,
}

impl PlatformAccessory {
    pub fn new(
        factory: &dyn AccessoryFactory,
        display_name: &str,
        uuid: &str,
        category: Option<Category>,
    ) -> Result<Self, AccessoryError> {
        let external = factory.create(display_name, uuid)?;
        Ok(Self::from_external(external, category))
    }

    /// Wrap an already-built protocol object.
    pub fn from_external(mut external: Box<dyn ProtocolAccessory>, category: Option<Category>) -> Self {
        if let Some(category) = category {
            external.set_category(category);
        }

        let (identify_tx, _) = broadcast::channel(IDENTIFY_CHANNEL_CAPACITY);
        let forward = identify_tx.clone();
        external.set_identify_handler(Box::new(move |_paired, ack| {
            // No subscribers is fine; the engine must be acked regardless.
            let _ = forward.send(());
            ack();
        }));

        Self {
            display_name: external.display_name().to_string(),
            uuid: external.uuid().to_string(),
            category: external.category(),
            context: Context::new(),
            associated_plugin: None,
            associated_platform: None,
            external,
            identify_tx,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn set_category(&mut self, category: Category) {
        self.category = category;
        self.external.set_category(category);
    }

    pub fn services(&self) -> &[Service] {
        self.external.services()
    }

    pub fn add_service(&mut self, service: Service) -> Result<&Service, AccessoryError> {
        self.external.add_service(service)
    }

    pub fn remove_service(&mut self, service: &Service) -> Option<Service> {
        self.external.remove_service(service)
    }

    pub fn get_service(&self, name_or_type: &str) -> Option<&Service> {
        self.external.get_service(name_or_type)
    }

    pub fn get_service_by_id(&self, type_uuid: &str, subtype: &str) -> Option<&Service> {
        self.external.get_service_by_id(type_uuid, subtype)
    }

    pub fn configure_controller(&mut self, controller: Controller) -> Result<(), AccessoryError> {
        self.external.configure_controller(controller)
    }

    pub fn remove_controller(&mut self, controller: &Controller) -> Result<(), AccessoryError> {
        self.external.remove_controller(controller)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn set_context(&mut self, context: Context) {
        self.context = context;
    }

    pub fn associated_plugin(&self) -> Option<&PluginIdentifier> {
        self.associated_plugin.as_ref()
    }

    pub fn associated_platform(&self) -> Option<&str> {
        self.associated_platform.as_deref()
    }

    /// Record which plugin (and platform, if any) owns this accessory.
    pub fn associate(&mut self, plugin: PluginIdentifier, platform: Option<String>) {
        self.associated_plugin = Some(plugin);
        self.associated_platform = platform;
    }

    /// Published on its own rather than through a platform.
    pub fn is_external(&self) -> bool {
        self.associated_platform.is_none()
    }

    /// Fires once per identify request from a controller.
    pub fn subscribe_identify(&self) -> broadcast::Receiver<()> {
        self.identify_tx.subscribe()
    }

    pub fn external(&self) -> &dyn ProtocolAccessory {
        self.external.as_ref()
    }

    pub fn serialize(&self) -> SerializedPlatformAccessory {
        SerializedPlatformAccessory {
            plugin: self.associated_plugin.clone(),
            platform: self.associated_platform.clone(),
            context: self.context.clone(),
            accessory: self.external.serialize(),
        }
    }

    /// Rebuild from a cache record, reusing the protocol object the factory restores.
    pub fn deserialize(
        record: &SerializedPlatformAccessory,
        factory: &dyn AccessoryFactory,
    ) -> Result<Self, AccessoryError> {
        let external = factory.deserialize(&record.accessory)?;
        let mut accessory = Self::from_external(external, None);
        accessory.associated_plugin = record.plugin.clone();
        accessory.associated_platform = record.platform.clone();
        accessory.context = record.context.clone();
        Ok(accessory)
    }
}

impl fmt::Debug for PlatformAccessory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformAccessory")
            .field("display_name", &self.display_name)
            .field("uuid", &self.uuid)
            .field("category", &self.category)
            .field("plugin", &self.associated_plugin)
            .field("platform", &self.associated_platform)
            .finish_non_exhaustive()
    }
}
