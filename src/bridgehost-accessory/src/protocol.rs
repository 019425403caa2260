//! The contract between the host and the protocol engine's accessory object.
//!
//! The host never reaches into the engine directly. Everything it needs from
//! an accessory goes through [`ProtocolAccessory`], and new objects come from an
//! [`AccessoryFactory`], so the engine can be swapped (or faked in tests).

use crate::category::Category;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known service type UUIDs.
pub mod service_types {
    pub const ACCESSORY_INFORMATION: &str = "0000003E-0000-1000-8000-0026BB765291";
    pub const FAN: &str = "00000040-0000-1000-8000-0026BB765291";
    pub const LIGHTBULB: &str = "00000043-0000-1000-8000-0026BB765291";
    pub const OUTLET: &str = "00000047-0000-1000-8000-0026BB765291";
    pub const SWITCH: &str = "00000049-0000-1000-8000-0026BB765291";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(rename = "UUID")]
    pub type_uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub display_name: String,
    #[serde(default)]
    pub primary: bool,
}

impl Service {
    pub fn new(type_uuid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            type_uuid: type_uuid.into(),
            subtype: None,
            display_name: display_name.into(),
            primary: false,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    /// Services are identified by type plus optional subtype.
    pub fn same_id(&self, other: &Service) -> bool {
        self.type_uuid == other.type_uuid && self.subtype == other.subtype
    }
}

/// A controller bound to an accessory (remote, camera stream, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controller {
    kind: String,
}

impl Controller {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// Completion callback for an identify request. Must always be called.
pub type IdentifyAck = Box<dyn FnOnce() + Send>;

/// Receives `(paired, ack)` for every identify request.
pub type IdentifyHandler = Box<dyn Fn(bool, IdentifyAck) + Send + Sync>;

/// The engine's own persisted form of an accessory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedAccessory {
    pub display_name: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controllers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessoryError {
    #[error("'{uuid}' is not a valid accessory UUID")]
    InvalidUuid { uuid: String },
    #[error("service {type_uuid} (subtype {subtype:?}) is already present on accessory {accessory}")]
    DuplicateService {
        accessory: String,
        type_uuid: String,
        subtype: Option<String>,
    },
    #[error("a controller of kind '{kind}' is already configured")]
    ControllerConflict { kind: String },
}

pub trait ProtocolAccessory: Send + Sync {
    fn display_name(&self) -> &str;

    fn uuid(&self) -> &str;

    fn category(&self) -> Category;

    fn set_category(&mut self, category: Category);

    /// The engine's live service list.
    fn services(&self) -> &[Service];

    fn add_service(&mut self, service: Service) -> Result<&Service, AccessoryError>;

    fn remove_service(&mut self, service: &Service) -> Option<Service>;

    /// Look a service up by display name or type UUID.
    fn get_service(&self, name_or_type: &str) -> Option<&Service>;

    fn get_service_by_id(&self, type_uuid: &str, subtype: &str) -> Option<&Service>;

    fn configure_controller(&mut self, controller: Controller) -> Result<(), AccessoryError>;

    fn remove_controller(&mut self, controller: &Controller) -> Result<(), AccessoryError>;

    fn set_identify_handler(&mut self, handler: IdentifyHandler);

    /// Deliver an identify request as a paired controller would.
    fn identify(&self, paired: bool, ack: IdentifyAck);

    fn serialize(&self) -> SerializedAccessory;
}

/// Builds protocol accessories, fresh or from a persisted record.
pub trait AccessoryFactory: Send + Sync {
    fn create(
        &self,
        display_name: &str,
        uuid: &str,
    ) -> Result<Box<dyn ProtocolAccessory>, AccessoryError>;

    fn deserialize(
        &self,
        record: &SerializedAccessory,
    ) -> Result<Box<dyn ProtocolAccessory>, AccessoryError>;
}
