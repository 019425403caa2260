//! In-process protocol accessory used when no external engine is attached.

use crate::category::{is_valid_uuid, Category};
use crate::protocol::{
    service_types, AccessoryError, AccessoryFactory, Controller, IdentifyAck, IdentifyHandler,
    ProtocolAccessory, SerializedAccessory, Service,
};
use std::fmt;

pub struct LocalAccessory {
    display_name: String,
    uuid: String,
    category: Category,
    services: Vec<Service>,
    controllers: Vec<String>,
    identify: Option<IdentifyHandler>,
}

impl LocalAccessory {
    /// New accessory carrying only the mandatory information service.
    pub fn new(display_name: &str, uuid: &str) -> Result<Self, AccessoryError> {
        if !is_valid_uuid(uuid) {
            return Err(AccessoryError::InvalidUuid {
                uuid: uuid.to_string(),
            });
        }
        Ok(Self {
            display_name: display_name.to_string(),
            uuid: uuid.to_string(),
            category: Category::OTHER,
            services: vec![Service::new(
                service_types::ACCESSORY_INFORMATION,
                display_name,
            )],
            controllers: Vec::new(),
            identify: None,
        })
    }

    pub fn from_serialized(record: &SerializedAccessory) -> Result<Self, AccessoryError> {
        let mut accessory = Self::new(&record.display_name, &record.uuid)?;
        accessory.category = record.category;
        accessory.services = record.services.clone();
        accessory.controllers = record.controllers.clone();
        Ok(accessory)
    }
}

impl fmt::Debug for LocalAccessory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAccessory")
            .field("display_name", &self.display_name)
            .field("uuid", &self.uuid)
            .field("category", &self.category)
            .field("services", &self.services.len())
            .field("controllers", &self.controllers)
            .finish()
    }
}

impl ProtocolAccessory for LocalAccessory {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn category(&self) -> Category {
        self.category
    }

    fn set_category(&mut self, category: Category) {
        self.category = category;
    }

    fn services(&self) -> &[Service] {
        &self.services
    }

    fn add_service(&mut self, service: Service) -> Result<&Service, AccessoryError> {
        if self.services.iter().any(|existing| existing.same_id(&service)) {
            return Err(AccessoryError::DuplicateService {
                accessory: self.display_name.clone(),
                type_uuid: service.type_uuid,
                subtype: service.subtype,
            });
        }
        self.services.push(service);
        Ok(&self.services[self.services.len() - 1])
    }

    fn remove_service(&mut self, service: &Service) -> Option<Service> {
        let idx = self.services.iter().position(|s| s.same_id(service))?;
        Some(self.services.remove(idx))
    }

    fn get_service(&self, name_or_type: &str) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.display_name == name_or_type || s.type_uuid == name_or_type)
    }

    fn get_service_by_id(&self, type_uuid: &str, subtype: &str) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.type_uuid == type_uuid && s.subtype.as_deref() == Some(subtype))
    }

    fn configure_controller(&mut self, controller: Controller) -> Result<(), AccessoryError> {
        if self.controllers.iter().any(|kind| kind == controller.kind()) {
            return Err(AccessoryError::ControllerConflict {
                kind: controller.kind().to_string(),
            });
        }
        self.controllers.push(controller.kind().to_string());
        Ok(())
    }

    fn remove_controller(&mut self, controller: &Controller) -> Result<(), AccessoryError> {
        self.controllers.retain(|kind| kind != controller.kind());
        Ok(())
    }

    fn set_identify_handler(&mut self, handler: IdentifyHandler) {
        self.identify = Some(handler);
    }

    fn identify(&self, paired: bool, ack: IdentifyAck) {
        match &self.identify {
            Some(handler) => handler(paired, ack),
            None => ack(),
        }
    }

    fn serialize(&self) -> SerializedAccessory {
        SerializedAccessory {
            display_name: self.display_name.clone(),
            uuid: self.uuid.clone(),
            category: self.category,
            services: self.services.clone(),
            controllers: self.controllers.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAccessoryFactory;

impl AccessoryFactory for LocalAccessoryFactory {
    fn create(
        &self,
        display_name: &str,
        uuid: &str,
    ) -> Result<Box<dyn ProtocolAccessory>, AccessoryError> {
        Ok(Box::new(LocalAccessory::new(display_name, uuid)?))
    }

    fn deserialize(
        &self,
        record: &SerializedAccessory,
    ) -> Result<Box<dyn ProtocolAccessory>, AccessoryError> {
        Ok(Box::new(LocalAccessory::from_serialized(record)?))
    }
}
