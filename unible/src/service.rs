use std::collections::HashMap;

use uuid::Uuid;

use crate::characteristic::{CharacteristicEntry, CharacteristicProperties};
use crate::ServiceHandle;

// NB: services and characteristics are keyed by uuid. A device may in theory
// instantiate the same service more than once (differentiated by ATT handle)
// but only the last one enumerated is addressable through the command surface.

#[derive(Debug, Clone)]
pub(crate) struct ServiceEntry {
    pub(crate) handle: ServiceHandle,
    pub(crate) characteristics: HashMap<Uuid, CharacteristicEntry>,
}

impl ServiceEntry {
    pub(crate) fn new(handle: ServiceHandle) -> Self {
        Self {
            handle,
            characteristics: HashMap::new(),
        }
    }

    pub(crate) fn info(&self, uuid: Uuid) -> ServiceInfo {
        let mut characteristics: Vec<&CharacteristicEntry> = self.characteristics.values().collect();
        // Report characteristics in attribute handle order, as the device lays
        // them out.
        characteristics.sort_by_key(|c| c.handle);

        ServiceInfo {
            uuid,
            characteristics: characteristics
                .into_iter()
                .map(|c| ServiceCharacteristic { uuid: c.uuid, properties: c.properties })
                .collect(),
        }
    }
}

/// Description of a cached service as reported by `discover_services`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<ServiceCharacteristic>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}
