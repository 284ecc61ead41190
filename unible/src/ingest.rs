//! Adapters turning the two raw discovery sources into candidate
//! [`ScanRecord`]s for the [`ScanResultMerger`](crate::scan::ScanResultMerger).

use dashmap::DashMap;
use log::{debug, trace};
use uuid::Uuid;

use crate::scan::{ManufacturerData, ScanRecord};
use crate::uuid::uuid_from_le_slice;
use crate::DeviceId;

// Advertising data types (Bluetooth Core Supplement, Part A)
const AD_INCOMPLETE_16BIT_SERVICES: u8 = 0x02;
const AD_COMPLETE_16BIT_SERVICES: u8 = 0x03;
const AD_INCOMPLETE_32BIT_SERVICES: u8 = 0x04;
const AD_COMPLETE_32BIT_SERVICES: u8 = 0x05;
const AD_INCOMPLETE_128BIT_SERVICES: u8 = 0x06;
const AD_COMPLETE_128BIT_SERVICES: u8 = 0x07;
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;
const AD_SERVICE_DATA_16BIT: u8 = 0x16;
const AD_SERVICE_DATA_32BIT: u8 = 0x20;
const AD_SERVICE_DATA_128BIT: u8 = 0x21;

/// A raw advertising data structure, as found in an advertisement payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSection {
    pub data_type: u8,
    pub data: Vec<u8>,
}

/// One received advertisement packet, as reported by a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub device_id: DeviceId,
    pub local_name: Option<String>,
    pub manufacturer_data: Vec<ManufacturerData>,
    pub service_uuids: Vec<Uuid>,
    pub data_sections: Vec<DataSection>,
    pub rssi: Option<i16>,
    pub connectable: bool,
}

impl Advertisement {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            local_name: None,
            manufacturer_data: vec![],
            service_uuids: vec![],
            data_sections: vec![],
            rssi: None,
            connectable: true,
        }
    }

    fn section(&self, data_type: u8) -> Option<&DataSection> {
        self.data_sections.iter().find(|section| section.data_type == data_type)
    }

    fn uuids_from_sections(&self) -> Vec<Uuid> {
        let mut uuids = vec![];
        for section in self.data_sections.iter() {
            let width = match section.data_type {
                AD_INCOMPLETE_16BIT_SERVICES | AD_COMPLETE_16BIT_SERVICES => 2,
                AD_INCOMPLETE_32BIT_SERVICES | AD_COMPLETE_32BIT_SERVICES => 4,
                AD_INCOMPLETE_128BIT_SERVICES | AD_COMPLETE_128BIT_SERVICES => 16,
                _ => continue,
            };
            for chunk in section.data.chunks_exact(width) {
                if let Some(uuid) = uuid_from_le_slice(chunk) {
                    if !uuids.contains(&uuid) {
                        uuids.push(uuid);
                    }
                }
            }
        }
        uuids
    }

    /// Builds the candidate record for this sighting.
    ///
    /// An empty local name falls back to the complete local name data section
    /// and service uuids fall back to the service list sections. Service data
    /// is only ever taken from the data sections.
    pub fn into_candidate(self) -> ScanRecord {
        let mut name = self.local_name.clone().filter(|name| !name.is_empty());
        if name.is_none() {
            name = self.section(AD_COMPLETE_LOCAL_NAME)
                       .map(|section| String::from_utf8_lossy(&section.data).into_owned())
                       .filter(|name| !name.is_empty());
        }

        let service_uuids = if self.service_uuids.is_empty() {
            self.uuids_from_sections()
        } else {
            self.service_uuids.clone()
        };

        let mut record = ScanRecord::new(self.device_id);
        for section in self.data_sections.iter() {
            let uuid_len = match section.data_type {
                AD_SERVICE_DATA_16BIT => 2,
                AD_SERVICE_DATA_32BIT => 4,
                AD_SERVICE_DATA_128BIT => 16,
                _ => continue,
            };
            if section.data.len() < uuid_len {
                trace!("Ignoring truncated service data section from {}", self.device_id);
                continue;
            }
            let (uuid, data) = section.data.split_at(uuid_len);
            if let Some(uuid) = uuid_from_le_slice(uuid) {
                record.service_data.insert(uuid, data.to_vec());
            }
        }

        record.name = name;
        record.rssi = self.rssi;
        record.manufacturer_data = self.manufacturer_data;
        record.service_uuids = service_uuids;
        record
    }
}

/// Properties reported by the platform device registry. Updates only carry
/// the properties that changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryProperties {
    pub address: Option<DeviceId>,
    pub name: Option<String>,
    pub paired: Option<bool>,
    pub present: Option<bool>,
    pub connectable: Option<bool>,
    pub signal_strength: Option<i16>,
}

impl RegistryProperties {
    fn update(&mut self, update: RegistryProperties) {
        if update.address.is_some() {
            self.address = update.address;
        }
        if update.name.is_some() {
            self.name = update.name;
        }
        if update.paired.is_some() {
            self.paired = update.paired;
        }
        if update.present.is_some() {
            self.present = update.present;
        }
        if update.connectable.is_some() {
            self.connectable = update.connectable;
        }
        if update.signal_strength.is_some() {
            self.signal_strength = update.signal_strength;
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Added {
        id: String,
        properties: RegistryProperties,
    },
    Updated {
        id: String,
        properties: RegistryProperties,
    },
    Removed {
        id: String,
    },
}

/// Tracks registry entries by their opaque platform id so that partial
/// updates can be resolved to a [`DeviceId`].
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: DashMap<String, RegistryProperties>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a registry event, returning the candidate record and whether
    /// the device is connectable, if the entry's address is known.
    ///
    /// Updates for an id that was never added are ignored.
    pub fn handle_event(&self, event: RegistryEvent) -> Option<(ScanRecord, bool)> {
        let properties = match event {
            RegistryEvent::Added { id, properties } => {
                trace!("Registry added {}", id);
                self.entries.insert(id, properties.clone());
                properties
            }
            RegistryEvent::Updated { id, properties } => {
                let mut entry = match self.entries.get_mut(&id) {
                    Some(entry) => entry,
                    None => {
                        debug!("Ignoring registry update for unknown id {}", id);
                        return None;
                    }
                };
                entry.update(properties);
                entry.clone()
            }
            RegistryEvent::Removed { id } => {
                trace!("Registry removed {}", id);
                self.entries.remove(&id);
                return None;
            }
        };

        let device_id = properties.address?;
        let mut record = ScanRecord::new(device_id);
        record.name = properties.name.filter(|name| !name.is_empty());
        record.is_paired = properties.paired;
        record.rssi = properties.signal_strength;

        Some((record, properties.connectable == Some(true)))
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::uuid_from_u16;

    fn device() -> DeviceId {
        DeviceId::new(0x0A0B_0C0D_0E0F).unwrap()
    }

    #[test]
    fn complete_local_name_fallback() {
        let mut advertisement = Advertisement::new(device());
        advertisement.local_name = Some(String::new());
        advertisement.data_sections.push(DataSection {
            data_type: AD_COMPLETE_LOCAL_NAME,
            data: b"Thingy".to_vec(),
        });
        assert_eq!(advertisement.clone().into_candidate().name.as_deref(), Some("Thingy"));

        advertisement.local_name = Some("Thi".to_string());
        assert_eq!(advertisement.into_candidate().name.as_deref(), Some("Thi"));

        let nameless = Advertisement::new(device()).into_candidate();
        assert_eq!(nameless.name, None);
    }

    #[test]
    fn service_data_sections() {
        let mut advertisement = Advertisement::new(device());
        advertisement.rssi = Some(-55);
        advertisement.data_sections.push(DataSection {
            data_type: AD_SERVICE_DATA_16BIT,
            data: vec![0x0F, 0x18, 0x64],
        });
        advertisement.data_sections.push(DataSection {
            data_type: AD_SERVICE_DATA_32BIT,
            data: vec![0x0D, 0x18, 0x00, 0x00],
        });
        // Truncated, not even a whole uuid
        advertisement.data_sections.push(DataSection {
            data_type: AD_SERVICE_DATA_128BIT,
            data: vec![0x01, 0x02],
        });

        let record = advertisement.into_candidate();
        assert_eq!(record.rssi, Some(-55));
        assert_eq!(record.service_data.len(), 2);
        assert_eq!(record.service_data.get(&uuid_from_u16(0x180F)), Some(&vec![0x64]));
        assert_eq!(record.service_data.get(&uuid_from_u16(0x180D)), Some(&vec![]));
    }

    #[test]
    fn service_list_sections() {
        let mut advertisement = Advertisement::new(device());
        advertisement.data_sections.push(DataSection {
            data_type: AD_COMPLETE_16BIT_SERVICES,
            data: vec![0x0D, 0x18, 0x0F, 0x18, 0x0D, 0x18],
        });
        let record = advertisement.clone().into_candidate();
        assert_eq!(record.service_uuids, vec![uuid_from_u16(0x180D), uuid_from_u16(0x180F)]);

        // Explicitly reported uuids take precedence
        advertisement.service_uuids = vec![uuid_from_u16(0x1810)];
        assert_eq!(advertisement.into_candidate().service_uuids, vec![uuid_from_u16(0x1810)]);
    }

    #[test]
    fn registry_resolves_partial_updates() {
        let registry = DeviceRegistry::new();

        let added = registry.handle_event(RegistryEvent::Added {
            id: "BluetoothLE#0a0b0c0d0e0f".to_string(),
            properties: RegistryProperties {
                address: Some(device()),
                name: Some("Keyboard".to_string()),
                paired: Some(true),
                connectable: Some(true),
                ..Default::default()
            },
        });
        let (record, connectable) = added.unwrap();
        assert!(connectable);
        assert_eq!(record.device_id, device());
        assert_eq!(record.is_paired, Some(true));

        // Updates don't repeat the address
        let updated = registry.handle_event(RegistryEvent::Updated {
            id: "BluetoothLE#0a0b0c0d0e0f".to_string(),
            properties: RegistryProperties {
                signal_strength: Some(-72),
                connectable: Some(false),
                ..Default::default()
            },
        });
        let (record, connectable) = updated.unwrap();
        assert!(!connectable);
        assert_eq!(record.device_id, device());
        assert_eq!(record.rssi, Some(-72));
        assert_eq!(record.name.as_deref(), Some("Keyboard"));

        assert!(registry.handle_event(RegistryEvent::Removed {
            id: "BluetoothLE#0a0b0c0d0e0f".to_string(),
        }).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registry_ignores_unknown_and_unaddressed() {
        let registry = DeviceRegistry::new();
        assert!(registry.handle_event(RegistryEvent::Updated {
            id: "unknown".to_string(),
            properties: RegistryProperties::default(),
        }).is_none());

        assert!(registry.handle_event(RegistryEvent::Added {
            id: "no-address".to_string(),
            properties: RegistryProperties {
                name: Some("Mystery".to_string()),
                ..Default::default()
            },
        }).is_none());
        assert_eq!(registry.len(), 1);
    }
}
