use bitflags::bitflags;
use uuid::Uuid;

use crate::{CharacteristicHandle, DeviceHandle, DeviceId, Error, Result, ServiceHandle, SubscriptionToken};

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

/// Value written to a characteristic's client configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    Off,
    Notify,
    Indicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// What the backend reports for each characteristic of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub handle: CharacteristicHandle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Every handle (and uuid) leading to one characteristic of a connected
/// peripheral. Backends get the whole path with each request so they don't
/// need to track the relationships between handles themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicPath {
    pub device_id: DeviceId,
    pub device: DeviceHandle,
    pub service: ServiceHandle,
    pub service_uuid: Uuid,
    pub characteristic: CharacteristicHandle,
    pub characteristic_uuid: Uuid,
}

/// A cached characteristic of a connected peripheral.
///
/// Applications only ever get copies of an entry, the authoritative one lives
/// (and dies) with its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicEntry {
    pub(crate) handle: CharacteristicHandle,
    pub(crate) uuid: Uuid,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) subscription: Option<SubscriptionToken>,
}

impl CharacteristicEntry {
    pub(crate) fn new(info: CharacteristicInfo) -> Self {
        Self {
            handle: info.handle,
            uuid: info.uuid,
            properties: info.properties,
            subscription: None,
        }
    }

    pub fn handle(&self) -> CharacteristicHandle {
        self.handle
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }

    pub fn subscription(&self) -> Option<SubscriptionToken> {
        self.subscription
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub(crate) fn check_notify_mode(&self, mode: NotifyMode) -> Result<()> {
        match mode {
            NotifyMode::Off => Ok(()),
            NotifyMode::Notify if !self.properties.contains(CharacteristicProperties::NOTIFY) => {
                Err(Error::NotSupported("notify"))
            }
            NotifyMode::Indicate if !self.properties.contains(CharacteristicProperties::INDICATE) => {
                Err(Error::NotSupported("indicate"))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn check_readable(&self) -> Result<()> {
        if self.properties.contains(CharacteristicProperties::READ) {
            Ok(())
        } else {
            Err(Error::NotSupported("read"))
        }
    }

    pub(crate) fn check_write_type(&self, write_type: WriteType) -> Result<()> {
        match write_type {
            WriteType::WithResponse if !self.properties.contains(CharacteristicProperties::WRITE) => {
                Err(Error::NotSupported("write"))
            }
            WriteType::WithoutResponse
                if !self.properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE) =>
            {
                Err(Error::NotSupported("write without response"))
            }
            _ => Ok(()),
        }
    }
}
