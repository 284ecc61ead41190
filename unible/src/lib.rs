//! Host-side core of a Bluetooth Low Energy central.
//!
//! A [`session::Session`] sits on top of a platform binding (anything that
//! implements [`session::BackendSession`]) and provides:
//!
//! - scanning, where advertisements and device-registry updates for the same
//!   peripheral are reconciled into a single [`scan::ScanRecord`] that is only
//!   re-reported when something actually changed,
//! - connections, where the GATT topology of a peripheral is discovered once
//!   and cached, and notification subscriptions are tracked so that nothing is
//!   delivered for a peripheral after it has been torn down.
//!
//! Every event reported to the application goes through one ordered
//! [`marshaller::Marshaller`] queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use arrayvec::ArrayVec;
use ::uuid::Uuid;

pub mod uuid;

pub mod session;
pub use session::{BackendSession, PinEntry, Session, SessionConfig};

pub mod marshaller;

pub mod filter;
pub use filter::{ManufacturerDataFilter, ScanFilter};

pub mod ingest;

pub mod scan;
pub use scan::{ManufacturerData, ScanRecord};

mod connection;

pub mod service;
pub mod characteristic;
pub use characteristic::{CharacteristicProperties, NotifyMode, WriteType};

pub mod fake;

/// Canonical identifier for a peripheral, derived from its 48-bit hardware
/// address.
///
/// The string form is the familiar colon separated form with the most
/// significant octet first, e.g. `"F1:E2:D3:C4:B5:A6"`, and converts losslessly
/// to and from the integer form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u64);

const MAC48_MASK: u64 = 0x0000_ffff_ffff_ffff;

impl DeviceId {
    pub fn new(address: u64) -> Result<Self> {
        if address & !MAC48_MASK != 0 {
            return Err(Error::InvalidDeviceId(format!("{:#x}", address)));
        }
        Ok(DeviceId(address))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_be_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7])
    }
}

// Avoids allocating in the error path; the caller decides how to report a
// malformed string.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    let mut parts = ArrayVec::<_, 6>::new();
    for part in s.split(':') {
        if parts.try_push(part).is_err() {
            return None;
        }
    }
    if parts.len() != 6 {
        return None;
    }
    let mut value = 0u64;
    for part in parts {
        if part.len() != 2 {
            return None;
        }
        let byte = u8::from_str_radix(part, 16).ok()?;
        value = (value << 8) | byte as u64;
    }
    Some(value)
}

impl FromStr for DeviceId {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(DeviceId(val)),
            None => Err(Error::InvalidDeviceId(s.to_string())),
        }
    }
}

impl std::convert::TryFrom<u64> for DeviceId {
    type Error = Error;
    fn try_from(address: u64) -> Result<Self> {
        DeviceId::new(address)
    }
}

#[test]
fn mac_two_way() {
    let id = DeviceId::from_str("F1:E2:D3:C4:B5:A6").unwrap();
    assert_eq!(id.as_u64(), 0xF1E2_D3C4_B5A6);
    // Octets are intentionally formatted as uppercase since some platforms are
    // very particular about this.
    assert_eq!(id.to_string(), "F1:E2:D3:C4:B5:A6");
    assert_eq!(DeviceId::new(0xF1E2_D3C4_B5A6).unwrap(), id);

    let id = DeviceId::from_str("00:1a:7d:da:71:13").unwrap();
    assert_eq!(id.to_string(), "00:1A:7D:DA:71:13");

    assert!(DeviceId::from_str("18c2a267-a539-4423-aecc-edeeb2784bcc").is_err());
    assert!(DeviceId::from_str("F1:E2:D3:C4:B5").is_err());
    assert!(DeviceId::from_str("F1:E2:D3:C4:B5:A6:00").is_err());
    assert!(DeviceId::from_str("F1:E2:D3:C4:B5:G6").is_err());
    assert!(DeviceId::new(1 << 48).is_err());
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

// Handles are opaque to the core, a backend hands them out and gets the same
// values back when the core makes requests.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicHandle(pub u32);

/// Registration of a connection status listener with the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub u64);

/// Registration of a value changed listener for a single characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// The closed set of failures a backend may report for a GATT operation.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Unreachable")]
    Unreachable,

    #[error("Protocol error {0:?}")]
    ProtocolError(Option<u8>),

    #[error("Access denied")]
    AccessDenied,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown device, service or characteristic")]
    NotFound,

    #[error("The characteristic doesn't support {0}")]
    NotSupported(&'static str),

    #[error("The system is unable to communicate with this peripheral currently")]
    Unreachable,

    #[error("There was a GATT communication protocol error (code {0:?})")]
    ProtocolError(Option<u8>),

    #[error("Access Denied")]
    AccessDenied,

    #[error("Operation already in progress")]
    AlreadyInProgress,

    #[error("Timed out waiting for the operation to complete")]
    Timeout,

    #[error("Bluetooth is not available")]
    BluetoothUnavailable,

    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl From<GattError> for Error {
    fn from(err: GattError) -> Self {
        match err {
            GattError::Unreachable => Error::Unreachable,
            GattError::ProtocolError(code) => Error::ProtocolError(code),
            GattError::AccessDenied => Error::AccessDenied,
            GattError::DeviceNotFound => Error::NotFound,
            GattError::Other(msg) => Error::Unknown(anyhow::anyhow!(msg)),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What backend GATT and pairing requests resolve to.
pub type GattResult<T> = std::result::Result<T, GattError>;

/// Events pushed by a backend onto the bus it was given in
/// [`session::BackendSession::start`].
#[derive(Clone, Debug)]
pub enum BackendEvent {
    Advertisement(ingest::Advertisement),
    Registry(ingest::RegistryEvent),
    ConnectionStatusChanged {
        device_id: DeviceId,
        connected: bool,
    },
    ValueChanged {
        device_id: DeviceId,
        service: Uuid,
        characteristic: Uuid,
        token: SubscriptionToken,
        value: Vec<u8>,
    },
    AvailabilityChanged(AvailabilityState),
    Flush(u32),
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Event {
    ScanResult(ScanRecord),

    /// Once a peripheral has disconnected all of its cached services and
    /// characteristics are gone and requests against them report
    /// `NotFound` errors.
    #[non_exhaustive]
    ConnectionChanged {
        device_id: DeviceId,
        connected: bool,
        error: Option<String>,
    },

    #[non_exhaustive]
    ValueChanged {
        device_id: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        timestamp: SystemTime,
    },

    #[non_exhaustive]
    PairStateChanged {
        device_id: DeviceId,
        paired: bool,
        error: Option<String>,
    },

    AvailabilityChanged(AvailabilityState),

    Flush(u32),
}
