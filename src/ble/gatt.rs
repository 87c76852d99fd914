//! Platform-neutral GATT types.
//!
//! Status codes, link states and the discovered service tree as reported by
//! the platform BLE stack. Status names follow the Android Bluetooth API so
//! that events from any backend map onto one vocabulary.

use btleplug::api::CharPropFlags;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::uuids::{BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};

/// Completion status of a GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GattStatus {
    /// The operation completed successfully.
    Success,
    /// The characteristic does not permit reads.
    ReadNotPermitted,
    /// The characteristic does not permit writes.
    WriteNotPermitted,
    /// Insufficient authentication for the operation.
    InsufficientAuthentication,
    /// The peripheral does not support the request.
    RequestNotSupported,
    /// Insufficient encryption for the operation.
    InsufficientEncryption,
    /// Generic stack error (the infamous status 133).
    Error,
    /// Generic GATT failure.
    Failure,
    /// Any other status code.
    Other(u16),
}

impl GattStatus {
    /// Check if the status reports success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "GATT_SUCCESS"),
            Self::ReadNotPermitted => write!(f, "GATT_READ_NOT_PERMITTED"),
            Self::WriteNotPermitted => write!(f, "GATT_WRITE_NOT_PERMITTED"),
            Self::InsufficientAuthentication => write!(f, "GATT_INSUFFICIENT_AUTHENTICATION"),
            Self::RequestNotSupported => write!(f, "GATT_REQUEST_NOT_SUPPORTED"),
            Self::InsufficientEncryption => write!(f, "GATT_INSUFFICIENT_ENCRYPTION"),
            Self::Error => write!(f, "GATT_ERROR"),
            Self::Failure => write!(f, "GATT_FAILURE"),
            Self::Other(code) => write!(f, "GATT status {:#06x}", code),
        }
    }
}

/// Link-layer connection state reported alongside a connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkState {
    /// No link.
    Disconnected,
    /// Link being established.
    Connecting,
    /// Link established.
    Connected,
    /// Link being torn down.
    Disconnecting,
}

/// An asynchronous platform operation that completes through an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operation {
    /// A device scan.
    Scan,
    /// Opening a GATT connection.
    Connect,
    /// GATT service discovery.
    DiscoverServices,
    /// A characteristic read.
    Read,
    /// A descriptor write (enabling notifications).
    WriteDescriptor,
    /// Closing a GATT connection.
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::Connect => write!(f, "connect"),
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::Read => write!(f, "characteristic read"),
            Self::WriteDescriptor => write!(f, "descriptor write"),
            Self::Disconnect => write!(f, "disconnect"),
        }
    }
}

/// A characteristic within a discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supported operations.
    pub properties: CharPropFlags,
}

impl GattCharacteristic {
    /// Create a characteristic description.
    pub fn new(uuid: Uuid, properties: CharPropFlags) -> Self {
        Self { uuid, properties }
    }

    /// Check if the characteristic can be read.
    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    /// Check if the characteristic can notify or indicate value changes.
    pub fn supports_notifications(&self) -> bool {
        self.properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
    }
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in discovery order.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Create a service description.
    pub fn new(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }
}

/// The service/characteristic pair a session reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattTarget {
    /// Service that must contain the characteristic.
    pub service: Uuid,
    /// Characteristic to read.
    pub characteristic: Uuid,
}

impl GattTarget {
    /// Create a target.
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }

    /// The standard battery level characteristic of the battery service.
    pub fn battery_level() -> Self {
        Self::new(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID)
    }
}

impl Default for GattTarget {
    fn default() -> Self {
        Self::battery_level()
    }
}

/// A deadline for an operation that is waiting on a platform event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperation {
    /// What is being waited on.
    pub operation: Operation,
    /// When waiting gives up.
    pub deadline: tokio::time::Instant,
}

impl PendingOperation {
    /// Start waiting on an operation now.
    pub fn starting_now(operation: Operation, timeout: Duration) -> Self {
        Self {
            operation,
            deadline: tokio::time::Instant::now() + timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(GattStatus::Success.to_string(), "GATT_SUCCESS");
        assert_eq!(
            GattStatus::RequestNotSupported.to_string(),
            "GATT_REQUEST_NOT_SUPPORTED"
        );
        assert_eq!(GattStatus::Other(0x8f).to_string(), "GATT status 0x008f");
    }

    #[test]
    fn test_characteristic_properties() {
        let level = GattCharacteristic::new(
            BATTERY_LEVEL_UUID,
            CharPropFlags::READ | CharPropFlags::NOTIFY,
        );
        assert!(level.is_readable());
        assert!(level.supports_notifications());

        let write_only = GattCharacteristic::new(BATTERY_LEVEL_UUID, CharPropFlags::WRITE);
        assert!(!write_only.is_readable());
        assert!(!write_only.supports_notifications());
    }

    #[test]
    fn test_default_target() {
        let target = GattTarget::default();
        assert_eq!(target.service, BATTERY_SERVICE_UUID);
        assert_eq!(target.characteristic, BATTERY_LEVEL_UUID);
    }
}
