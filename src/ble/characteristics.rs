//! GATT characteristic value handling.
//!
//! Turns read completions and notifications into typed [`ReadResult`] values
//! and maps GATT status codes onto session errors.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::gatt::GattStatus;
use crate::error::SessionError;

/// Client Characteristic Configuration value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// Client Characteristic Configuration value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// Client Characteristic Configuration value disabling both.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// How a value reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueSource {
    /// Answer to a read request.
    Read,
    /// Unsolicited notification or indication.
    Notification,
}

/// A battery charge percentage (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatteryLevel(u8);

impl BatteryLevel {
    /// Decode a Battery Level characteristic value.
    ///
    /// Returns `None` for an empty payload or a value above 100.
    pub fn parse(data: &[u8]) -> Option<Self> {
        match data.first() {
            Some(&percent) if percent <= 100 => Some(Self(percent)),
            _ => None,
        }
    }

    /// Charge in percent.
    pub fn percent(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for BatteryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// A characteristic value received from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadResult {
    /// Address of the device the value came from.
    pub address: String,
    /// Characteristic the value belongs to.
    pub characteristic_uuid: Uuid,
    /// Raw payload.
    pub raw_bytes: Bytes,
    /// When the value was received.
    pub timestamp: DateTime<Utc>,
    /// Read response or notification.
    pub source: ValueSource,
}

impl ReadResult {
    /// Create a result stamped with the current time.
    pub fn new(
        address: impl Into<String>,
        characteristic_uuid: Uuid,
        raw_bytes: impl Into<Bytes>,
        source: ValueSource,
    ) -> Self {
        Self {
            address: address.into(),
            characteristic_uuid,
            raw_bytes: raw_bytes.into(),
            timestamp: Utc::now(),
            source,
        }
    }

    /// Interpret the payload as a battery level.
    pub fn battery_level(&self) -> Option<BatteryLevel> {
        BatteryLevel::parse(&self.raw_bytes)
    }
}

/// Handles value-carrying GATT callbacks for one device and characteristic.
#[derive(Debug, Clone)]
pub struct ReadNotifyHandler {
    /// Device address stamped onto results.
    address: String,
    /// Characteristic this handler accepts values for.
    characteristic: Uuid,
}

impl ReadNotifyHandler {
    /// Create a handler for a device's characteristic.
    pub fn new(address: impl Into<String>, characteristic: Uuid) -> Self {
        Self {
            address: address.into(),
            characteristic,
        }
    }

    /// The characteristic this handler accepts.
    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Check if a callback concerns this handler's characteristic.
    pub fn accepts(&self, characteristic: &Uuid) -> bool {
        self.characteristic == *characteristic
    }

    /// Handle a read completion.
    ///
    /// # Errors
    ///
    /// Maps a non-success status onto the matching [`SessionError`].
    pub fn on_read(
        &self,
        status: GattStatus,
        value: &[u8],
    ) -> std::result::Result<ReadResult, SessionError> {
        if !status.is_success() {
            warn!(
                "Reading characteristic {} failed: {}",
                self.characteristic, status
            );
            return Err(SessionError::from_read_status(status));
        }

        info!(
            "Read characteristic {}: {:02X?}",
            self.characteristic, value
        );

        Ok(ReadResult::new(
            self.address.clone(),
            self.characteristic,
            Bytes::copy_from_slice(value),
            ValueSource::Read,
        ))
    }

    /// Handle a notification or indication.
    pub fn on_changed(&self, characteristic: Uuid, value: &[u8]) -> ReadResult {
        debug!(
            "Characteristic {} changed: {} bytes, data: {:02X?}",
            characteristic,
            value.len(),
            value
        );

        ReadResult::new(
            self.address.clone(),
            characteristic,
            Bytes::copy_from_slice(value),
            ValueSource::Notification,
        )
    }

    /// Handle a descriptor write completion.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DescriptorWriteFailed`] for a non-success status.
    pub fn on_descriptor_write(&self, status: GattStatus) -> std::result::Result<(), SessionError> {
        if status.is_success() {
            debug!("Descriptor write for {} succeeded", self.characteristic);
            Ok(())
        } else {
            warn!(
                "Descriptor write for {} failed: {}",
                self.characteristic, status
            );
            Err(SessionError::DescriptorWriteFailed { status })
        }
    }

    /// Handle a characteristic write completion.
    ///
    /// # Errors
    ///
    /// Maps `RequestNotSupported`, `ReadNotPermitted` and `WriteNotPermitted`
    /// onto their own kinds and anything else onto [`SessionError::WriteFailed`].
    pub fn on_write(
        characteristic: Uuid,
        status: GattStatus,
    ) -> std::result::Result<(), SessionError> {
        let error = match status {
            GattStatus::Success => return Ok(()),
            GattStatus::RequestNotSupported => SessionError::RequestNotSupported,
            GattStatus::ReadNotPermitted => SessionError::ReadNotPermitted,
            GattStatus::WriteNotPermitted => SessionError::WriteNotPermitted,
            status => SessionError::WriteFailed { status },
        };

        warn!("Writing characteristic {} failed: {}", characteristic, status);
        Err(error)
    }
}
