//! Error types for the band-watcher-ble crate.

use thiserror::Error;
use uuid::Uuid;

use crate::ble::connection::ConnectionState;
use crate::ble::gatt::{GattStatus, Operation};

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// Required runtime permissions were not granted.
    #[error("Permission denied: {}", permissions.join(", "))]
    PermissionDenied {
        /// Names of the permissions that were not granted.
        permissions: Vec<String>,
        /// Whether any of them was permanently denied.
        permanent: bool,
    },

    /// A scan was requested while one is already running.
    #[error("A scan is already active")]
    ScanAlreadyActive,

    /// The requested device has not been discovered.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was looked up.
        address: String,
    },

    /// Operation requires a connection but no session holds one.
    #[error("Device not connected")]
    NotConnected,

    /// The connection session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The background worker is no longer running.
    #[error("Device manager is shut down")]
    ChannelClosed,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a connection session.
///
/// Unlike [`Error`] this type is `Clone` so it can be broadcast to every
/// session subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The platform reported a connection failure.
    #[error("Connection failed: {status}")]
    ConnectionFailed {
        /// Status reported with the state change.
        status: GattStatus,
    },

    /// The link dropped before the workflow finished.
    #[error("Connection lost")]
    ConnectionLost,

    /// Service discovery reported a failure.
    #[error("Service discovery failed: {status}")]
    ServiceDiscoveryFailed {
        /// Discovery status.
        status: GattStatus,
    },

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: Uuid,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: Uuid,
    },

    /// A characteristic read failed.
    #[error("Read failed: {status}")]
    ReadFailed {
        /// Read status.
        status: GattStatus,
    },

    /// A characteristic write failed.
    #[error("Write failed: {status}")]
    WriteFailed {
        /// Write status.
        status: GattStatus,
    },

    /// The characteristic does not permit reads.
    #[error("Read not permitted")]
    ReadNotPermitted,

    /// The characteristic does not permit writes.
    #[error("Write not permitted")]
    WriteNotPermitted,

    /// The peripheral does not support the request.
    #[error("Request not supported")]
    RequestNotSupported,

    /// The characteristic cannot notify or indicate.
    #[error("Notifications not supported by characteristic {uuid}")]
    NotificationsUnsupported {
        /// The characteristic UUID.
        uuid: Uuid,
    },

    /// Writing the configuration descriptor failed.
    #[error("Descriptor write failed: {status}")]
    DescriptorWriteFailed {
        /// Write status.
        status: GattStatus,
    },

    /// No event arrived for an operation before its deadline.
    #[error("Timed out waiting for {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: Operation,
    },

    /// The platform refused to start an operation.
    #[error("Platform rejected {operation}: {reason}")]
    CommandRejected {
        /// The rejected operation.
        operation: Operation,
        /// Platform-specific description.
        reason: String,
    },

    /// A newer `connect()` replaced this session.
    #[error("Session superseded by a new connection")]
    Superseded,

    /// The caller cancelled the session.
    #[error("Session cancelled")]
    Cancelled,

    /// The operation is not valid in the session's current state.
    #[error("Cannot perform {operation} while {state}")]
    InvalidState {
        /// The attempted operation.
        operation: Operation,
        /// The session state at the time.
        state: ConnectionState,
    },
}

impl SessionError {
    /// Map a failed read status to an error.
    pub fn from_read_status(status: GattStatus) -> Self {
        match status {
            GattStatus::ReadNotPermitted => Self::ReadNotPermitted,
            GattStatus::WriteNotPermitted => Self::WriteNotPermitted,
            GattStatus::RequestNotSupported => Self::RequestNotSupported,
            status => Self::ReadFailed { status },
        }
    }

    /// Check if the failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_status_mapping() {
        assert_eq!(
            SessionError::from_read_status(GattStatus::ReadNotPermitted),
            SessionError::ReadNotPermitted
        );
        assert_eq!(
            SessionError::from_read_status(GattStatus::RequestNotSupported),
            SessionError::RequestNotSupported
        );
        assert_eq!(
            SessionError::from_read_status(GattStatus::Error),
            SessionError::ReadFailed {
                status: GattStatus::Error
            }
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::PermissionDenied {
            permissions: vec![
                "android.permission.BLUETOOTH_SCAN".to_string(),
                "android.permission.BLUETOOTH_CONNECT".to_string(),
            ],
            permanent: false,
        };
        assert_eq!(
            err.to_string(),
            "Permission denied: android.permission.BLUETOOTH_SCAN, android.permission.BLUETOOTH_CONNECT"
        );

        let err: Error = SessionError::Timeout {
            operation: Operation::DiscoverServices,
        }
        .into();
        assert_eq!(err.to_string(), "Timed out waiting for service discovery");
    }
}
