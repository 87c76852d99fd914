//! Events delivered by the platform BLE stack.
//!
//! Every platform callback becomes one [`PlatformEvent`] pushed onto a single
//! queue; the device manager consumes that queue strictly in arrival order.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::gatt::{GattService, GattStatus, LinkState};

/// Sending half of the platform event queue.
pub type EventSender = mpsc::UnboundedSender<PlatformEvent>;

/// Receiving half of the platform event queue.
pub type EventReceiver = mpsc::UnboundedReceiver<PlatformEvent>;

/// Create a platform event queue.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// An event raised by the platform BLE stack.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// A device was seen while scanning.
    ScanResult {
        /// Unique device address.
        address: String,
        /// Advertised name, if any.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
    },
    /// The platform aborted the scan.
    ScanFailed {
        /// Platform-specific description.
        reason: String,
    },
    /// A GATT callback for a specific device.
    Gatt {
        /// Address of the device the callback belongs to.
        address: String,
        /// The callback payload.
        event: GattEvent,
    },
}

impl PlatformEvent {
    /// Build a GATT event for a device.
    pub fn gatt(address: impl Into<String>, event: GattEvent) -> Self {
        Self::Gatt {
            address: address.into(),
            event,
        }
    }
}

/// A GATT client callback.
#[derive(Debug, Clone, PartialEq)]
pub enum GattEvent {
    /// The connection state changed.
    ConnectionStateChanged {
        /// Status of the operation that caused the change.
        status: GattStatus,
        /// The new link state.
        state: LinkState,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// Discovery status.
        status: GattStatus,
        /// Discovered services in platform order (empty on failure).
        services: Vec<GattService>,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        /// Read status.
        status: GattStatus,
        /// Characteristic that was read.
        characteristic: Uuid,
        /// Value read (empty on failure).
        value: Vec<u8>,
    },
    /// A characteristic write finished.
    CharacteristicWrite {
        /// Write status.
        status: GattStatus,
        /// Characteristic that was written.
        characteristic: Uuid,
    },
    /// A descriptor write finished.
    DescriptorWrite {
        /// Write status.
        status: GattStatus,
        /// Characteristic owning the descriptor.
        characteristic: Uuid,
        /// Descriptor that was written.
        descriptor: Uuid,
    },
    /// A notification or indication arrived.
    CharacteristicChanged {
        /// Characteristic whose value changed.
        characteristic: Uuid,
        /// New value.
        value: Vec<u8>,
    },
}

impl GattEvent {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged { .. } => "connection state changed",
            Self::ServicesDiscovered { .. } => "services discovered",
            Self::CharacteristicRead { .. } => "characteristic read",
            Self::CharacteristicWrite { .. } => "characteristic write",
            Self::DescriptorWrite { .. } => "descriptor write",
            Self::CharacteristicChanged { .. } => "characteristic changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::BATTERY_LEVEL_UUID;

    #[tokio::test]
    async fn test_event_channel_preserves_order() {
        let (tx, mut rx) = event_channel();

        for i in 0..3u8 {
            tx.send(PlatformEvent::gatt(
                "AA:BB",
                GattEvent::CharacteristicChanged {
                    characteristic: BATTERY_LEVEL_UUID,
                    value: vec![i],
                },
            ))
            .unwrap();
        }

        for i in 0..3u8 {
            match rx.recv().await.unwrap() {
                PlatformEvent::Gatt {
                    address,
                    event: GattEvent::CharacteristicChanged { value, .. },
                } => {
                    assert_eq!(address, "AA:BB");
                    assert_eq!(value, vec![i]);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_event_kind() {
        let event = GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        };
        assert_eq!(event.kind(), "connection state changed");
    }
}
