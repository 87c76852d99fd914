//! BLE communication module.
//!
//! Platform abstraction, GATT data model, scanning and the connection
//! session state machine.

pub mod backend;
pub mod btleplug_backend;
pub mod characteristics;
pub mod connection;
pub mod events;
pub mod gatt;
pub mod resolver;
pub mod scanner;
pub mod session;
pub mod uuids;

pub use backend::BleBackend;
pub use btleplug_backend::BtleplugBackend;
pub use characteristics::{BatteryLevel, ReadNotifyHandler, ReadResult, ValueSource};
pub use connection::{ConnectionManager, ConnectionState, SessionSnapshot};
pub use events::{event_channel, EventReceiver, EventSender, GattEvent, PlatformEvent};
pub use gatt::{GattCharacteristic, GattService, GattStatus, GattTarget, LinkState, Operation};
pub use resolver::{ResolvedCharacteristic, ServiceCatalog};
pub use scanner::{ScanController, ScanOutcome};
pub use session::{ConnectionSession, NotificationState, SessionAction, SessionEvent};
pub use uuids::*;
