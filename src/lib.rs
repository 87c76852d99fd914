// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # band-watcher-ble
//!
//! A Rust library for finding Bluetooth Low Energy wearables and reading
//! their battery level.
//!
//! ## Features
//!
//! - **Device Discovery**: Scan for nearby devices, keeping only those that
//!   advertise a name, each address once and in discovery order
//! - **Connection Session**: An explicit state machine that connects,
//!   discovers services and reads the Battery Level characteristic exactly once
//! - **Timeouts**: Every platform operation carries a deadline
//! - **Notifications**: Optionally subscribe to battery level changes
//! - **Pluggable Backend**: btleplug by default, any [`BleBackend`] for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use band_watcher_ble::{DeviceManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create device manager and start scanning
//!     let manager = DeviceManager::new().await?;
//!     manager.start_scanning().await?;
//!
//!     // Wait for devices to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     // Read the battery of the first device found
//!     if let Some(device) = manager.devices().first() {
//!         let result = manager.read_battery(&device.address).await?;
//!         if let Some(level) = result.battery_level() {
//!             println!("{}: battery {}", device, level);
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. Devices are identified by a
//! platform UUID instead of their hardware address.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod callback;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod permissions;
pub mod registry;

// Re-exports for convenience
pub use callback::CallbackHandle;
pub use config::WatcherConfig;
pub use device_manager::DeviceManager;
pub use error::{Error, Result, SessionError};
pub use permissions::{Permission, PermissionReport, PermissionStatus};
pub use registry::{DeviceRegistry, DiscoveredDevice, RegistryEvent, ScanStopReason};

// Re-export commonly used types from submodules
pub use ble::backend::BleBackend;
pub use ble::characteristics::{BatteryLevel, ReadResult, ValueSource};
pub use ble::connection::{ConnectionState, SessionSnapshot};
pub use ble::events::{GattEvent, PlatformEvent};
pub use ble::gatt::{GattStatus, GattTarget, Operation};
pub use ble::session::SessionEvent;
