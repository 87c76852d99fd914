//! Platform BLE stack abstraction.
//!
//! A backend starts platform operations; their completions arrive later as
//! [`PlatformEvent`](crate::ble::events::PlatformEvent)s on the event queue the
//! backend was created with. A method returning `Ok(())` only means the
//! platform accepted the request.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::permissions::{Permission, PermissionReport};

/// Commands understood by a platform BLE stack.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Report the state of the runtime permissions scanning needs.
    async fn permissions(&self) -> Result<PermissionReport>;

    /// Permissions that must be granted before scanning on this platform.
    ///
    /// See [`required_permissions`](crate::permissions::required_permissions)
    /// for the Android set by API level.
    fn required_permissions(&self) -> Vec<Permission>;

    /// Start reporting scan results.
    async fn start_scan(&self) -> Result<()>;

    /// Stop reporting scan results.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a GATT connection to a scanned device.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Discover the services of the connected device.
    async fn discover_services(&self) -> Result<()>;

    /// Read a characteristic of the connected device.
    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Write a descriptor of the connected device.
    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    ) -> Result<()>;

    /// Ask the connected device to disconnect.
    async fn disconnect(&self) -> Result<()>;

    /// Release the connection resource.
    async fn close(&self) -> Result<()>;
}
