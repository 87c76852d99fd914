//! Registry of discovered devices.
//!
//! An append-only, order-preserving collection keyed by device address. The
//! worker task is the only writer; any number of readers may take snapshots
//! or subscribe to change notifications.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// A named device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Unique device address.
    pub address: String,
    /// Advertised display name.
    pub name: String,
}

impl DiscoveredDevice {
    /// Create a device entry.
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Why a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStopReason {
    /// The caller stopped the scan.
    Requested,
    /// The configured scan timeout elapsed.
    TimedOut,
    /// The scan was stopped to connect to a device.
    Connecting,
    /// The platform aborted the scan.
    Failed(String),
}

/// A change to the registry or to the scan feeding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device was appended.
    DeviceAdded {
        /// Position of the new device.
        index: usize,
        /// The new device.
        device: DiscoveredDevice,
    },
    /// A scan started.
    ScanStarted,
    /// A scan ended.
    ScanStopped {
        /// Why it ended.
        reason: ScanStopReason,
    },
}

#[derive(Default)]
struct RegistryInner {
    devices: Vec<DiscoveredDevice>,
    index: HashMap<String, usize>,
}

/// Append-only registry of discovered devices.
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create an empty registry whose change channel holds `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            inner: RwLock::new(RegistryInner::default()),
            event_tx,
        }
    }

    /// Append a device unless its address is already known.
    ///
    /// Returns the index of the new entry, or `None` for a duplicate address.
    pub(crate) fn insert(&self, device: DiscoveredDevice) -> Option<usize> {
        let index = {
            let mut inner = self.inner.write();
            if inner.index.contains_key(&device.address) {
                return None;
            }
            let index = inner.devices.len();
            inner.index.insert(device.address.clone(), index);
            inner.devices.push(device.clone());
            index
        };

        debug!("Registry gained {} at position {}", device, index);

        let _ = self.event_tx.send(RegistryEvent::DeviceAdded { index, device });

        Some(index)
    }

    /// Broadcast a scan lifecycle change.
    pub(crate) fn notify(&self, event: RegistryEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Look up a device by address.
    pub fn get(&self, address: &str) -> Option<DiscoveredDevice> {
        let inner = self.inner.read();
        inner
            .index
            .get(address)
            .map(|&index| inner.devices[index].clone())
    }

    /// Device at a display position.
    pub fn at(&self, index: usize) -> Option<DiscoveredDevice> {
        self.inner.read().devices.get(index).cloned()
    }

    /// Check if an address is known.
    pub fn contains(&self, address: &str) -> bool {
        self.inner.read().index.contains_key(address)
    }

    /// Snapshot of all devices in discovery order.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.read().devices.clone()
    }

    /// Number of devices.
    pub fn len(&self) -> usize {
        self.inner.read().devices.len()
    }

    /// Check if no device has been discovered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to registry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
