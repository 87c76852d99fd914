//! Watcher configuration.
//!
//! Timeouts for every asynchronous platform operation, channel sizes and the
//! characteristic the session reads.

use std::time::Duration;

use crate::ble::gatt::{GattTarget, Operation};
use crate::error::{Error, Result};

/// Configuration for a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WatcherConfig {
    /// Stop scanning automatically after this long. `None` scans until stopped.
    pub scan_timeout: Option<Duration>,
    /// Deadline for the connection to be established.
    pub connect_timeout: Duration,
    /// Deadline for service discovery.
    pub discovery_timeout: Duration,
    /// Deadline for a characteristic read.
    pub read_timeout: Duration,
    /// Deadline for the notification descriptor write.
    pub descriptor_write_timeout: Duration,
    /// Deadline for a clean disconnect before the resource is released anyway.
    pub disconnect_timeout: Duration,
    /// Capacity of the registry and session broadcast channels.
    pub event_capacity: usize,
    /// Capacity of the command queue to the worker.
    pub command_capacity: usize,
    /// Stop an active scan before connecting.
    pub stop_scan_on_connect: bool,
    /// The characteristic to read once services are discovered.
    pub target: GattTarget,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            descriptor_write_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            event_capacity: 64,
            command_capacity: 16,
            stop_scan_on_connect: true,
            target: GattTarget::battery_level(),
        }
    }
}

impl WatcherConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the descriptor write timeout.
    pub fn with_descriptor_write_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor_write_timeout = timeout;
        self
    }

    /// Set the disconnect timeout.
    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    /// Set the broadcast channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set whether connecting stops an active scan.
    pub fn with_stop_scan_on_connect(mut self, stop: bool) -> Self {
        self.stop_scan_on_connect = stop;
        self
    }

    /// Set the characteristic to read.
    pub fn with_target(mut self, target: GattTarget) -> Self {
        self.target = target;
        self
    }

    /// Deadline for an operation.
    ///
    /// A scan without a timeout waits indefinitely and yields `None`.
    pub fn timeout_for(&self, operation: Operation) -> Option<Duration> {
        match operation {
            Operation::Scan => self.scan_timeout,
            Operation::Connect => Some(self.connect_timeout),
            Operation::DiscoverServices => Some(self.discovery_timeout),
            Operation::Read => Some(self.read_timeout),
            Operation::WriteDescriptor => Some(self.descriptor_write_timeout),
            Operation::Disconnect => Some(self.disconnect_timeout),
        }
    }

    /// Check the configuration for unusable values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] for zero timeouts or capacities.
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("scan_timeout", self.scan_timeout),
            ("connect_timeout", Some(self.connect_timeout)),
            ("discovery_timeout", Some(self.discovery_timeout)),
            ("read_timeout", Some(self.read_timeout)),
            ("descriptor_write_timeout", Some(self.descriptor_write_timeout)),
            ("disconnect_timeout", Some(self.disconnect_timeout)),
        ];

        for (name, timeout) in timeouts {
            if timeout == Some(Duration::ZERO) {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    value: "0s".to_string(),
                });
            }
        }

        for (name, capacity) in [
            ("event_capacity", self.event_capacity),
            ("command_capacity", self.command_capacity),
        ] {
            if capacity == 0 {
                return Err(Error::InvalidParameter {
                    name: name.to_string(),
                    value: capacity.to_string(),
                });
            }
        }

        Ok(())
    }
}
