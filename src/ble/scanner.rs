//! BLE scanning functionality.
//!
//! The scan controller turns scan results into registry entries: unnamed
//! devices are dropped, known addresses are ignored and everything else is
//! appended in discovery order.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::registry::{DeviceRegistry, DiscoveredDevice, RegistryEvent, ScanStopReason};

/// What happened to a single scan result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The device was appended at this position.
    Added(usize),
    /// The address was already in the registry.
    Duplicate,
    /// The device advertised no usable name.
    Unnamed,
    /// No scan is active.
    NotScanning,
}

/// Drives a single scan session and feeds the device registry.
pub struct ScanController {
    /// Registry fed by this scanner.
    registry: Arc<DeviceRegistry>,
    /// When the active scan started, if one is active.
    started_at: Option<Instant>,
    /// Automatic stop after this long.
    scan_timeout: Option<Duration>,
}

impl ScanController {
    /// Create a scan controller feeding `registry`.
    pub fn new(registry: Arc<DeviceRegistry>, scan_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            started_at: None,
            scan_timeout,
        }
    }

    /// Mark a scan as started.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanAlreadyActive`] if a scan is already running.
    pub fn begin(&mut self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::ScanAlreadyActive);
        }

        info!("Starting BLE scan");

        self.started_at = Some(Instant::now());
        self.registry.notify(RegistryEvent::ScanStarted);

        Ok(())
    }

    /// Mark the scan as ended.
    ///
    /// Returns `false` if no scan was active.
    pub fn end(&mut self, reason: ScanStopReason) -> bool {
        let Some(started_at) = self.started_at.take() else {
            debug!("Not scanning, ignoring stop request");
            return false;
        };

        info!(
            "BLE scan ended after {:?} ({:?}), {} devices known",
            started_at.elapsed(),
            reason,
            self.registry.len()
        );

        self.registry.notify(RegistryEvent::ScanStopped { reason });

        true
    }

    /// Check if a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.started_at.is_some()
    }

    /// When the active scan times out, if it does.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.started_at, self.scan_timeout) {
            (Some(started_at), Some(timeout)) => Some(started_at + timeout),
            _ => None,
        }
    }

    /// Handle one scan result.
    pub fn handle_result(&mut self, address: &str, name: Option<&str>) -> ScanOutcome {
        if !self.is_scanning() {
            trace!("Scan result for {} outside of a scan", address);
            return ScanOutcome::NotScanning;
        }

        let name = match name {
            Some(name) if !name.is_empty() => name,
            _ => {
                trace!("Ignoring unnamed device {}", address);
                return ScanOutcome::Unnamed;
            }
        };

        if self.registry.contains(address) {
            trace!("Device {} already known", address);
            return ScanOutcome::Duplicate;
        }

        info!("Discovered BLE device: {} - Address: {}", name, address);

        match self.registry.insert(DiscoveredDevice::new(address, name)) {
            Some(index) => ScanOutcome::Added(index),
            None => ScanOutcome::Duplicate,
        }
    }

    /// The registry fed by this scanner.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }
}
