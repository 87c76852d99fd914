//! [`BleBackend`] implementation on top of btleplug.
//!
//! btleplug exposes async request/response calls; each command here spawns a
//! task that awaits the call and reports the completion on the event queue,
//! so the rest of the crate only ever sees platform events.

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::backend::BleBackend;
use crate::ble::characteristics::DISABLE_NOTIFICATION_VALUE;
use crate::ble::events::{event_channel, EventReceiver, EventSender, GattEvent, PlatformEvent};
use crate::ble::gatt::{GattCharacteristic, GattService, GattStatus, LinkState, Operation};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::{Error, Result, SessionError};
use crate::permissions::{Permission, PermissionReport};

/// The device a connection was requested for.
#[derive(Clone)]
struct ActiveDevice {
    address: String,
    peripheral: Peripheral,
}

/// Identifies which connect request currently owns the link.
///
/// A connect that completes after its request was closed or replaced must
/// release the link it opened.
#[derive(Debug, Default)]
struct LinkGeneration(AtomicU64);

impl LinkGeneration {
    /// Start a new connect request.
    fn begin(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Disown every outstanding connect request.
    fn invalidate(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.0.load(Ordering::SeqCst) == generation
    }
}

/// BLE backend driving the first system Bluetooth adapter.
pub struct BtleplugBackend {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Peripherals seen while scanning, by address.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Device of the current connection.
    active: Arc<RwLock<Option<ActiveDevice>>>,
    /// Platform event queue.
    event_tx: EventSender,
    /// Adapter event pump.
    pump_handle: RwLock<Option<JoinHandle<()>>>,
    /// Notification pump of the current connection.
    notification_handle: RwLock<Option<JoinHandle<()>>>,
    /// Connect request in flight.
    connect_handle: RwLock<Option<JoinHandle<()>>>,
    /// Owner of the link.
    generation: Arc<LinkGeneration>,
}

impl BtleplugBackend {
    /// Create a backend on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, EventReceiver)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a backend with a specific adapter.
    ///
    /// Must be called within a Tokio runtime.
    pub fn with_adapter(adapter: Adapter) -> (Self, EventReceiver) {
        let (event_tx, event_rx) = event_channel();

        let backend = Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            active: Arc::new(RwLock::new(None)),
            event_tx,
            pump_handle: RwLock::new(None),
            notification_handle: RwLock::new(None),
            connect_handle: RwLock::new(None),
            generation: Arc::new(LinkGeneration::default()),
        };
        backend.start_event_pump();

        (backend, event_rx)
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn start_event_pump(&self) {
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let active = self.active.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    let _ = event_tx.send(PlatformEvent::ScanFailed {
                        reason: e.to_string(),
                    });
                    return;
                }
            };

            while let Some(event) = events.next().await {
                Self::handle_event(event, &adapter, &peripherals, &active, &event_tx).await;
            }

            debug!("Adapter event loop ended");
        });

        *self.pump_handle.write() = Some(handle);
    }

    /// Handle a BLE central event.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        active: &Arc<RwLock<Option<ActiveDevice>>>,
        event_tx: &EventSender,
    ) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                trace!("Device advertised: {:?}", id);
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            CentralEvent::DeviceConnected(id) => {
                debug!("Device connected: {:?}", id);
            }
            CentralEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);

                let address = active
                    .read()
                    .as_ref()
                    .filter(|a| a.peripheral.id() == id)
                    .map(|a| a.address.clone());

                if let Some(address) = address {
                    let _ = event_tx.send(PlatformEvent::gatt(
                        address,
                        GattEvent::ConnectionStateChanged {
                            status: GattStatus::Success,
                            state: LinkState::Disconnected,
                        },
                    ));
                }
            }
            CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                warn!("Bluetooth adapter powered off");
                let _ = event_tx.send(PlatformEvent::ScanFailed {
                    reason: "Bluetooth adapter powered off".to_string(),
                });
            }
            _ => {}
        }
    }

    /// Report an advertising peripheral as a scan result.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &EventSender,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        // Some platforms (macOS) hide the hardware address.
        let address = if properties.address == BDAddr::from([0u8; 6]) {
            id.to_string()
        } else {
            properties.address.to_string()
        };

        peripherals.write().insert(address.clone(), peripheral);

        let _ = event_tx.send(PlatformEvent::ScanResult {
            address,
            name: properties.local_name,
            rssi: properties.rssi,
        });
    }

    fn active(&self) -> Result<ActiveDevice> {
        self.active.read().clone().ok_or(Error::NotConnected)
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(Error::Session(SessionError::CharacteristicNotFound {
                uuid: characteristic,
            }))
    }

    fn start_notification_pump(&self, device: ActiveDevice) {
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut notifications = match device.peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("Failed to get notifications stream: {}", e);
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                let _ = event_tx.send(PlatformEvent::gatt(
                    device.address.clone(),
                    GattEvent::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    },
                ));
            }

            debug!("Notification listener ended");
        });

        if let Some(previous) = self.notification_handle.write().replace(handle) {
            previous.abort();
        }
    }

    fn stop_notification_pump(&self) {
        if let Some(handle) = self.notification_handle.write().take() {
            handle.abort();
        }
    }

    fn abort_connect(&self) {
        self.generation.invalidate();
        if let Some(handle) = self.connect_handle.write().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    async fn permissions(&self) -> Result<PermissionReport> {
        // Desktop stacks grant access at the OS level.
        Ok(PermissionReport::default())
    }

    fn required_permissions(&self) -> Vec<Permission> {
        Vec::new()
    }

    async fn start_scan(&self) -> Result<()> {
        info!("Starting BLE scan");

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)
    }

    async fn stop_scan(&self) -> Result<()> {
        info!("Stopping BLE scan");

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self
            .peripherals
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })?;

        self.abort_connect();

        let device = ActiveDevice {
            address: address.to_string(),
            peripheral,
        };
        *self.active.write() = Some(device.clone());

        let generation = self.generation.clone();
        let owner = generation.begin();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let (status, state) = match device.peripheral.connect().await {
                Ok(()) if !generation.is_current(owner) => {
                    debug!("Releasing abandoned link to {}", device.address);
                    if let Err(e) = device.peripheral.disconnect().await {
                        warn!("Failed to release {}: {}", device.address, e);
                    }
                    return;
                }
                Ok(()) => (GattStatus::Success, LinkState::Connected),
                Err(e) => {
                    warn!("Connecting to {} failed: {}", device.address, e);
                    (status_for(Operation::Connect, &e), LinkState::Disconnected)
                }
            };

            let _ = event_tx.send(PlatformEvent::gatt(
                device.address,
                GattEvent::ConnectionStateChanged { status, state },
            ));
        });

        *self.connect_handle.write() = Some(handle);

        Ok(())
    }

    async fn discover_services(&self) -> Result<()> {
        let device = self.active()?;

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let event = match device.peripheral.discover_services().await {
                Ok(()) => GattEvent::ServicesDiscovered {
                    status: GattStatus::Success,
                    services: gatt_services(&device.peripheral.services()),
                },
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", device.address, e);
                    GattEvent::ServicesDiscovered {
                        status: status_for(Operation::DiscoverServices, &e),
                        services: Vec::new(),
                    }
                }
            };

            let _ = event_tx.send(PlatformEvent::gatt(device.address, event));
        });

        Ok(())
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let device = self.active()?;
        let target = Self::find_characteristic(&device.peripheral, service, characteristic)?;

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let (status, value) = match device.peripheral.read(&target).await {
                Ok(value) => (GattStatus::Success, value),
                Err(e) => (status_for(Operation::Read, &e), Vec::new()),
            };

            let _ = event_tx.send(PlatformEvent::gatt(
                device.address,
                GattEvent::CharacteristicRead {
                    status,
                    characteristic,
                    value,
                },
            ));
        });

        Ok(())
    }

    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    ) -> Result<()> {
        let device = self.active()?;
        let target = Self::find_characteristic(&device.peripheral, service, characteristic)?;

        let target_descriptor = if descriptor == CLIENT_CHARACTERISTIC_CONFIG_UUID {
            // btleplug owns the CCCD; subscribe() writes it for us.
            None
        } else {
            let found = target
                .descriptors
                .iter()
                .find(|d| d.uuid == descriptor)
                .cloned()
                .ok_or_else(|| Error::InvalidParameter {
                    name: "descriptor".to_string(),
                    value: descriptor.to_string(),
                })?;
            Some(found)
        };

        let enable = value[..] != DISABLE_NOTIFICATION_VALUE[..];
        if target_descriptor.is_none() && enable {
            self.start_notification_pump(device.clone());
        }

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = match &target_descriptor {
                Some(d) => device.peripheral.write_descriptor(d, &value).await,
                None if enable => device.peripheral.subscribe(&target).await,
                None => device.peripheral.unsubscribe(&target).await,
            };

            let status = match result {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Writing descriptor {} failed: {}", descriptor, e);
                    status_for(Operation::WriteDescriptor, &e)
                }
            };

            let _ = event_tx.send(PlatformEvent::gatt(
                device.address,
                GattEvent::DescriptorWrite {
                    status,
                    characteristic,
                    descriptor,
                },
            ));
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let device = self.active()?;

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let status = match device.peripheral.disconnect().await {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Disconnecting from {} failed: {}", device.address, e);
                    status_for(Operation::Disconnect, &e)
                }
            };

            let _ = event_tx.send(PlatformEvent::gatt(
                device.address,
                GattEvent::ConnectionStateChanged {
                    status,
                    state: LinkState::Disconnected,
                },
            ));
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.abort_connect();
        self.stop_notification_pump();

        let Some(device) = self.active.write().take() else {
            return Ok(());
        };

        debug!("Closing connection to {}", device.address);

        // The platform may have opened the link before the connect task was aborted.
        if device.peripheral.is_connected().await.unwrap_or(true) {
            if let Err(e) = device.peripheral.disconnect().await {
                warn!("Failed to release {}: {}", device.address, e);
            }
        }

        Ok(())
    }
}

impl Drop for BtleplugBackend {
    fn drop(&mut self) {
        self.abort_connect();
        self.stop_notification_pump();
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }
    }
}

/// Map a btleplug failure onto the status a platform callback would carry.
fn status_for(operation: Operation, error: &btleplug::Error) -> GattStatus {
    match (operation, error) {
        (Operation::Read, btleplug::Error::PermissionDenied) => GattStatus::ReadNotPermitted,
        (Operation::WriteDescriptor, btleplug::Error::PermissionDenied) => {
            GattStatus::WriteNotPermitted
        }
        (_, btleplug::Error::PermissionDenied) => GattStatus::InsufficientAuthentication,
        (_, btleplug::Error::NotSupported(_)) => GattStatus::RequestNotSupported,
        (Operation::Connect, _) => GattStatus::Error,
        _ => GattStatus::Failure,
    }
}

/// Convert btleplug's service table into discovery order.
fn gatt_services(services: &BTreeSet<btleplug::api::Service>) -> Vec<GattService> {
    services
        .iter()
        .map(|service| {
            GattService::new(
                service.uuid,
                service
                    .characteristics
                    .iter()
                    .map(|c| GattCharacteristic::new(c.uuid, c.properties))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
    use btleplug::api::{CharPropFlags, Service};

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(Operation::Read, &btleplug::Error::PermissionDenied),
            GattStatus::ReadNotPermitted
        );
        assert_eq!(
            status_for(Operation::WriteDescriptor, &btleplug::Error::PermissionDenied),
            GattStatus::WriteNotPermitted
        );
        assert_eq!(
            status_for(
                Operation::Read,
                &btleplug::Error::NotSupported("read".to_string())
            ),
            GattStatus::RequestNotSupported
        );
        assert_eq!(
            status_for(Operation::Connect, &btleplug::Error::DeviceNotFound),
            GattStatus::Error
        );
        assert_eq!(
            status_for(Operation::DiscoverServices, &btleplug::Error::NotConnected),
            GattStatus::Failure
        );
    }

    #[test]
    fn test_link_generation() {
        let generation = LinkGeneration::default();

        let first = generation.begin();
        assert!(generation.is_current(first));

        // A newer connect disowns the first one.
        let second = generation.begin();
        assert!(!generation.is_current(first));
        assert!(generation.is_current(second));

        // Closing disowns the connect in flight.
        generation.invalidate();
        assert!(!generation.is_current(second));
    }

    #[test]
    fn test_gatt_services_conversion() {
        let mut characteristics = BTreeSet::new();
        characteristics.insert(Characteristic {
            uuid: BATTERY_LEVEL_UUID,
            service_uuid: BATTERY_SERVICE_UUID,
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::new(),
        });

        let mut services = BTreeSet::new();
        services.insert(Service {
            uuid: BATTERY_SERVICE_UUID,
            primary: true,
            characteristics,
        });

        let converted = gatt_services(&services);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].uuid, BATTERY_SERVICE_UUID);
        assert_eq!(converted[0].characteristics[0].uuid, BATTERY_LEVEL_UUID);
        assert!(converted[0].characteristics[0].supports_notifications());
    }
}
