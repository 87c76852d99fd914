//! Device manager for discovering bands and reading their battery level.
//!
//! The manager is a thin handle around a background worker task. The worker
//! owns the scan controller and the connection session and is the only place
//! state changes: it consumes caller commands and the platform event queue in
//! one `select!` loop and expires operation deadlines between events.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ble::backend::BleBackend;
use crate::ble::btleplug_backend::BtleplugBackend;
use crate::ble::characteristics::ReadResult;
use crate::ble::connection::{ConnectionManager, ConnectionState, ReadReply, SessionSnapshot};
use crate::ble::events::{EventReceiver, PlatformEvent};
use crate::ble::scanner::{ScanController, ScanOutcome};
use crate::ble::session::SessionEvent;
use crate::callback::CallbackHandle;
use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use crate::registry::{DeviceRegistry, DiscoveredDevice, RegistryEvent, ScanStopReason};

/// Requests handled by the worker.
enum Command {
    StartScan {
        reply: oneshot::Sender<Result<()>>,
    },
    StopScan {
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ReadBattery {
        address: String,
        reply: ReadReply,
    },
    EnableNotifications {
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Central manager for discovering devices and reading their battery level.
pub struct DeviceManager {
    /// Active configuration.
    config: WatcherConfig,
    /// Discovered devices.
    registry: Arc<DeviceRegistry>,
    /// Command queue to the worker.
    command_tx: mpsc::Sender<Command>,
    /// Session event channel.
    session_tx: broadcast::Sender<SessionEvent>,
    /// Whether a scan is active.
    is_scanning: Arc<AtomicBool>,
    /// Stops the worker.
    shutdown: CancellationToken,
    /// Worker task handle.
    worker_handle: RwLock<Option<JoinHandle<()>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl DeviceManager {
    /// Create a new DeviceManager on the system Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(WatcherConfig::default()).await
    }

    /// Create a DeviceManager with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Bluetooth is not
    /// available.
    pub async fn with_config(config: WatcherConfig) -> Result<Self> {
        config.validate()?;

        let (backend, events) = BtleplugBackend::new().await?;
        Self::with_backend(Arc::new(backend), events, config)
    }

    /// Create a DeviceManager driving any [`BleBackend`].
    ///
    /// `events` must be the queue the backend reports completions on. Must be
    /// called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_backend(
        backend: Arc<dyn BleBackend>,
        events: EventReceiver,
        config: WatcherConfig,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(DeviceRegistry::new(config.event_capacity));
        let (session_tx, _) = broadcast::channel(config.event_capacity);
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity);
        let is_scanning = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let worker = Worker {
            backend: backend.clone(),
            stop_scan_on_connect: config.stop_scan_on_connect,
            scanner: ScanController::new(registry.clone(), config.scan_timeout),
            connection: ConnectionManager::new(backend, config.clone(), session_tx.clone()),
            is_scanning: is_scanning.clone(),
        };

        let handle = tokio::spawn(worker.run(command_rx, events, shutdown.clone()));

        Ok(Self {
            config,
            registry,
            command_tx,
            session_tx,
            is_scanning,
            shutdown,
            worker_handle: RwLock::new(Some(handle)),
            callback_counter: AtomicU64::new(0),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    /// Start scanning for devices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ScanAlreadyActive`] if a scan is running,
    /// [`Error::PermissionDenied`] if a required permission is missing, or the
    /// platform error if the scan cannot be started.
    pub async fn start_scanning(&self) -> Result<()> {
        self.request(|reply| Command::StartScan { reply }).await?
    }

    /// Stop scanning. Does nothing if no scan is active.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(|reply| Command::StopScan { reply }).await?
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.is_scanning.load(Ordering::SeqCst)
    }

    /// Get all discovered devices in discovery order.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.registry.devices()
    }

    /// Get a discovered device by address.
    pub fn get_device(&self, address: &str) -> Option<DiscoveredDevice> {
        self.registry.get(address)
    }

    /// Get the number of discovered devices.
    pub fn device_count(&self) -> usize {
        self.registry.len()
    }

    /// The device registry.
    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    /// Subscribe to registry and scan events.
    pub fn subscribe_devices(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Subscribe to session events.
    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionEvent> {
        self.session_tx.subscribe()
    }

    /// Select a discovered device and start its connection session.
    ///
    /// Returns once the connection has been requested; progress is reported
    /// through [`subscribe_sessions`](Self::subscribe_sessions).
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the address is not in the registry.
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.request(|reply| Command::Connect { address, reply }).await?
    }

    /// Connect to a device and wait for its battery level to be read.
    ///
    /// Every step of the session has a deadline, so this always returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] for an unknown address or
    /// [`Error::Session`] if the session fails.
    pub async fn read_battery(&self, address: &str) -> Result<ReadResult> {
        let address = address.to_string();
        self.request(|reply| Command::ReadBattery { address, reply }).await?
    }

    /// Subscribe to notifications of the read characteristic.
    ///
    /// Completion is reported as [`SessionEvent::NotificationsEnabled`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a session, or [`Error::Session`]
    /// if the read has not completed or the characteristic cannot notify.
    pub async fn enable_notifications(&self) -> Result<()> {
        self.request(|reply| Command::EnableNotifications { reply }).await?
    }

    /// Disconnect the current session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if no connection is held.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Snapshot of the current session.
    pub async fn session(&self) -> Result<Option<SessionSnapshot>> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> Result<ConnectionState> {
        Ok(self
            .session()
            .await?
            .map(|s| s.state)
            .unwrap_or_default())
    }

    /// Register a callback for read results and notifications.
    pub fn on_read<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ReadResult) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.session_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::ReadCompleted(result))
                    | Ok(SessionEvent::Notification(result)) => callback(result),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for newly discovered devices.
    pub fn on_device_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(usize, DiscoveredDevice) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.registry.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(RegistryEvent::DeviceAdded { index, device }) => callback(index, device),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Clean shutdown of scanning and the connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        if let Err(e) = self.request(|reply| Command::Shutdown { reply }).await {
            debug!("Worker already stopped: {}", e);
        }

        self.shutdown.cancel();

        let handle = self.worker_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        Ok(())
    }

    /// Send a command and wait for the worker's reply.
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();

        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| Error::ChannelClosed)?;

        rx.await.map_err(|_| Error::ChannelClosed)
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns all mutable scan and session state.
struct Worker {
    backend: Arc<dyn BleBackend>,
    stop_scan_on_connect: bool,
    scanner: ScanController,
    connection: ConnectionManager,
    is_scanning: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: EventReceiver,
        shutdown: CancellationToken,
    ) {
        debug!("Device manager worker started");

        loop {
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = events.recv() => self.handle_event(event).await,
                _ = sleep_until(deadline) => self.handle_deadline().await,
            }
        }

        self.teardown().await;
        debug!("Device manager worker ended");
    }

    /// Returns `false` once the worker should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartScan { reply } => {
                let _ = reply.send(self.start_scan().await);
            }
            Command::StopScan { reply } => {
                let _ = reply.send(self.stop_scan(ScanStopReason::Requested).await);
            }
            Command::Connect { address, reply } => {
                let _ = reply.send(self.connect(&address).await);
            }
            Command::ReadBattery { address, reply } => match self.select_device(&address).await {
                Ok(device) => self.connection.read(device, reply).await,
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::EnableNotifications { reply } => {
                let _ = reply.send(self.connection.enable_notifications().await);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.connection.disconnect().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.connection.snapshot());
            }
            Command::Shutdown { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return false;
            }
        }

        true
    }

    async fn handle_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::ScanResult {
                address,
                name,
                rssi,
            } => {
                if let ScanOutcome::Added(index) =
                    self.scanner.handle_result(&address, name.as_deref())
                {
                    trace!("Device {} added at {} (rssi {:?})", address, index, rssi);
                }
            }
            PlatformEvent::ScanFailed { reason } => {
                warn!("Scan failed: {}", reason);
                if self.scanner.end(ScanStopReason::Failed(reason)) {
                    self.is_scanning.store(false, Ordering::SeqCst);
                }
            }
            PlatformEvent::Gatt { address, event } => {
                self.connection.handle_event(&address, event).await;
            }
        }
    }

    async fn handle_deadline(&mut self) {
        let now = Instant::now();

        if self.scanner.deadline().is_some_and(|d| d <= now) {
            info!("Scan timeout reached");
            if let Err(e) = self.stop_scan(ScanStopReason::TimedOut).await {
                warn!("Failed to stop scan: {}", e);
            }
        }

        self.connection.handle_timeout().await;
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.scanner.deadline(), self.connection.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn start_scan(&mut self) -> Result<()> {
        if self.scanner.is_scanning() {
            return Err(Error::ScanAlreadyActive);
        }

        let required = self.backend.required_permissions();
        let report = self.backend.permissions().await?;
        report.ensure_granted(&required)?;
        self.scanner.begin()?;

        if let Err(e) = self.backend.start_scan().await {
            self.scanner.end(ScanStopReason::Failed(e.to_string()));
            return Err(e);
        }

        self.is_scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&mut self, reason: ScanStopReason) -> Result<()> {
        if !self.scanner.is_scanning() {
            return Ok(());
        }

        let result = self.backend.stop_scan().await;

        self.scanner.end(reason);
        self.is_scanning.store(false, Ordering::SeqCst);

        result
    }

    async fn connect(&mut self, address: &str) -> Result<()> {
        let device = self.select_device(address).await?;
        self.connection.connect(device).await;
        Ok(())
    }

    /// Look up a device to connect to, stopping the scan if configured.
    async fn select_device(&mut self, address: &str) -> Result<DiscoveredDevice> {
        let device = self
            .scanner
            .registry()
            .get(address)
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })?;

        if self.stop_scan_on_connect {
            if let Err(e) = self.stop_scan(ScanStopReason::Connecting).await {
                warn!("Failed to stop scan before connecting: {}", e);
            }
        }

        Ok(device)
    }

    async fn teardown(&mut self) {
        if let Err(e) = self.stop_scan(ScanStopReason::Requested).await {
            warn!("Failed to stop scan: {}", e);
        }
        self.connection.close().await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::backend::MockBleBackend;
    use crate::ble::events::{event_channel, EventSender};
    use crate::ble::events::GattEvent;
    use crate::ble::gatt::{GattCharacteristic, GattService, GattStatus, LinkState};
    use crate::ble::uuids::{BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID};
    use crate::error::SessionError;
    use crate::permissions::{required_permissions, Permission, PermissionReport, PermissionStatus};
    use btleplug::api::CharPropFlags;
    use std::time::Duration;

    fn granted(mock: &mut MockBleBackend) {
        mock.expect_required_permissions()
            .returning(|| required_permissions(33).to_vec());
        mock.expect_permissions()
            .returning(|| Ok(PermissionReport::all_granted(required_permissions(33))));
    }

    fn gatt(event: GattEvent) -> PlatformEvent {
        PlatformEvent::gatt("AA", event)
    }

    fn manager(mock: MockBleBackend, config: WatcherConfig) -> (DeviceManager, EventSender) {
        let (tx, rx) = event_channel();
        let manager = DeviceManager::with_backend(Arc::new(mock), rx, config).unwrap();
        (manager, tx)
    }

    fn scan_result(address: &str, name: Option<&str>) -> PlatformEvent {
        PlatformEvent::ScanResult {
            address: address.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
        }
    }

    async fn next_added(rx: &mut broadcast::Receiver<RegistryEvent>) -> (usize, DiscoveredDevice) {
        loop {
            if let RegistryEvent::DeviceAdded { index, device } = rx.recv().await.unwrap() {
                return (index, device);
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (_tx, rx) = event_channel();
        let result = DeviceManager::with_backend(
            Arc::new(MockBleBackend::new()),
            rx,
            WatcherConfig::default().with_read_timeout(Duration::ZERO),
        );
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }

    #[tokio::test]
    async fn test_scan_populates_registry() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan().times(1).returning(|| Ok(()));
        mock.expect_stop_scan().returning(|| Ok(()));
        mock.expect_close().returning(|| Ok(()));

        let (manager, tx) = manager(mock, WatcherConfig::default());
        let mut rx = manager.subscribe_devices();

        manager.start_scanning().await.unwrap();
        assert!(manager.is_scanning());

        tx.send(scan_result("AA", Some("Band1"))).unwrap();
        tx.send(scan_result("BB", None)).unwrap();
        tx.send(scan_result("AA", Some("Band1"))).unwrap();
        tx.send(scan_result("CC", Some("Band2"))).unwrap();

        assert_eq!(
            next_added(&mut rx).await,
            (0, DiscoveredDevice::new("AA", "Band1"))
        );
        assert_eq!(
            next_added(&mut rx).await,
            (1, DiscoveredDevice::new("CC", "Band2"))
        );
        assert_eq!(manager.device_count(), 2);

        manager.stop_scanning().await.unwrap();
        assert!(!manager.is_scanning());

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_scan_rejected() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan().times(1).returning(|| Ok(()));
        mock.expect_stop_scan().returning(|| Ok(()));
        mock.expect_close().returning(|| Ok(()));

        let (manager, _tx) = manager(mock, WatcherConfig::default());

        manager.start_scanning().await.unwrap();
        assert!(matches!(
            manager.start_scanning().await,
            Err(Error::ScanAlreadyActive)
        ));

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_blocked_by_permissions() {
        let mut mock = MockBleBackend::new();
        mock.expect_required_permissions()
            .returning(|| required_permissions(33).to_vec());
        mock.expect_permissions().returning(|| {
            Ok(PermissionReport::new()
                .with(Permission::BluetoothScan, PermissionStatus::PermanentlyDenied)
                .with(Permission::BluetoothConnect, PermissionStatus::Granted))
        });
        mock.expect_start_scan().never();
        mock.expect_close().returning(|| Ok(()));

        let (manager, _tx) = manager(mock, WatcherConfig::default());

        match manager.start_scanning().await {
            Err(Error::PermissionDenied { permanent, .. }) => assert!(permanent),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!manager.is_scanning());
    }

    #[tokio::test]
    async fn test_unreported_permission_blocks_scan() {
        let mut mock = MockBleBackend::new();
        mock.expect_required_permissions()
            .returning(|| required_permissions(33).to_vec());
        mock.expect_permissions().returning(|| {
            Ok(PermissionReport::new()
                .with(Permission::BluetoothConnect, PermissionStatus::Granted))
        });
        mock.expect_start_scan().never();
        mock.expect_close().returning(|| Ok(()));

        let (manager, _tx) = manager(mock, WatcherConfig::default());

        match manager.start_scanning().await {
            Err(Error::PermissionDenied {
                permissions,
                permanent,
            }) => {
                assert_eq!(permissions, vec![Permission::BluetoothScan.name()]);
                assert!(!permanent);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!manager.is_scanning());
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan()
            .returning(|| Err(Error::BluetoothUnavailable));
        mock.expect_close().returning(|| Ok(()));

        let (manager, _tx) = manager(mock, WatcherConfig::default());

        assert!(matches!(
            manager.start_scanning().await,
            Err(Error::BluetoothUnavailable)
        ));
        assert!(!manager.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_stops_scan() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan().returning(|| Ok(()));
        mock.expect_stop_scan().times(1).returning(|| Ok(()));
        mock.expect_close().returning(|| Ok(()));

        let config = WatcherConfig::default().with_scan_timeout(Some(Duration::from_secs(2)));
        let (manager, _tx) = manager(mock, config);
        let mut rx = manager.subscribe_devices();

        manager.start_scanning().await.unwrap();

        let reason = loop {
            if let RegistryEvent::ScanStopped { reason } = rx.recv().await.unwrap() {
                break reason;
            }
        };
        assert_eq!(reason, ScanStopReason::TimedOut);
        assert!(!manager.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_failure_ends_scan() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan().returning(|| Ok(()));
        mock.expect_stop_scan().never();
        mock.expect_close().returning(|| Ok(()));

        let (manager, tx) = manager(mock, WatcherConfig::default());
        let mut rx = manager.subscribe_devices();

        manager.start_scanning().await.unwrap();
        tx.send(PlatformEvent::ScanFailed {
            reason: "adapter reset".to_string(),
        })
        .unwrap();

        let reason = loop {
            if let RegistryEvent::ScanStopped { reason } = rx.recv().await.unwrap() {
                break reason;
            }
        };
        assert_eq!(reason, ScanStopReason::Failed("adapter reset".to_string()));
    }

    #[tokio::test]
    async fn test_connect_unknown_device() {
        let mut mock = MockBleBackend::new();
        mock.expect_connect().never();
        mock.expect_close().returning(|| Ok(()));

        let (manager, _tx) = manager(mock, WatcherConfig::default());

        assert!(matches!(
            manager.connect("AA").await,
            Err(Error::DeviceNotFound { .. })
        ));
        assert!(matches!(
            manager.read_battery("AA").await,
            Err(Error::DeviceNotFound { .. })
        ));
        assert_eq!(
            manager.connection_state().await.unwrap(),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_connect_stops_scan() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan().returning(|| Ok(()));
        mock.expect_stop_scan().times(1).returning(|| Ok(()));
        mock.expect_connect()
            .withf(|address: &str| address == "AA")
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_close().returning(|| Ok(()));

        let (manager, tx) = manager(mock, WatcherConfig::default());
        let mut rx = manager.subscribe_devices();

        manager.start_scanning().await.unwrap();
        tx.send(scan_result("AA", Some("Band1"))).unwrap();
        next_added(&mut rx).await;

        manager.connect("AA").await.unwrap();

        assert!(!manager.is_scanning());
        assert_eq!(
            manager.connection_state().await.unwrap(),
            ConnectionState::Connecting
        );
    }

    #[tokio::test]
    async fn test_read_battery_survives_lagging_subscribers() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan().returning(|| Ok(()));
        mock.expect_stop_scan().returning(|| Ok(()));
        mock.expect_connect().returning(|_| Ok(()));
        mock.expect_discover_services().returning(|| Ok(()));
        mock.expect_read_characteristic().returning(|_, _| Ok(()));
        mock.expect_close().returning(|| Ok(()));

        // Far fewer slots than the session publishes.
        let config = WatcherConfig::default().with_event_capacity(2);
        let (manager, tx) = manager(mock, config);
        let manager = Arc::new(manager);
        let mut devices = manager.subscribe_devices();
        let _idle = manager.subscribe_sessions();

        manager.start_scanning().await.unwrap();
        tx.send(scan_result("AA", Some("Band1"))).unwrap();
        next_added(&mut devices).await;

        let reader = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.read_battery("AA").await })
        };

        while manager.connection_state().await.unwrap() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }

        tx.send(gatt(GattEvent::ConnectionStateChanged {
            status: GattStatus::Success,
            state: LinkState::Connected,
        }))
        .unwrap();
        tx.send(gatt(GattEvent::ServicesDiscovered {
            status: GattStatus::Success,
            services: vec![GattService::new(
                BATTERY_SERVICE_UUID,
                vec![GattCharacteristic::new(BATTERY_LEVEL_UUID, CharPropFlags::READ)],
            )],
        }))
        .unwrap();
        tx.send(gatt(GattEvent::CharacteristicRead {
            status: GattStatus::Success,
            characteristic: BATTERY_LEVEL_UUID,
            value: vec![0x55],
        }))
        .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(3), reader)
            .await
            .expect("read_battery returned")
            .unwrap()
            .unwrap();
        assert_eq!(result.battery_level().map(|b| b.percent()), Some(85));
        assert_eq!(
            manager.connection_state().await.unwrap(),
            ConnectionState::Completed
        );
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_read() {
        let mut mock = MockBleBackend::new();
        granted(&mut mock);
        mock.expect_start_scan().returning(|| Ok(()));
        mock.expect_stop_scan().returning(|| Ok(()));
        mock.expect_connect().returning(|_| Ok(()));
        mock.expect_close().returning(|| Ok(()));

        let (manager, tx) = manager(mock, WatcherConfig::default());
        let manager = Arc::new(manager);
        let mut devices = manager.subscribe_devices();

        manager.start_scanning().await.unwrap();
        tx.send(scan_result("AA", Some("Band1"))).unwrap();
        next_added(&mut devices).await;

        let reader = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.read_battery("AA").await })
        };

        while manager.connection_state().await.unwrap() != ConnectionState::Connecting {
            tokio::task::yield_now().await;
        }
        manager.shutdown().await.unwrap();

        assert!(matches!(
            reader.await.unwrap(),
            Err(Error::Session(SessionError::Cancelled))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let mut mock = MockBleBackend::new();
        mock.expect_close().returning(|| Ok(()));

        let (manager, _tx) = manager(mock, WatcherConfig::default());
        manager.shutdown().await.unwrap();

        assert!(matches!(
            manager.stop_scanning().await,
            Err(Error::ChannelClosed)
        ));
    }
}
