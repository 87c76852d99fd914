//! BLE connection management.
//!
//! Drives a [`ConnectionSession`] against a [`BleBackend`]: the session decides
//! what to do next, the manager issues the platform commands, tracks the
//! deadline of the operation in flight and publishes session events.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::backend::BleBackend;
use crate::ble::characteristics::ReadResult;
use crate::ble::events::GattEvent;
use crate::ble::gatt::{Operation, PendingOperation};
use crate::ble::session::{ConnectionSession, NotificationState, SessionAction, SessionEvent};
use crate::config::WatcherConfig;
use crate::error::{Error, Result, SessionError};
use crate::registry::DiscoveredDevice;

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No connection.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Link established.
    Connected,
    /// Service discovery in progress.
    Discovering,
    /// Services are known; the read may be issued.
    ServicesDiscovered,
    /// The target characteristic was read.
    Completed,
    /// Currently disconnecting.
    Disconnecting,
    /// The workflow failed.
    Failed,
}

impl ConnectionState {
    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Discovering | Self::ServicesDiscovered | Self::Completed
        )
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Discovering | Self::Disconnecting
        )
    }

    /// Check if a platform connection resource is held.
    pub fn holds_link(&self) -> bool {
        !matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Check if the workflow has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Discovering => write!(f, "Discovering"),
            Self::ServicesDiscovered => write!(f, "ServicesDiscovered"),
            Self::Completed => write!(f, "Completed"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time view of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// The selected device.
    pub device: DiscoveredDevice,
    /// Session state.
    pub state: ConnectionState,
    /// Operation waiting on the platform.
    pub awaiting: Option<Operation>,
    /// Discovered service UUIDs.
    pub services: Vec<Uuid>,
    /// Notification subscription state.
    pub notifications: NotificationState,
    /// Why the session failed or was cancelled.
    pub last_error: Option<SessionError>,
}

impl From<&ConnectionSession> for SessionSnapshot {
    fn from(session: &ConnectionSession) -> Self {
        Self {
            device: session.device().clone(),
            state: session.state(),
            awaiting: session.awaiting(),
            services: session
                .catalog()
                .map(|c| c.service_uuids())
                .unwrap_or_default(),
            notifications: session.notifications(),
            last_error: session.last_error().cloned(),
        }
    }
}

/// Resolved once the session's read completes or the session fails.
pub type ReadReply = oneshot::Sender<Result<ReadResult>>;

/// Manages the single connection session.
pub struct ConnectionManager {
    /// Platform stack commands are issued to.
    backend: Arc<dyn BleBackend>,
    /// Timeouts and target characteristic.
    config: WatcherConfig,
    /// Current or most recent session.
    session: Option<ConnectionSession>,
    /// Deadline of the operation in flight.
    pending: Option<PendingOperation>,
    /// Caller waiting on the current session's read.
    reader: Option<ReadReply>,
    /// Channel for session events.
    event_tx: broadcast::Sender<SessionEvent>,
}

impl ConnectionManager {
    /// Create a connection manager publishing on `event_tx`.
    pub fn new(
        backend: Arc<dyn BleBackend>,
        config: WatcherConfig,
        event_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            backend,
            config,
            session: None,
            pending: None,
            reader: None,
            event_tx,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(ConnectionSession::state)
            .unwrap_or_default()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// The current or most recent session.
    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    /// Snapshot of the current session.
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.session.as_ref().map(SessionSnapshot::from)
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// When the operation in flight times out.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.map(|p| p.deadline)
    }

    /// Start a session with a device.
    ///
    /// A previous session is superseded and its connection released first.
    pub async fn connect(&mut self, device: DiscoveredDevice) {
        self.start(device, None).await;
    }

    /// Start a session with a device and answer `reply` with its read result.
    ///
    /// `reply` receives the session's failure instead if the read never
    /// completes.
    pub async fn read(&mut self, device: DiscoveredDevice, reply: ReadReply) {
        self.start(device, Some(reply)).await;
    }

    async fn start(&mut self, device: DiscoveredDevice, reply: Option<ReadReply>) {
        if let Some(previous) = self.session.as_mut() {
            let actions = previous.supersede();
            self.apply(actions).await;
        }

        if let Some(stale) = self.reader.take() {
            let _ = stale.send(Err(SessionError::Superseded.into()));
        }

        info!("Connecting to {}", device);

        let mut session = ConnectionSession::new(device, self.config.target);
        let actions = session.start();
        self.session = Some(session);
        self.reader = reply;
        self.apply(actions).await;
    }

    /// Feed a GATT event reported for `address`.
    ///
    /// Events for any device other than the session's are dropped.
    pub async fn handle_event(&mut self, address: &str, event: GattEvent) {
        let Some(session) = self.session.as_mut() else {
            debug!("No session, dropping {} event from {}", event.kind(), address);
            return;
        };

        if session.address() != address {
            debug!("Dropping {} event from stale device {}", event.kind(), address);
            return;
        }

        let actions = session.handle(&event);
        self.apply(actions).await;
    }

    /// Expire the operation in flight if its deadline has passed.
    pub async fn handle_timeout(&mut self) {
        let Some(pending) = self.pending else {
            return;
        };

        if pending.deadline > Instant::now() {
            return;
        }

        self.pending = None;
        warn!("Timed out waiting for {}", pending.operation);

        if let Some(session) = self.session.as_mut() {
            let actions = session.on_timeout(pending.operation);
            self.apply(actions).await;
        }
    }

    /// Disconnect from the device.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut().filter(|s| s.holds_link()) else {
            return Err(Error::NotConnected);
        };

        let actions = session.request_disconnect();
        self.apply(actions).await;
        Ok(())
    }

    /// Subscribe to notifications of the resolved characteristic.
    pub async fn enable_notifications(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NotConnected)?;

        let actions = session.enable_notifications()?;
        self.apply(actions).await;
        Ok(())
    }

    /// Release the connection without waiting for the device.
    ///
    /// An unfinished session is reported as cancelled.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.as_mut() {
            let actions = session.cancel();
            self.apply(actions).await;
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.send(Err(SessionError::Cancelled.into()));
        }
    }

    /// Carry out session actions in order.
    async fn apply(&mut self, actions: Vec<SessionAction>) {
        let mut queue: VecDeque<SessionAction> = actions.into();

        while let Some(action) = queue.pop_front() {
            let operation = action.operation();

            let result = match action {
                SessionAction::Emit(event) => {
                    self.answer_reader(&event);
                    let _ = self.event_tx.send(event);
                    continue;
                }
                SessionAction::Close => {
                    if let Err(e) = self.backend.close().await {
                        warn!("Failed to close connection: {}", e);
                    }
                    continue;
                }
                SessionAction::Connect { address } => self.backend.connect(&address).await,
                SessionAction::DiscoverServices => self.backend.discover_services().await,
                SessionAction::Read {
                    service,
                    characteristic,
                } => {
                    self.backend
                        .read_characteristic(service, characteristic)
                        .await
                }
                SessionAction::WriteDescriptor {
                    service,
                    characteristic,
                    descriptor,
                    value,
                } => {
                    self.backend
                        .write_descriptor(service, characteristic, descriptor, value)
                        .await
                }
                SessionAction::Disconnect => self.backend.disconnect().await,
            };

            let Some(operation) = operation else {
                continue;
            };

            match result {
                Ok(()) => {
                    self.pending = self
                        .config
                        .timeout_for(operation)
                        .map(|timeout| PendingOperation::starting_now(operation, timeout));
                }
                Err(e) => {
                    warn!("Platform rejected {}: {}", operation, e);
                    if let Some(session) = self.session.as_mut() {
                        queue.extend(session.on_command_rejected(operation, e.to_string()));
                    }
                }
            }
        }

        let awaiting = self.session.as_ref().and_then(ConnectionSession::awaiting);
        if self.pending.map(|p| p.operation) != awaiting {
            self.pending = None;
        }
    }

    fn answer_reader(&mut self, event: &SessionEvent) {
        let outcome = match event {
            SessionEvent::ReadCompleted(result) => Ok(result.clone()),
            SessionEvent::Failed { error, .. } => Err(error.clone().into()),
            _ => return,
        };

        if let Some(reader) = self.reader.take() {
            let _ = reader.send(outcome);
        }
    }
}
