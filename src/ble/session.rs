//! Connection session state machine.
//!
//! A [`ConnectionSession`] is a pure state machine: it consumes GATT events
//! and returns the [`SessionAction`]s the connection manager must carry out.
//! It performs no I/O itself.
//!
//! ```text
//! Disconnected --start--> Connecting --connected--> Connected --(auto)--> Discovering
//!     --discovered--> ServicesDiscovered --read ok--> Completed
//! ```
//!
//! Any step may fail; `Failed` and `Completed` end the workflow.

use btleplug::api::CharPropFlags;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{
    ReadNotifyHandler, ReadResult, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
};
use crate::ble::connection::ConnectionState;
use crate::ble::events::GattEvent;
use crate::ble::gatt::{GattService, GattStatus, GattTarget, LinkState, Operation};
use crate::ble::resolver::{ResolvedCharacteristic, ServiceCatalog};
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::SessionError;
use crate::registry::DiscoveredDevice;

/// Observable outcome of a session step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session moved to a new state.
    StateChanged {
        /// Device address.
        address: String,
        /// New state.
        state: ConnectionState,
    },
    /// Services were discovered.
    ServicesDiscovered {
        /// Device address.
        address: String,
        /// Every service UUID in discovery order.
        services: Vec<Uuid>,
    },
    /// The target characteristic was read.
    ReadCompleted(ReadResult),
    /// A notification arrived.
    Notification(ReadResult),
    /// Notifications were enabled on the target characteristic.
    NotificationsEnabled {
        /// Device address.
        address: String,
        /// The characteristic.
        characteristic: Uuid,
    },
    /// An optional operation failed; the session continues.
    OperationFailed {
        /// Device address.
        address: String,
        /// What went wrong.
        error: SessionError,
    },
    /// The session failed and will make no further progress.
    Failed {
        /// Device address.
        address: String,
        /// What went wrong.
        error: SessionError,
    },
}

impl SessionEvent {
    /// Address of the device the event concerns.
    pub fn address(&self) -> &str {
        match self {
            Self::StateChanged { address, .. }
            | Self::ServicesDiscovered { address, .. }
            | Self::NotificationsEnabled { address, .. }
            | Self::OperationFailed { address, .. }
            | Self::Failed { address, .. } => address,
            Self::ReadCompleted(result) | Self::Notification(result) => &result.address,
        }
    }
}

/// Work the connection manager must do on behalf of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Open the GATT connection.
    Connect {
        /// Device address.
        address: String,
    },
    /// Start service discovery.
    DiscoverServices,
    /// Read a characteristic.
    Read {
        /// Owning service.
        service: Uuid,
        /// Characteristic to read.
        characteristic: Uuid,
    },
    /// Write a descriptor.
    WriteDescriptor {
        /// Owning service.
        service: Uuid,
        /// Owning characteristic.
        characteristic: Uuid,
        /// Descriptor to write.
        descriptor: Uuid,
        /// Value to write.
        value: Vec<u8>,
    },
    /// Ask the device to disconnect.
    Disconnect,
    /// Release the connection resource.
    Close,
    /// Publish an event to subscribers.
    Emit(SessionEvent),
}

impl SessionAction {
    /// The platform operation this action starts, if any.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Connect { .. } => Some(Operation::Connect),
            Self::DiscoverServices => Some(Operation::DiscoverServices),
            Self::Read { .. } => Some(Operation::Read),
            Self::WriteDescriptor { .. } => Some(Operation::WriteDescriptor),
            Self::Disconnect => Some(Operation::Disconnect),
            Self::Close | Self::Emit(_) => None,
        }
    }
}

/// Notification subscription state of the target characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NotificationState {
    /// Not subscribed.
    #[default]
    Disabled,
    /// Descriptor write in flight.
    Enabling,
    /// Subscribed.
    Enabled,
}

/// State of the single connection to a selected device.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    device: DiscoveredDevice,
    target: GattTarget,
    state: ConnectionState,
    /// Operation whose completion event is outstanding.
    awaiting: Option<Operation>,
    catalog: Option<ServiceCatalog>,
    resolved: Option<ResolvedCharacteristic>,
    handler: ReadNotifyHandler,
    notifications: NotificationState,
    last_error: Option<SessionError>,
    reads_issued: usize,
}

impl ConnectionSession {
    /// Create a session for a selected device.
    pub fn new(device: DiscoveredDevice, target: GattTarget) -> Self {
        let handler = ReadNotifyHandler::new(device.address.clone(), target.characteristic);

        Self {
            device,
            target,
            state: ConnectionState::Disconnected,
            awaiting: None,
            catalog: None,
            resolved: None,
            handler,
            notifications: NotificationState::Disabled,
            last_error: None,
            reads_issued: 0,
        }
    }

    /// The selected device.
    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    /// Address of the selected device.
    pub fn address(&self) -> &str {
        &self.device.address
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Operation waiting on a platform event.
    pub fn awaiting(&self) -> Option<Operation> {
        self.awaiting
    }

    /// Services discovered during this session.
    pub fn catalog(&self) -> Option<&ServiceCatalog> {
        self.catalog.as_ref()
    }

    /// The characteristic being read.
    pub fn resolved(&self) -> Option<&ResolvedCharacteristic> {
        self.resolved.as_ref()
    }

    /// Notification subscription state.
    pub fn notifications(&self) -> NotificationState {
        self.notifications
    }

    /// Why the session failed or was cancelled.
    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    /// Number of read requests issued.
    pub fn reads_issued(&self) -> usize {
        self.reads_issued
    }

    /// Check if the workflow has ended.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if a platform connection resource is held.
    pub fn holds_link(&self) -> bool {
        self.state.holds_link()
    }

    /// Begin connecting.
    pub fn start(&mut self) -> Vec<SessionAction> {
        if self.state != ConnectionState::Disconnected {
            warn!("Session for {} already started", self.device);
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.transition(ConnectionState::Connecting, &mut actions);
        self.awaiting = Some(Operation::Connect);
        actions.push(SessionAction::Connect {
            address: self.device.address.clone(),
        });
        actions
    }

    /// Feed a GATT event for this session's device.
    pub fn handle(&mut self, event: &GattEvent) -> Vec<SessionAction> {
        match event {
            GattEvent::ConnectionStateChanged { status, state } => {
                self.on_connection_state(*status, *state)
            }
            GattEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(*status, services)
            }
            GattEvent::CharacteristicRead {
                status,
                characteristic,
                value,
            } => self.on_characteristic_read(*status, characteristic, value),
            GattEvent::CharacteristicWrite {
                status,
                characteristic,
            } => match ReadNotifyHandler::on_write(*characteristic, *status) {
                Ok(()) => Vec::new(),
                Err(error) => vec![self.operation_failed(error)],
            },
            GattEvent::DescriptorWrite {
                status,
                characteristic,
                ..
            } => self.on_descriptor_write(*status, characteristic),
            GattEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_characteristic_changed(*characteristic, value),
        }
    }

    /// Mark the session failed and release the connection.
    pub fn fail(&mut self, error: SessionError) -> Vec<SessionAction> {
        if self.state == ConnectionState::Failed {
            return Vec::new();
        }

        warn!("Session for {} failed: {}", self.device, error);

        self.awaiting = None;
        self.last_error = Some(error.clone());

        let mut actions = vec![SessionAction::Close];
        self.transition(ConnectionState::Failed, &mut actions);
        actions.push(SessionAction::Emit(SessionEvent::Failed {
            address: self.device.address.clone(),
            error,
        }));
        actions
    }

    /// Handle an operation whose deadline passed.
    pub fn on_timeout(&mut self, operation: Operation) -> Vec<SessionAction> {
        if self.awaiting != Some(operation) {
            return Vec::new();
        }

        match operation {
            Operation::Disconnect => self.release(),
            Operation::WriteDescriptor => {
                self.awaiting = None;
                self.notifications = NotificationState::Disabled;
                vec![self.operation_failed(SessionError::Timeout { operation })]
            }
            _ => self.fail(SessionError::Timeout { operation }),
        }
    }

    /// Handle a platform refusing to start an operation.
    pub fn on_command_rejected(
        &mut self,
        operation: Operation,
        reason: String,
    ) -> Vec<SessionAction> {
        let error = SessionError::CommandRejected { operation, reason };

        match operation {
            Operation::Disconnect => self.release(),
            Operation::WriteDescriptor => {
                self.awaiting = None;
                self.notifications = NotificationState::Disabled;
                vec![self.operation_failed(error)]
            }
            _ => self.fail(error),
        }
    }

    /// Tear the session down cleanly at the caller's request.
    ///
    /// An operation still in flight is abandoned and reported as cancelled.
    pub fn request_disconnect(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();

        match self.state {
            ConnectionState::Disconnected
            | ConnectionState::Failed
            | ConnectionState::Disconnecting => return actions,
            ConnectionState::Connecting => {
                actions.push(self.cancelled());
                actions.extend(self.release());
                return actions;
            }
            ConnectionState::Connected
            | ConnectionState::Discovering
            | ConnectionState::ServicesDiscovered => actions.push(self.cancelled()),
            ConnectionState::Completed => {}
        }

        info!("Disconnecting from {}", self.device);

        self.awaiting = Some(Operation::Disconnect);
        self.transition(ConnectionState::Disconnecting, &mut actions);
        actions.push(SessionAction::Disconnect);
        actions
    }

    /// Give way to a session for another `connect()`.
    pub fn supersede(&mut self) -> Vec<SessionAction> {
        self.abandon(SessionError::Superseded)
    }

    /// Abandon the session because its owner is shutting down.
    pub fn cancel(&mut self) -> Vec<SessionAction> {
        self.abandon(SessionError::Cancelled)
    }

    /// Subscribe to value changes of the resolved characteristic.
    ///
    /// # Errors
    ///
    /// Fails if the read has not completed, another operation is in flight,
    /// or the characteristic cannot notify.
    pub fn enable_notifications(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        if self.awaiting.is_some()
            || !matches!(
                self.state,
                ConnectionState::ServicesDiscovered | ConnectionState::Completed
            )
        {
            return Err(SessionError::InvalidState {
                operation: Operation::WriteDescriptor,
                state: self.state,
            });
        }

        let resolved = self
            .resolved
            .as_ref()
            .ok_or(SessionError::CharacteristicNotFound {
                uuid: self.target.characteristic,
            })?;

        if !resolved.characteristic.supports_notifications() {
            return Err(SessionError::NotificationsUnsupported {
                uuid: resolved.uuid(),
            });
        }

        if self.notifications == NotificationState::Enabled {
            return Ok(Vec::new());
        }

        let value = if resolved
            .characteristic
            .properties
            .contains(CharPropFlags::NOTIFY)
        {
            ENABLE_NOTIFICATION_VALUE
        } else {
            ENABLE_INDICATION_VALUE
        };

        let action = SessionAction::WriteDescriptor {
            service: resolved.service,
            characteristic: resolved.uuid(),
            descriptor: CLIENT_CHARACTERISTIC_CONFIG_UUID,
            value: value.to_vec(),
        };

        debug!("Enabling notifications on {}", resolved.uuid());

        self.notifications = NotificationState::Enabling;
        self.awaiting = Some(Operation::WriteDescriptor);
        Ok(vec![action])
    }

    fn on_connection_state(&mut self, status: GattStatus, link: LinkState) -> Vec<SessionAction> {
        info!(
            "Connection state changed for {}: status {} link {:?}",
            self.device, status, link
        );

        if matches!(link, LinkState::Connecting | LinkState::Disconnecting) {
            trace!("Ignoring transitional link state {:?}", link);
            return Vec::new();
        }

        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => {
                debug!("Ignoring connection change for idle session {}", self.device);
                Vec::new()
            }
            ConnectionState::Connecting => {
                if status.is_success() && link == LinkState::Connected {
                    self.on_connected()
                } else if status.is_success() {
                    self.fail(SessionError::ConnectionLost)
                } else {
                    self.fail(SessionError::ConnectionFailed { status })
                }
            }
            ConnectionState::Disconnecting | ConnectionState::Completed => {
                if link == LinkState::Disconnected {
                    self.release()
                } else {
                    Vec::new()
                }
            }
            ConnectionState::Connected
            | ConnectionState::Discovering
            | ConnectionState::ServicesDiscovered => {
                if link == LinkState::Disconnected {
                    self.fail(SessionError::ConnectionLost)
                } else {
                    debug!("Duplicate connected event for {}", self.device);
                    Vec::new()
                }
            }
        }
    }

    fn on_connected(&mut self) -> Vec<SessionAction> {
        info!("Connected to {}", self.device);

        let mut actions = Vec::new();
        self.transition(ConnectionState::Connected, &mut actions);

        // Discovery starts as soon as the link is up.
        self.transition(ConnectionState::Discovering, &mut actions);
        self.awaiting = Some(Operation::DiscoverServices);
        actions.push(SessionAction::DiscoverServices);
        actions
    }

    fn on_services_discovered(
        &mut self,
        status: GattStatus,
        services: &[GattService],
    ) -> Vec<SessionAction> {
        if self.state != ConnectionState::Discovering {
            debug!("Ignoring unexpected service discovery for {}", self.device);
            return Vec::new();
        }

        self.awaiting = None;

        if !status.is_success() {
            info!("Service discovery failed for {}: {}", self.device, status);
            return self.fail(SessionError::ServiceDiscoveryFailed { status });
        }

        let catalog = ServiceCatalog::new(services.to_vec());
        let resolution = catalog.resolve(&self.target);
        let uuids = catalog.service_uuids();
        self.catalog = Some(catalog);

        let mut actions = Vec::new();
        self.transition(ConnectionState::ServicesDiscovered, &mut actions);
        actions.push(SessionAction::Emit(SessionEvent::ServicesDiscovered {
            address: self.device.address.clone(),
            services: uuids,
        }));

        match resolution {
            Ok(resolved) => actions.extend(self.issue_read(resolved)),
            Err(error) => {
                info!("Target not found on {}: {}", self.device, error);
                actions.extend(self.fail(error));
            }
        }

        actions
    }

    fn issue_read(&mut self, resolved: ResolvedCharacteristic) -> Vec<SessionAction> {
        let present = self
            .catalog
            .as_ref()
            .and_then(|c| c.find_characteristic(&resolved.service, &resolved.uuid()))
            .is_some();

        if self.state != ConnectionState::ServicesDiscovered || !present {
            return self.fail(SessionError::InvalidState {
                operation: Operation::Read,
                state: self.state,
            });
        }

        let action = SessionAction::Read {
            service: resolved.service,
            characteristic: resolved.uuid(),
        };

        self.resolved = Some(resolved);
        self.awaiting = Some(Operation::Read);
        self.reads_issued += 1;
        vec![action]
    }

    fn on_characteristic_read(
        &mut self,
        status: GattStatus,
        characteristic: &Uuid,
        value: &[u8],
    ) -> Vec<SessionAction> {
        if self.awaiting != Some(Operation::Read) || !self.handler.accepts(characteristic) {
            debug!(
                "Ignoring unexpected read of {} from {}",
                characteristic, self.device
            );
            return Vec::new();
        }

        self.awaiting = None;

        match self.handler.on_read(status, value) {
            Ok(result) => {
                let mut actions = Vec::new();
                self.transition(ConnectionState::Completed, &mut actions);
                actions.push(SessionAction::Emit(SessionEvent::ReadCompleted(result)));
                actions
            }
            Err(error) => self.fail(error),
        }
    }

    fn on_descriptor_write(
        &mut self,
        status: GattStatus,
        characteristic: &Uuid,
    ) -> Vec<SessionAction> {
        if self.awaiting != Some(Operation::WriteDescriptor)
            || !self.handler.accepts(characteristic)
        {
            debug!("Ignoring unexpected descriptor write on {}", characteristic);
            return Vec::new();
        }

        self.awaiting = None;

        match self.handler.on_descriptor_write(status) {
            Ok(()) => {
                self.notifications = NotificationState::Enabled;
                vec![SessionAction::Emit(SessionEvent::NotificationsEnabled {
                    address: self.device.address.clone(),
                    characteristic: *characteristic,
                })]
            }
            Err(error) => {
                self.notifications = NotificationState::Disabled;
                vec![self.operation_failed(error)]
            }
        }
    }

    fn on_characteristic_changed(
        &mut self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Vec<SessionAction> {
        if !self.state.holds_link() {
            debug!("Ignoring notification for closed session {}", self.device);
            return Vec::new();
        }

        if self.notifications != NotificationState::Enabled {
            debug!("Notification from {} without subscription", characteristic);
        }

        vec![SessionAction::Emit(SessionEvent::Notification(
            self.handler.on_changed(characteristic, value),
        ))]
    }

    /// Release the resource, failing with `error` if the workflow is unfinished.
    fn abandon(&mut self, error: SessionError) -> Vec<SessionAction> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Failed => Vec::new(),
            ConnectionState::Completed | ConnectionState::Disconnecting => self.release(),
            _ => self.fail(error),
        }
    }

    /// Release the resource and end up cleanly disconnected.
    fn release(&mut self) -> Vec<SessionAction> {
        self.awaiting = None;
        self.notifications = NotificationState::Disabled;

        let mut actions = vec![SessionAction::Close];
        self.transition(ConnectionState::Disconnected, &mut actions);
        actions
    }

    fn cancelled(&mut self) -> SessionAction {
        self.last_error = Some(SessionError::Cancelled);
        SessionAction::Emit(SessionEvent::Failed {
            address: self.device.address.clone(),
            error: SessionError::Cancelled,
        })
    }

    fn operation_failed(&self, error: SessionError) -> SessionAction {
        SessionAction::Emit(SessionEvent::OperationFailed {
            address: self.device.address.clone(),
            error,
        })
    }

    fn transition(&mut self, state: ConnectionState, actions: &mut Vec<SessionAction>) {
        if self.state == state {
            return;
        }

        debug!(
            "Session state changed for {}: {} -> {}",
            self.device.address, self.state, state
        );

        self.state = state;
        actions.push(SessionAction::Emit(SessionEvent::StateChanged {
            address: self.device.address.clone(),
            state,
        }));
    }
}
