//! Service and characteristic resolution.
//!
//! After discovery the service list is walked once to find the characteristic
//! a session reads. The first matching service/characteristic pair in
//! discovery order wins.

use tracing::{debug, info};
use uuid::Uuid;

use crate::ble::gatt::{GattCharacteristic, GattService, GattTarget};
use crate::ble::uuids::short_form;
use crate::error::SessionError;

/// A characteristic located in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCharacteristic {
    /// Service containing the characteristic.
    pub service: Uuid,
    /// The characteristic itself.
    pub characteristic: GattCharacteristic,
}

impl ResolvedCharacteristic {
    /// UUID of the resolved characteristic.
    pub fn uuid(&self) -> Uuid {
        self.characteristic.uuid
    }
}

/// Services discovered during one connection session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceCatalog {
    services: Vec<GattService>,
}

impl ServiceCatalog {
    /// Build a catalog from a discovery result.
    pub fn new(services: Vec<GattService>) -> Self {
        Self { services }
    }

    /// Services in discovery order.
    pub fn services(&self) -> &[GattService] {
        &self.services
    }

    /// Service UUIDs in discovery order.
    pub fn service_uuids(&self) -> Vec<Uuid> {
        self.services.iter().map(|s| s.uuid).collect()
    }

    /// Check if a service is present.
    pub fn contains_service(&self, uuid: &Uuid) -> bool {
        self.services.iter().any(|s| s.uuid == *uuid)
    }

    /// Total number of characteristics across all services.
    pub fn characteristic_count(&self) -> usize {
        self.services.iter().map(|s| s.characteristics.len()).sum()
    }

    /// Find a characteristic within a service.
    pub fn find_characteristic(
        &self,
        service: &Uuid,
        characteristic: &Uuid,
    ) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .filter(|s| s.uuid == *service)
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == *characteristic)
    }

    /// Resolve the target characteristic.
    ///
    /// Service UUIDs are logged as the list is walked. The walk stops at the
    /// first service that contains the characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ServiceNotFound`] if no service matches, or
    /// [`SessionError::CharacteristicNotFound`] if matching services lack the
    /// characteristic.
    pub fn resolve(&self, target: &GattTarget) -> Result<ResolvedCharacteristic, SessionError> {
        let mut service_seen = false;

        for service in &self.services {
            match short_form(&service.uuid) {
                Some(short) => debug!("Discovered service {} ({:#06x})", service.uuid, short),
                None => debug!("Discovered service {}", service.uuid),
            }

            if service.uuid != target.service {
                continue;
            }
            service_seen = true;

            if let Some(characteristic) = service
                .characteristics
                .iter()
                .find(|c| c.uuid == target.characteristic)
            {
                info!(
                    "Resolved characteristic {} in service {}",
                    characteristic.uuid, service.uuid
                );
                return Ok(ResolvedCharacteristic {
                    service: service.uuid,
                    characteristic: characteristic.clone(),
                });
            }
        }

        info!("Found {} services", self.services.len());

        if service_seen {
            Err(SessionError::CharacteristicNotFound {
                uuid: target.characteristic,
            })
        } else {
            Err(SessionError::ServiceNotFound {
                uuid: target.service,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;

    fn battery_service(properties: CharPropFlags) -> GattService {
        GattService::new(
            BATTERY_SERVICE_UUID,
            vec![GattCharacteristic::new(BATTERY_LEVEL_UUID, properties)],
        )
    }

    fn generic_access() -> GattService {
        GattService::new(
            GENERIC_ACCESS_SERVICE_UUID,
            vec![GattCharacteristic::new(DEVICE_NAME_UUID, CharPropFlags::READ)],
        )
    }

    #[test]
    fn test_resolve_battery_level() {
        let catalog = ServiceCatalog::new(vec![
            generic_access(),
            battery_service(CharPropFlags::READ | CharPropFlags::NOTIFY),
        ]);

        let resolved = catalog.resolve(&GattTarget::battery_level()).unwrap();
        assert_eq!(resolved.service, BATTERY_SERVICE_UUID);
        assert_eq!(resolved.uuid(), BATTERY_LEVEL_UUID);
        assert!(resolved.characteristic.supports_notifications());
    }

    #[test]
    fn test_first_match_wins() {
        let catalog = ServiceCatalog::new(vec![
            battery_service(CharPropFlags::READ),
            battery_service(CharPropFlags::READ | CharPropFlags::NOTIFY),
        ]);

        let resolved = catalog.resolve(&GattTarget::battery_level()).unwrap();
        assert_eq!(resolved.characteristic.properties, CharPropFlags::READ);
    }

    #[test]
    fn test_later_service_used_when_first_lacks_characteristic() {
        let catalog = ServiceCatalog::new(vec![
            GattService::new(BATTERY_SERVICE_UUID, vec![]),
            battery_service(CharPropFlags::READ),
        ]);

        assert!(catalog.resolve(&GattTarget::battery_level()).is_ok());
    }

    #[test]
    fn test_service_not_found() {
        let catalog = ServiceCatalog::new(vec![generic_access()]);

        assert_eq!(
            catalog.resolve(&GattTarget::battery_level()),
            Err(SessionError::ServiceNotFound {
                uuid: BATTERY_SERVICE_UUID
            })
        );
    }

    #[test]
    fn test_characteristic_not_found() {
        let catalog = ServiceCatalog::new(vec![GattService::new(BATTERY_SERVICE_UUID, vec![])]);

        assert_eq!(
            catalog.resolve(&GattTarget::battery_level()),
            Err(SessionError::CharacteristicNotFound {
                uuid: BATTERY_LEVEL_UUID
            })
        );
    }

    #[test]
    fn test_catalog_queries() {
        let catalog = ServiceCatalog::new(vec![
            generic_access(),
            battery_service(CharPropFlags::READ),
        ]);

        assert_eq!(
            catalog.service_uuids(),
            vec![GENERIC_ACCESS_SERVICE_UUID, BATTERY_SERVICE_UUID]
        );
        assert!(catalog.contains_service(&BATTERY_SERVICE_UUID));
        assert!(!catalog.contains_service(&DEVICE_INFO_SERVICE_UUID));
        assert_eq!(catalog.characteristic_count(), 2);
        assert!(catalog
            .find_characteristic(&BATTERY_SERVICE_UUID, &BATTERY_LEVEL_UUID)
            .is_some());
        assert!(catalog
            .find_characteristic(&GENERIC_ACCESS_SERVICE_UUID, &BATTERY_LEVEL_UUID)
            .is_none());
    }
}
