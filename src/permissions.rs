//! Runtime permission gating.
//!
//! Scanning requires platform permissions that depend on the platform version:
//! location permissions on older Android releases and the dedicated Bluetooth
//! scan/connect permissions from Android 12 (API level 31) onwards. The
//! permission subsystem itself is an external collaborator; this module only
//! names what is required and evaluates the collaborator's report.

use std::fmt;

use crate::error::{Error, Result};

/// Lowest API level that uses the dedicated Bluetooth runtime permissions.
pub const BLUETOOTH_PERMISSIONS_API_LEVEL: u32 = 31;

/// A runtime permission relevant to BLE scanning and connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Permission {
    /// Precise location (legacy scan requirement).
    AccessFineLocation,
    /// Approximate location (legacy scan requirement).
    AccessCoarseLocation,
    /// Discover nearby Bluetooth devices.
    BluetoothScan,
    /// Connect to paired or discovered Bluetooth devices.
    BluetoothConnect,
}

impl Permission {
    /// Platform name of the permission.
    pub fn name(&self) -> &'static str {
        match self {
            Self::AccessFineLocation => "android.permission.ACCESS_FINE_LOCATION",
            Self::AccessCoarseLocation => "android.permission.ACCESS_COARSE_LOCATION",
            Self::BluetoothScan => "android.permission.BLUETOOTH_SCAN",
            Self::BluetoothConnect => "android.permission.BLUETOOTH_CONNECT",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Permissions that must be granted before scanning on the given API level.
pub fn required_permissions(api_level: u32) -> &'static [Permission] {
    if api_level >= BLUETOOTH_PERMISSIONS_API_LEVEL {
        &[Permission::BluetoothConnect, Permission::BluetoothScan]
    } else {
        &[
            Permission::AccessFineLocation,
            Permission::AccessCoarseLocation,
        ]
    }
}

/// Outcome of a permission request for a single permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PermissionStatus {
    /// The permission was granted.
    Granted,
    /// The permission was denied but may be requested again.
    Denied,
    /// The permission was denied and the user asked not to be asked again.
    PermanentlyDenied,
}

/// Result of a permission request, as reported by the permission subsystem.
///
/// An empty report means the platform has no runtime permissions to check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PermissionReport {
    entries: Vec<(Permission, PermissionStatus)>,
}

impl PermissionReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// A report granting every permission in `permissions`.
    pub fn all_granted(permissions: &[Permission]) -> Self {
        permissions
            .iter()
            .fold(Self::new(), |report, p| report.with(*p, PermissionStatus::Granted))
    }

    /// Record the status of a permission, replacing any earlier entry.
    pub fn with(mut self, permission: Permission, status: PermissionStatus) -> Self {
        match self.entries.iter_mut().find(|(p, _)| *p == permission) {
            Some(entry) => entry.1 = status,
            None => self.entries.push((permission, status)),
        }
        self
    }

    /// Status of a permission, if reported.
    pub fn status(&self, permission: Permission) -> Option<PermissionStatus> {
        self.entries
            .iter()
            .find(|(p, _)| *p == permission)
            .map(|(_, s)| *s)
    }

    /// Check if every reported permission was granted.
    pub fn are_all_granted(&self) -> bool {
        self.entries
            .iter()
            .all(|(_, s)| *s == PermissionStatus::Granted)
    }

    /// Check if any permission was permanently denied.
    pub fn is_any_permanently_denied(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, s)| *s == PermissionStatus::PermanentlyDenied)
    }

    /// Permissions that were not granted.
    ///
    /// A required permission missing from the report counts as not granted.
    /// Required permissions come first, followed by any other reported denial.
    pub fn denied(&self, required: &[Permission]) -> Vec<Permission> {
        let missing = required
            .iter()
            .copied()
            .filter(|p| self.status(*p) != Some(PermissionStatus::Granted));

        let reported = self
            .entries
            .iter()
            .filter(|(p, s)| *s != PermissionStatus::Granted && !required.contains(p))
            .map(|(p, _)| *p);

        missing.chain(reported).collect()
    }

    /// Fail unless every required and every reported permission was granted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] naming the missing permissions,
    /// whether the denial was temporary or permanent.
    pub fn ensure_granted(&self, required: &[Permission]) -> Result<()> {
        let denied = self.denied(required);
        if denied.is_empty() {
            return Ok(());
        }

        Err(Error::PermissionDenied {
            permissions: denied.iter().map(|p| p.name().to_string()).collect(),
            permanent: self.is_any_permanently_denied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_required_permissions_by_api_level() {
        assert_eq!(
            required_permissions(30),
            &[
                Permission::AccessFineLocation,
                Permission::AccessCoarseLocation
            ]
        );
        assert_eq!(
            required_permissions(31),
            &[Permission::BluetoothConnect, Permission::BluetoothScan]
        );
        assert_eq!(
            required_permissions(34),
            &[Permission::BluetoothConnect, Permission::BluetoothScan]
        );
    }

    #[test]
    fn test_empty_report_without_requirements_is_granted() {
        assert!(PermissionReport::new().ensure_granted(&[]).is_ok());
    }

    #[test]
    fn test_missing_entry_is_denied() {
        let report =
            PermissionReport::new().with(Permission::BluetoothConnect, PermissionStatus::Granted);

        assert_eq!(
            report.denied(required_permissions(33)),
            vec![Permission::BluetoothScan]
        );
        match report.ensure_granted(required_permissions(33)) {
            Err(Error::PermissionDenied {
                permissions,
                permanent,
            }) => {
                assert_eq!(permissions, vec!["android.permission.BLUETOOTH_SCAN"]);
                assert!(!permanent);
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }

        // Nothing reported at all on a legacy platform.
        assert_eq!(
            PermissionReport::new().denied(required_permissions(29)),
            vec![
                Permission::AccessFineLocation,
                Permission::AccessCoarseLocation
            ]
        );
    }

    #[test]
    fn test_all_granted() {
        let report = PermissionReport::all_granted(required_permissions(33));
        assert!(report.are_all_granted());
        assert_eq!(
            report.status(Permission::BluetoothScan),
            Some(PermissionStatus::Granted)
        );
        assert!(report.ensure_granted(required_permissions(33)).is_ok());
    }

    #[test]
    fn test_temporary_denial_blocks_scan() {
        let report = PermissionReport::all_granted(required_permissions(33))
            .with(Permission::BluetoothScan, PermissionStatus::Denied);

        assert_eq!(
            report.denied(required_permissions(33)),
            vec![Permission::BluetoothScan]
        );
        match report.ensure_granted(required_permissions(33)) {
            Err(Error::PermissionDenied {
                permissions,
                permanent,
            }) => {
                assert_eq!(permissions, vec!["android.permission.BLUETOOTH_SCAN"]);
                assert!(!permanent);
            }
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_permanent_denial_blocks_scan() {
        let report = PermissionReport::new()
            .with(Permission::AccessFineLocation, PermissionStatus::PermanentlyDenied)
            .with(Permission::AccessCoarseLocation, PermissionStatus::Granted);

        assert!(report.is_any_permanently_denied());
        assert!(matches!(
            report.ensure_granted(required_permissions(28)),
            Err(Error::PermissionDenied {
                permanent: true,
                ..
            })
        ));
    }
}
