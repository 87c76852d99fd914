//! BLE Service, Characteristic and Descriptor UUIDs.
//!
//! Contains the Bluetooth SIG assigned numbers used by the battery watcher,
//! expanded to their full 128-bit form.

use uuid::Uuid;

const BASE_UUID_BITS: u128 = 0x0000_0000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number into a full UUID on the Bluetooth base.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID_BITS | ((short as u128) << 96))
}

// Battery Service (Standard BLE)
/// Standard BLE Battery Service UUID.
pub const BATTERY_SERVICE_UUID: Uuid = from_short(0x180f);
/// Battery Level characteristic UUID (Read, optionally Notify).
pub const BATTERY_LEVEL_UUID: Uuid = from_short(0x2a19);

// Generic Access Service (Standard BLE)
/// Standard BLE Generic Access Service UUID.
pub const GENERIC_ACCESS_SERVICE_UUID: Uuid = from_short(0x1800);
/// Device Name characteristic UUID.
pub const DEVICE_NAME_UUID: Uuid = from_short(0x2a00);

// Device Information Service (Standard BLE)
/// Standard BLE Device Information Service UUID.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = from_short(0x180a);

// Descriptors
/// Client Characteristic Configuration Descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid = from_short(0x2902);

/// Return the 16-bit assigned number if the UUID lies on the Bluetooth base.
pub fn short_form(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let base_mask: u128 = !(0xffff_ffff_u128 << 96);
    if value & base_mask != BASE_UUID_BITS || value >> 112 != 0 {
        return None;
    }
    Some((value >> 96) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            BATTERY_SERVICE_UUID.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            BATTERY_LEVEL_UUID.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            CLIENT_CHARACTERISTIC_CONFIG_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_from_short() {
        assert_eq!(
            from_short(0x180f),
            Uuid::from_u128(0x0000_180f_0000_1000_8000_00805f9b34fb)
        );
        assert_eq!(
            GENERIC_ACCESS_SERVICE_UUID.to_string(),
            "00001800-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_short_form() {
        assert_eq!(short_form(&BATTERY_SERVICE_UUID), Some(0x180f));
        assert_eq!(short_form(&DEVICE_NAME_UUID), Some(0x2a00));

        let vendor = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
        assert_eq!(short_form(&vendor), None);

        // 32-bit assigned numbers are not short-form.
        let wide = Uuid::from_u128(0x0001_180f_0000_1000_8000_00805f9b34fb);
        assert_eq!(short_form(&wide), None);
    }
}
