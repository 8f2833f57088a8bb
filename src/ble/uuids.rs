//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for cylinder scale sensor communication.

use uuid::Uuid;

// Cylinder Scale Service (custom)
/// Cylinder scale sensor service UUID.
pub const SCALE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_a100_7d2c_4c6b_9a1e_54c90f3b82d1);

/// Weight characteristic UUID (read-only).
///
/// Payload: UTF-8 JSON `{"w": <float kg>}`.
pub const WEIGHT_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_a101_7d2c_4c6b_9a1e_54c90f3b82d1);

/// Inclination characteristic UUID (read-only).
///
/// Payload: UTF-8 JSON `{"p": <float pitch>, "r": <float roll>}` in degrees.
pub const INCLINATION_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_a102_7d2c_4c6b_9a1e_54c90f3b82d1);

/// Offline-history characteristic UUID (read-only, paginated).
///
/// Payload: UTF-8 JSON array `[{"w": <float kg>, "t": <int ms ago>}, ...]`
/// or an end-of-data sentinel.
pub const HISTORY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_a103_7d2c_4c6b_9a1e_54c90f3b82d1);

/// The three characteristics a sensor must expose before a session
/// is allowed to enter `Ready`.
pub const REQUIRED_CHARACTERISTICS: [Uuid; 3] = [
    WEIGHT_CHARACTERISTIC_UUID,
    INCLINATION_CHARACTERISTIC_UUID,
    HISTORY_CHARACTERISTIC_UUID,
];

/// Check if a service UUID belongs to a cylinder scale sensor.
pub fn is_scale_service(uuid: &Uuid) -> bool {
    *uuid == SCALE_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert!(SCALE_SERVICE_UUID.to_string().contains("a100"));
        assert!(WEIGHT_CHARACTERISTIC_UUID.to_string().contains("a101"));
        assert!(INCLINATION_CHARACTERISTIC_UUID.to_string().contains("a102"));
        assert!(HISTORY_CHARACTERISTIC_UUID.to_string().contains("a103"));
    }

    #[test]
    fn test_is_scale_service() {
        assert!(is_scale_service(&SCALE_SERVICE_UUID));
        assert!(!is_scale_service(&WEIGHT_CHARACTERISTIC_UUID));
    }

    #[test]
    fn test_required_characteristics() {
        assert_eq!(REQUIRED_CHARACTERISTICS.len(), 3);
        assert!(REQUIRED_CHARACTERISTICS.contains(&HISTORY_CHARACTERISTIC_UUID));
    }
}
