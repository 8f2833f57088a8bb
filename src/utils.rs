//! Utility functions for the gasgauge-ble crate.

use chrono::Utc;

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All measurement timestamps in this crate use this clock.
#[inline]
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert kilograms to pounds.
///
/// # Example
///
/// ```
/// use gasgauge_ble::kg_to_lb;
///
/// let lb = kg_to_lb(11.0);
/// assert!((lb - 24.2508).abs() < 0.001);
/// ```
#[inline]
pub fn kg_to_lb(kg: f64) -> f64 {
    kg * 2.204_622_621_848_776
}

/// Convert pounds to kilograms.
///
/// # Example
///
/// ```
/// use gasgauge_ble::lb_to_kg;
///
/// let kg = lb_to_kg(24.2508);
/// assert!((kg - 11.0).abs() < 0.001);
/// ```
#[inline]
pub fn lb_to_kg(lb: f64) -> f64 {
    lb / 2.204_622_621_848_776
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_millis_is_recent() {
        // 2020-01-01 in epoch ms; anything earlier means a broken clock source.
        assert!(epoch_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_weight_roundtrip() {
        let original = 12.7;
        let converted = lb_to_kg(kg_to_lb(original));
        assert!((converted - original).abs() < 0.0001);
    }

    #[test]
    fn test_kg_to_lb() {
        assert!((kg_to_lb(0.0)).abs() < 0.0001);
        assert!((kg_to_lb(1.0) - 2.204_622_6).abs() < 0.001);
    }
}
