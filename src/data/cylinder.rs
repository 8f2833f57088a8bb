//! Cylinder configuration and fuel conversion.
//!
//! A cylinder is the piece of configuration that turns a raw total weight
//! into a fuel quantity: the sensor weighs tare plus contents, and only
//! the contents are interesting.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A gas cylinder registered with the application.
///
/// Exactly one cylinder may be active at any time; the active one is the
/// conversion context for every incoming weight sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cylinder {
    /// Unique identifier.
    pub id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Weight of the empty cylinder in kilograms.
    pub tare_weight_kg: f64,
    /// Fuel capacity in kilograms.
    pub capacity_kg: f64,
    /// Whether this cylinder is the active conversion context.
    pub is_active: bool,
}

impl Cylinder {
    /// Create a new inactive cylinder with a fresh id.
    pub fn new(name: impl Into<String>, tare_weight_kg: f64, capacity_kg: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tare_weight_kg,
            capacity_kg,
            is_active: false,
        }
    }

    /// Fuel mass for a given total weight, clamped at zero.
    ///
    /// A total below the tare weight reads as an empty cylinder rather
    /// than negative fuel.
    pub fn fuel_kg(&self, total_weight_kg: f64) -> f64 {
        (total_weight_kg - self.tare_weight_kg).max(0.0)
    }

    /// Fuel percentage for a given fuel mass, clamped to `[0, 100]`.
    ///
    /// Returns 0.0 when the capacity is zero or negative.
    pub fn fuel_percent(&self, fuel_kg: f64) -> f64 {
        if self.capacity_kg <= 0.0 {
            return 0.0;
        }
        (fuel_kg / self.capacity_kg * 100.0).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_cylinder() -> Cylinder {
        Cylinder::new("Kitchen", 5.0, 11.0)
    }

    #[test]
    fn test_fuel_conversion() {
        let cylinder = test_cylinder();

        let fuel = cylinder.fuel_kg(10.5);
        assert!((fuel - 5.5).abs() < 1e-9);
        assert!((cylinder.fuel_percent(fuel) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_fuel_clamped_at_empty() {
        let cylinder = test_cylinder();
        assert_eq!(cylinder.fuel_kg(4.0), 0.0);
        assert_eq!(cylinder.fuel_percent(0.0), 0.0);
    }

    #[test]
    fn test_fuel_percent_zero_capacity() {
        let mut cylinder = test_cylinder();
        cylinder.capacity_kg = 0.0;
        assert_eq!(cylinder.fuel_percent(5.5), 0.0);

        cylinder.capacity_kg = -1.0;
        assert_eq!(cylinder.fuel_percent(5.5), 0.0);
    }

    #[test]
    fn test_fuel_percent_clamped_at_full() {
        let cylinder = test_cylinder();
        assert_eq!(cylinder.fuel_percent(15.0), 100.0);
    }

    proptest! {
        #[test]
        fn prop_fuel_never_negative(total in -100.0f64..100.0, tare in 0.0f64..50.0) {
            let mut cylinder = test_cylinder();
            cylinder.tare_weight_kg = tare;
            prop_assert!(cylinder.fuel_kg(total) >= 0.0);
        }

        #[test]
        fn prop_percent_in_range(fuel in -10.0f64..100.0, capacity in -5.0f64..50.0) {
            let mut cylinder = test_cylinder();
            cylinder.capacity_kg = capacity;
            let percent = cylinder.fuel_percent(fuel);
            prop_assert!((0.0..=100.0).contains(&percent));
        }
    }
}
