//! Measurement records produced by the ingestion pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::data::cylinder::Cylinder;
use crate::error::{Error, Result};

/// A fuel measurement derived from one weight sample.
///
/// Created by the ingestion policy and immutable thereafter. Retention and
/// deletion are the storage layer's business, not the pipeline's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Unique identifier.
    pub id: Uuid,
    /// The cylinder this measurement was converted against.
    pub cylinder_id: Uuid,
    /// Wall-clock timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Raw total weight reported by the scale, in kilograms.
    pub total_weight_kg: f64,
    /// Fuel mass, `max(0, total - tare)`.
    pub fuel_kg: f64,
    /// Fuel percentage of capacity, clamped to `[0, 100]`.
    pub fuel_percent: f64,
    /// Whether the scale reported a calibrated reading.
    pub is_calibrated: bool,
    /// True only for records recovered through the offline-history sync.
    pub is_historical: bool,
}

impl Measurement {
    /// Convert a raw total weight into a measurement against a cylinder.
    pub fn from_weight(
        cylinder: &Cylinder,
        total_weight_kg: f64,
        timestamp_ms: i64,
        is_historical: bool,
    ) -> Self {
        let fuel_kg = cylinder.fuel_kg(total_weight_kg);
        let fuel_percent = cylinder.fuel_percent(fuel_kg);

        Self {
            id: Uuid::new_v4(),
            cylinder_id: cylinder.id,
            timestamp_ms,
            total_weight_kg,
            fuel_kg,
            fuel_percent,
            is_calibrated: true,
            is_historical,
        }
    }

    /// Basic validity check applied before any persistence.
    ///
    /// Rejects non-finite values, negative fuel, and percentages outside
    /// `[0, 100]`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| Error::InvalidMeasurement {
            reason: reason.to_string(),
        };

        if !self.total_weight_kg.is_finite()
            || !self.fuel_kg.is_finite()
            || !self.fuel_percent.is_finite()
        {
            return Err(invalid("non-finite value"));
        }
        if self.fuel_kg < 0.0 {
            return Err(invalid("negative fuel"));
        }
        if !(0.0..=100.0).contains(&self.fuel_percent) {
            return Err(invalid("fuel percent outside [0, 100]"));
        }

        Ok(())
    }
}

/// A durable consumption-history record.
///
/// Admitted by the significant-change tracker: dense around meaningful
/// fuel changes, sparse while the cylinder sits idle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// The cylinder this record belongs to.
    pub cylinder_id: Uuid,
    /// Wall-clock timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    /// Fuel mass at this point, in kilograms.
    pub fuel_kg: f64,
    /// Fuel percentage at this point.
    pub fuel_percent: f64,
}

impl ConsumptionRecord {
    /// Build a consumption record from an admitted measurement.
    pub fn from_measurement(measurement: &Measurement) -> Self {
        Self {
            id: Uuid::new_v4(),
            cylinder_id: measurement.cylinder_id,
            timestamp_ms: measurement.timestamp_ms,
            fuel_kg: measurement.fuel_kg,
            fuel_percent: measurement.fuel_percent,
        }
    }
}

/// Outcome of one ingestion attempt, published for every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveResult {
    /// Id of the persisted measurement, if one was written.
    pub measurement_id: Option<Uuid>,
    /// Whether the sample was durably persisted.
    pub processed: bool,
    /// Why the sample was or was not persisted.
    pub reason: String,
}

impl SaveResult {
    /// A sample that was durably persisted.
    pub fn saved(measurement_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            measurement_id: Some(measurement_id),
            processed: true,
            reason: reason.into(),
        }
    }

    /// A sample that was not persisted.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            measurement_id: None,
            processed: false,
            reason: reason.into(),
        }
    }
}
