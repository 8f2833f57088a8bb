//! Inclination samples.
//!
//! Inclination is ephemeral: only the latest value is held in an
//! observable slot, nothing is persisted.

use serde::{Deserialize, Serialize};

/// Maximum absolute angle, in degrees, at which an axis still counts as level.
pub const LEVEL_THRESHOLD_DEGREES: f64 = 5.0;

/// One pitch/roll reading from the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InclinationSample {
    /// Pitch in degrees.
    pub pitch_degrees: f64,
    /// Roll in degrees.
    pub roll_degrees: f64,
    /// Wall-clock timestamp in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl InclinationSample {
    /// Create a new sample.
    pub fn new(pitch_degrees: f64, roll_degrees: f64, timestamp_ms: i64) -> Self {
        Self {
            pitch_degrees,
            roll_degrees,
            timestamp_ms,
        }
    }

    /// Whether the pitch axis is within the level threshold.
    pub fn is_pitch_level(&self) -> bool {
        self.pitch_degrees.abs() <= LEVEL_THRESHOLD_DEGREES
    }

    /// Whether the roll axis is within the level threshold.
    pub fn is_roll_level(&self) -> bool {
        self.roll_degrees.abs() <= LEVEL_THRESHOLD_DEGREES
    }

    /// Whether the scale is level on both axes.
    ///
    /// A tilted scale reads the cylinder weight low; callers typically
    /// surface this before trusting the fuel numbers.
    pub fn is_level(&self) -> bool {
        self.is_pitch_level() && self.is_roll_level()
    }
}
