//! Data types produced and consumed by the measurement pipeline.

pub mod cylinder;
pub mod inclination;
pub mod measurement;

pub use cylinder::Cylinder;
pub use inclination::{InclinationSample, LEVEL_THRESHOLD_DEGREES};
pub use measurement::{ConsumptionRecord, Measurement, SaveResult};
