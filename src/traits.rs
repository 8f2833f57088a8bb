//! Collaborator contracts the measurement pipeline depends on.
//!
//! Configuration and durable storage live outside this crate; the pipeline
//! talks to them through these traits so the whole core can run against
//! in-memory implementations in tests (see [`crate::mock`]).

use async_trait::async_trait;
use tokio::sync::watch;

use crate::data::{ConsumptionRecord, Cylinder, Measurement};
use crate::error::Result;
use crate::poll::PollIntervals;

/// Lookup for the single active cylinder.
pub trait ActiveCylinderProvider: Send + Sync {
    /// Get the currently active cylinder, if any.
    fn active(&self) -> Option<Cylinder>;

    /// Subscribe to active-cylinder changes.
    ///
    /// The receiver replays the latest value on subscription.
    fn subscribe(&self) -> watch::Receiver<Option<Cylinder>>;
}

/// Durable, append-only measurement storage.
///
/// No pipeline logic depends on query behavior; readers live elsewhere.
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Persist a single measurement.
    async fn insert(&self, measurement: &Measurement) -> Result<()>;

    /// Persist a batch of measurements.
    async fn insert_batch(&self, measurements: &[Measurement]) -> Result<()>;

    /// Persist a consumption-history record.
    async fn insert_consumption(&self, record: &ConsumptionRecord) -> Result<()>;
}

/// Persisted polling-interval configuration.
///
/// Read when a session enters `Ready` and on explicit reconfiguration.
pub trait IntervalConfigStore: Send + Sync {
    /// Load the configured polling intervals.
    fn load(&self) -> PollIntervals;

    /// Persist new polling intervals.
    fn save(&self, intervals: PollIntervals);
}

/// Radio permission check.
///
/// Consulted before every connect, discovery, and read attempt; when it
/// denies, no link activity is started.
pub trait PermissionGate: Send + Sync {
    /// Whether radio use is currently permitted.
    fn is_granted(&self) -> bool;
}
