//! Measurement ingestion policy.
//!
//! Two independent admission rules feed off the same raw weight samples:
//!
//! - A real-time rate limiter that throttles durable live measurements to
//!   one per [`MIN_LIVE_PERSIST_INTERVAL_MS`]. Throttled samples still
//!   refresh the live observable state, they are just not written.
//! - A [`SignificantChangeTracker`] that promotes samples (live or
//!   historical, in timestamp order) to durable consumption records when
//!   the fuel percentage moved enough or enough time passed.
//!
//! Every ingestion attempt publishes a [`SaveResult`], persisted or not.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::data::{ConsumptionRecord, Measurement, SaveResult};
use crate::error::{Error, Result};
use crate::traits::{ActiveCylinderProvider, MeasurementStore};
use crate::utils::epoch_millis;

/// Minimum spacing between persisted live measurements (2 minutes).
pub const MIN_LIVE_PERSIST_INTERVAL_MS: i64 = 2 * 60 * 1000;

/// Fuel-percentage delta that makes a sample significant.
pub const SIGNIFICANT_PERCENT_DELTA: f64 = 1.0;

/// Elapsed time that makes a sample significant regardless of delta
/// (15 minutes).
pub const SIGNIFICANT_ELAPSED_MS: i64 = 15 * 60 * 1000;

/// Outcome of ingesting one live weight sample.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// The converted measurement, when an active cylinder existed and the
    /// sample was valid. Present even when persistence was rate limited,
    /// so the live display can refresh.
    pub measurement: Option<Measurement>,
    /// The persistence decision.
    pub result: SaveResult,
}

struct LastRecorded {
    fuel_percent: f64,
    timestamp_ms: i64,
}

/// Decides which samples become durable consumption records.
///
/// Keeps consumption history dense around meaningful events and sparse
/// during idle periods. Tracked per cylinder; the first sample for a
/// cylinder is always significant.
pub struct SignificantChangeTracker {
    last: Mutex<HashMap<Uuid, LastRecorded>>,
}

impl SignificantChangeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a measurement is significant, recording it if so.
    ///
    /// Callers must feed historical batches in ascending timestamp order
    /// so "last recorded" reflects causal history, not arrival order.
    pub fn admit(&self, measurement: &Measurement) -> bool {
        let mut last = self.last.lock();

        let significant = match last.get(&measurement.cylinder_id) {
            None => true,
            Some(prev) => {
                (measurement.fuel_percent - prev.fuel_percent).abs() >= SIGNIFICANT_PERCENT_DELTA
                    || measurement.timestamp_ms - prev.timestamp_ms >= SIGNIFICANT_ELAPSED_MS
            }
        };

        if significant {
            last.insert(
                measurement.cylinder_id,
                LastRecorded {
                    fuel_percent: measurement.fuel_percent,
                    timestamp_ms: measurement.timestamp_ms,
                },
            );
        }

        significant
    }
}

impl Default for SignificantChangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts raw weight samples into persisted measurements and
/// consumption records against the active cylinder.
pub struct IngestionPolicy {
    store: Arc<dyn MeasurementStore>,
    cylinders: Arc<dyn ActiveCylinderProvider>,
    tracker: SignificantChangeTracker,
    last_live_save_ms: Mutex<Option<i64>>,
    save_result_tx: broadcast::Sender<SaveResult>,
}

impl IngestionPolicy {
    /// Create a policy over a store and cylinder provider.
    pub fn new(
        store: Arc<dyn MeasurementStore>,
        cylinders: Arc<dyn ActiveCylinderProvider>,
    ) -> Arc<Self> {
        let (save_result_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            store,
            cylinders,
            tracker: SignificantChangeTracker::new(),
            last_live_save_ms: Mutex::new(None),
            save_result_tx,
        })
    }

    /// Subscribe to the result of every ingestion attempt.
    pub fn subscribe_save_results(&self) -> broadcast::Receiver<SaveResult> {
        self.save_result_tx.subscribe()
    }

    /// Forget the live rate-limit stamp.
    ///
    /// Called when the active cylinder changes so the first sample against
    /// the new cylinder is persisted immediately.
    pub fn reset_rate_limit(&self) {
        *self.last_live_save_ms.lock() = None;
    }

    /// Ingest one live weight sample.
    pub async fn ingest_live(&self, total_weight_kg: f64) -> IngestOutcome {
        self.ingest_live_at(total_weight_kg, epoch_millis()).await
    }

    pub(crate) async fn ingest_live_at(&self, total_weight_kg: f64, now_ms: i64) -> IngestOutcome {
        let Some(cylinder) = self.cylinders.active() else {
            let result = SaveResult::skipped(Error::NoActiveCylinder.to_string());
            debug!("Live sample dropped: no active cylinder");
            self.publish(&result);
            return IngestOutcome {
                measurement: None,
                result,
            };
        };

        let measurement = Measurement::from_weight(&cylinder, total_weight_kg, now_ms, false);

        if let Err(e) = measurement.validate() {
            warn!("Rejecting live sample: {}", e);
            let result = SaveResult::skipped(e.to_string());
            self.publish(&result);
            return IngestOutcome {
                measurement: None,
                result,
            };
        }

        // Consumption tracking is independent of the persistence rate limit.
        self.record_if_significant(&measurement).await;

        let allowed = {
            let last = self.last_live_save_ms.lock();
            match *last {
                None => true,
                Some(prev) => now_ms - prev >= MIN_LIVE_PERSIST_INTERVAL_MS,
            }
        };

        let result = if allowed {
            match self.store.insert(&measurement).await {
                Ok(()) => {
                    *self.last_live_save_ms.lock() = Some(now_ms);
                    debug!(
                        "Persisted live measurement {:.3} kg ({:.1}%)",
                        measurement.fuel_kg, measurement.fuel_percent
                    );
                    SaveResult::saved(measurement.id, "persisted")
                }
                Err(e) => {
                    warn!("Failed to persist live measurement: {}", e);
                    SaveResult::skipped(e.to_string())
                }
            }
        } else {
            SaveResult::skipped("rate limited")
        };

        self.publish(&result);
        IngestOutcome {
            measurement: Some(measurement),
            result,
        }
    }

    /// Ingest a deduplicated historical batch.
    ///
    /// Entries are processed in ascending timestamp order; returns the
    /// measurements that passed validation and were persisted.
    pub async fn ingest_history(&self, mut batch: Vec<Measurement>) -> Result<Vec<Measurement>> {
        batch.sort_by_key(|m| m.timestamp_ms);

        let mut accepted = Vec::with_capacity(batch.len());
        for measurement in batch {
            match measurement.validate() {
                Ok(()) => accepted.push(measurement),
                Err(e) => {
                    warn!("Rejecting historical sample: {}", e);
                    self.publish(&SaveResult::skipped(e.to_string()));
                }
            }
        }

        if accepted.is_empty() {
            return Ok(accepted);
        }

        self.store.insert_batch(&accepted).await.map_err(|e| {
            for _ in &accepted {
                self.publish(&SaveResult::skipped(e.to_string()));
            }
            e
        })?;

        for measurement in &accepted {
            self.publish(&SaveResult::saved(measurement.id, "persisted (historical)"));
            self.record_if_significant(measurement).await;
        }

        info!("Persisted {} historical measurements", accepted.len());
        Ok(accepted)
    }

    async fn record_if_significant(&self, measurement: &Measurement) {
        if !self.tracker.admit(measurement) {
            return;
        }

        let record = ConsumptionRecord::from_measurement(measurement);
        if let Err(e) = self.store.insert_consumption(&record).await {
            warn!("Failed to persist consumption record: {}", e);
        }
    }

    fn publish(&self, result: &SaveResult) {
        let _ = self.save_result_tx.send(result.clone());
    }
}
