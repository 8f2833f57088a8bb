//! Dual-cadence periodic polling scheduler.
//!
//! One coordination loop per session drives both the weight and the
//! inclination cadence. Each cycle checks the two deadlines
//! independently and enqueues reads on the session's queue; the last-read
//! stamp is taken at enqueue time, not completion time, so an outstanding
//! read is never enqueued twice. Short fixed pauses keep the single-link
//! queue from saturating.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ble::queue::ReadRequest;
use crate::error::Result;
use crate::session::Session;

/// Default polling period for both characteristics (5 seconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Pause between the weight check and the inclination check in one cycle.
const INTRA_CYCLE_PAUSE: Duration = Duration::from_millis(500);

/// Pause between cycles.
const CYCLE_PAUSE: Duration = Duration::from_millis(1_000);

/// Settling pause after a runtime interval change before the loop restarts.
const SETTLE_PAUSE: Duration = Duration::from_millis(300);

/// Backoff after a failed cycle; a single failed iteration never
/// terminates polling.
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Independently configurable polling cadences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollIntervals {
    /// Period between weight reads.
    pub weight: Duration,
    /// Period between inclination reads.
    pub inclination: Duration,
}

impl PollIntervals {
    /// Build intervals from millisecond values.
    pub fn from_millis(weight_ms: u64, inclination_ms: u64) -> Self {
        Self {
            weight: Duration::from_millis(weight_ms),
            inclination: Duration::from_millis(inclination_ms),
        }
    }
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self::from_millis(DEFAULT_POLL_INTERVAL_MS, DEFAULT_POLL_INTERVAL_MS)
    }
}

enum CycleEnd {
    Continue,
    Reconfigured,
}

/// The coordination loop driving both polling cadences.
pub struct PollingScheduler;

impl PollingScheduler {
    /// Run the polling loop until the session is cancelled.
    ///
    /// Interval changes arriving on `intervals_rx` while the loop runs
    /// restart it after a short settling pause; both deadlines reset so
    /// the new cadence starts from a fresh read of each characteristic.
    pub async fn run(session: Arc<Session>, mut intervals_rx: watch::Receiver<PollIntervals>) {
        info!("Polling scheduler started");

        let mut last_weight: Option<Instant> = None;
        let mut last_inclination: Option<Instant> = None;

        while session.is_active() {
            let intervals = *intervals_rx.borrow_and_update();

            match Self::cycle(
                &session,
                intervals,
                &mut last_weight,
                &mut last_inclination,
                &mut intervals_rx,
            )
            .await
            {
                Ok(CycleEnd::Continue) => {}
                Ok(CycleEnd::Reconfigured) => {
                    debug!("Polling intervals changed, restarting loop");
                    tokio::time::sleep(SETTLE_PAUSE).await;
                    last_weight = None;
                    last_inclination = None;
                }
                Err(e) => {
                    if session.is_active() {
                        warn!("Polling cycle failed: {}, backing off", e);
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
        }

        info!("Polling scheduler stopped");
    }

    async fn cycle(
        session: &Arc<Session>,
        intervals: PollIntervals,
        last_weight: &mut Option<Instant>,
        last_inclination: &mut Option<Instant>,
        intervals_rx: &mut watch::Receiver<PollIntervals>,
    ) -> Result<CycleEnd> {
        if Self::due(*last_weight, intervals.weight) {
            session.queue().enqueue(ReadRequest::Weight)?;
            *last_weight = Some(Instant::now());
        }

        if Self::pause(intervals_rx, INTRA_CYCLE_PAUSE).await {
            return Ok(CycleEnd::Reconfigured);
        }
        if !session.is_active() {
            return Ok(CycleEnd::Continue);
        }

        if Self::due(*last_inclination, intervals.inclination) {
            session.queue().enqueue(ReadRequest::Inclination)?;
            *last_inclination = Some(Instant::now());
        }

        if Self::pause(intervals_rx, CYCLE_PAUSE).await {
            return Ok(CycleEnd::Reconfigured);
        }

        Ok(CycleEnd::Continue)
    }

    fn due(last: Option<Instant>, interval: Duration) -> bool {
        last.map(|t| t.elapsed() > interval).unwrap_or(true)
    }

    /// Sleep for `duration`, waking early if the intervals change.
    /// Returns true on a configuration change.
    async fn pause(rx: &mut watch::Receiver<PollIntervals>, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = rx.changed() => {
                if changed.is_ok() {
                    true
                } else {
                    // Config source gone; keep the current values.
                    tokio::time::sleep(duration).await;
                    false
                }
            }
        }
    }
}
