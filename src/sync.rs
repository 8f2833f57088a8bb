//! Offline-history batch sync.
//!
//! While disconnected the sensor buffers samples; on reconnect this
//! engine drains them through repeated reads of the history
//! characteristic. Each page is deduplicated against the session's seen
//! set (the sensor may retransmit a batch it believes was not
//! acknowledged), converted to historical measurements with reconstructed
//! absolute timestamps, persisted, and republished as a growing,
//! time-ordered list.
//!
//! Timestamps are reconstructed as `now - t` at processing time, not at
//! the moment the page was read. Over a long sync the earlier entries
//! skew by the cumulative processing delay; this matches the sensor
//! firmware's observed semantics for `t`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::ble::queue::{ReadOutcome, ReadRequest};
use crate::data::Measurement;
use crate::ingest::IngestionPolicy;
use crate::protocol::payload::{parse_history, HistoryPayload};
use crate::session::{DedupKey, Session};
use crate::traits::ActiveCylinderProvider;
use crate::utils::epoch_millis;

/// Pause between paginated history reads.
const INTER_PAGE_PAUSE: Duration = Duration::from_millis(100);

/// Consecutive transport failures after which the sync session ends.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// The self-paginating offline sync protocol.
pub struct OfflineSyncEngine;

impl OfflineSyncEngine {
    /// Drain the sensor's offline buffer; runs once per `Ready` transition.
    ///
    /// Ends on the sensor's end-of-data sentinel, on session cancellation,
    /// on loss of the active cylinder, or after
    /// [`MAX_CONSECUTIVE_FAILURES`] transport failures.
    pub async fn run(
        session: Arc<Session>,
        cylinders: Arc<dyn ActiveCylinderProvider>,
        policy: Arc<IngestionPolicy>,
        history_tx: Arc<watch::Sender<Vec<Measurement>>>,
    ) {
        info!("Offline sync started");

        let mut events = session.queue().subscribe();
        let mut collected: Vec<Measurement> = Vec::new();
        let mut failures: u32 = 0;

        while session.is_active() {
            if session.queue().enqueue(ReadRequest::HistoryPage).is_err() {
                break;
            }

            // Select against cancellation: once the queue closes it
            // broadcasts nothing further, and the outcome of an orphaned
            // read is never delivered.
            let outcome = tokio::select! {
                _ = session.cancelled() => break,
                outcome = Self::await_history_outcome(&mut events) => {
                    match outcome {
                        Some(outcome) => outcome,
                        None => break,
                    }
                }
            };

            match outcome {
                ReadOutcome::TimedOut => failures += 1,
                ReadOutcome::Failed(message) => {
                    warn!("History page read failed: {}", message);
                    failures += 1;
                }
                ReadOutcome::Payload(data) => match parse_history(&data) {
                    Err(e) => {
                        warn!("Discarding malformed history page: {}", e);
                        failures = 0;
                    }
                    Ok(HistoryPayload::End) => {
                        info!(
                            "Offline sync complete: {} historical samples",
                            collected.len()
                        );
                        break;
                    }
                    Ok(HistoryPayload::Entries(entries)) => {
                        failures = 0;

                        let mut keys = Vec::new();
                        let mut fresh = Vec::new();
                        for entry in entries {
                            let key = DedupKey::new(entry.w, entry.t);
                            if !session.dedup_contains(key) && !keys.contains(&key) {
                                keys.push(key);
                                fresh.push(entry);
                            }
                        }

                        if fresh.is_empty() {
                            debug!("History page contained only retransmitted entries");
                        } else {
                            let Some(cylinder) = cylinders.active() else {
                                warn!("Ending offline sync: no active cylinder");
                                break;
                            };

                            let now_ms = epoch_millis();
                            let batch: Vec<Measurement> = fresh
                                .iter()
                                .filter_map(|entry| {
                                    let age_ms = i64::try_from(entry.t).ok()?;
                                    Some(Measurement::from_weight(
                                        &cylinder,
                                        entry.w,
                                        now_ms - age_ms,
                                        true,
                                    ))
                                })
                                .collect();

                            match policy.ingest_history(batch).await {
                                Ok(accepted) => {
                                    // Keys are recorded only once the batch
                                    // persists; a retransmission can still
                                    // recover a failed write.
                                    for key in keys {
                                        session.dedup_insert(key);
                                    }
                                    collected.extend(accepted);
                                    collected.sort_by_key(|m| m.timestamp_ms);
                                    history_tx.send_replace(collected.clone());
                                }
                                Err(e) => {
                                    warn!("Failed to persist historical batch: {}", e);
                                    failures += 1;
                                }
                            }
                        }
                    }
                },
            }

            if failures >= MAX_CONSECUTIVE_FAILURES {
                warn!(
                    "Ending offline sync after {} consecutive failures",
                    failures
                );
                break;
            }

            if !session.is_active() {
                break;
            }
            tokio::time::sleep(INTER_PAGE_PAUSE).await;
        }

        info!("Offline sync stopped");
    }

    /// Wait for the completion of the history read just enqueued,
    /// skipping completions of interleaved weight/inclination reads.
    async fn await_history_outcome(
        events: &mut broadcast::Receiver<crate::ble::queue::ReadEvent>,
    ) -> Option<ReadOutcome> {
        loop {
            match events.recv().await {
                Ok(event) if event.request == ReadRequest::HistoryPage => {
                    return Some(event.outcome)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("History event stream lagged by {}", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::link::GattLink;
    use crate::ble::queue::ReadQueue;
    use crate::ble::uuids::HISTORY_CHARACTERISTIC_UUID;
    use crate::data::Cylinder;
    use crate::mock::{CylinderRegistry, MemoryStore, MockLink, MockPermissionGate};
    use crate::traits::MeasurementStore;

    struct Harness {
        link: Arc<MockLink>,
        session: Arc<Session>,
        registry: Arc<CylinderRegistry>,
        store: Arc<MemoryStore>,
        policy: Arc<IngestionPolicy>,
        history_tx: Arc<watch::Sender<Vec<Measurement>>>,
    }

    async fn harness() -> Harness {
        let link = Arc::new(MockLink::with_all_characteristics());
        link.connect().await.unwrap();

        let queue = ReadQueue::new(
            link.clone() as Arc<dyn GattLink>,
            Arc::new(MockPermissionGate::granted()),
        );
        let session = Session::new(queue);

        let registry = Arc::new(CylinderRegistry::new());
        let cylinder = Cylinder::new("Test", 5.0, 11.0);
        let id = cylinder.id;
        registry.add(cylinder);
        registry.set_active(id).unwrap();

        let store = Arc::new(MemoryStore::new());
        let policy = IngestionPolicy::new(
            store.clone() as Arc<dyn MeasurementStore>,
            registry.clone() as Arc<dyn ActiveCylinderProvider>,
        );

        let (history_tx, _) = watch::channel(Vec::new());

        Harness {
            link,
            session,
            registry,
            store,
            policy,
            history_tx: Arc::new(history_tx),
        }
    }

    async fn run_sync(h: &Harness) {
        tokio::time::timeout(
            Duration::from_secs(5),
            OfflineSyncEngine::run(
                h.session.clone(),
                h.registry.clone() as Arc<dyn ActiveCylinderProvider>,
                h.policy.clone(),
                h.history_tx.clone(),
            ),
        )
        .await
        .expect("sync engine did not finish");
    }

    #[tokio::test]
    async fn test_retransmitted_batch_deduplicated() {
        let h = harness().await;

        // The sensor retransmits the first batch before ending.
        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        h.link.script_read(HISTORY_CHARACTERISTIC_UUID, b"END");

        run_sync(&h).await;

        assert_eq!(h.store.measurements().len(), 1);
        assert_eq!(h.session.dedup_len(), 1);
    }

    #[tokio::test]
    async fn test_timestamp_reconstruction() {
        let h = harness().await;

        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        h.link.script_read(HISTORY_CHARACTERISTIC_UUID, b"[]");

        let before = epoch_millis();
        run_sync(&h).await;
        let after = epoch_millis();

        let measurements = h.store.measurements();
        assert_eq!(measurements.len(), 1);
        let ts = measurements[0].timestamp_ms;
        assert!(ts >= before - 300_000);
        assert!(ts <= after - 300_000);
        assert!(measurements[0].is_historical);
    }

    #[tokio::test]
    async fn test_history_list_grows_sorted() {
        let h = harness().await;
        let mut history_rx = h.history_tx.subscribe();

        // Newer sample (smaller t) arrives in the first page, older in the
        // second; the published list is re-sorted by timestamp.
        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.0,"t":100000}]"#);
        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.5,"t":600000}]"#);
        h.link.script_read(HISTORY_CHARACTERISTIC_UUID, b"0");

        run_sync(&h).await;

        history_rx
            .changed()
            .await
            .expect("history slot never updated");
        let list = history_rx.borrow_and_update().clone();
        assert_eq!(list.len(), 2);
        assert!(list[0].timestamp_ms < list[1].timestamp_ms);
        assert!((list[0].total_weight_kg - 25.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_page_discarded_sync_continues() {
        let h = harness().await;

        h.link.script_read(HISTORY_CHARACTERISTIC_UUID, b"not json");
        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        h.link.script_read(HISTORY_CHARACTERISTIC_UUID, b"END");

        run_sync(&h).await;

        assert_eq!(h.store.measurements().len(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_failures_end_session() {
        let h = harness().await;

        h.link.fail_next_read(HISTORY_CHARACTERISTIC_UUID, "busy");
        h.link.fail_next_read(HISTORY_CHARACTERISTIC_UUID, "busy");
        h.link.fail_next_read(HISTORY_CHARACTERISTIC_UUID, "busy");

        run_sync(&h).await;

        assert!(h.store.measurements().is_empty());
    }

    #[tokio::test]
    async fn test_failed_persist_recovered_by_retransmission() {
        let h = harness().await;

        // The first write fails; the sensor retransmits the batch it
        // never saw acknowledged, and the retry is persisted.
        h.store.fail_next_write();
        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        h.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        h.link.script_read(HISTORY_CHARACTERISTIC_UUID, b"END");

        run_sync(&h).await;

        assert_eq!(h.store.measurements().len(), 1);
        assert_eq!(h.session.dedup_len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_read() {
        let h = harness().await;

        // The page read never answers; the closed queue will discard its
        // outcome, so only the cancellation signal can wake the engine.
        h.link.stall_next_read(HISTORY_CHARACTERISTIC_UUID);

        let session = h.session.clone();
        let handle = tokio::spawn(OfflineSyncEngine::run(
            session.clone(),
            h.registry.clone() as Arc<dyn ActiveCylinderProvider>,
            h.policy.clone(),
            h.history_tx.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        session.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sync engine stayed parked on a dead event stream")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_sync() {
        let h = harness().await;

        // An endless supply of pages; only cancellation ends the session.
        h.link.set_default_payload(
            HISTORY_CHARACTERISTIC_UUID,
            br#"[{"w":25.1,"t":300000}]"#.to_vec(),
        );

        let session = h.session.clone();
        let handle = tokio::spawn(OfflineSyncEngine::run(
            session.clone(),
            h.registry.clone() as Arc<dyn ActiveCylinderProvider>,
            h.policy.clone(),
            h.history_tx.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        session.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sync engine did not stop after cancellation")
            .unwrap();
    }
}
