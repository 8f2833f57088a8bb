//! Sensor device facade.
//!
//! [`SensorDevice`] owns the connection lifecycle and wires the pipeline
//! together: on `Ready` it builds a fresh [`Session`], then starts the
//! measurement pump, the offline sync engine, and the polling scheduler
//! against it. Observable state is published through watch and broadcast
//! channels; consumers subscribe and never call into the device from the
//! hot path.
//!
//! Teardown is uniform: explicit disconnect, unsolicited link drop, and
//! failed service discovery all cancel the session, stop the background
//! tasks, and land in `Disconnected` with a clean slate. Nothing from a
//! previous connection survives into the next one.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::connection::ConnectionState;
use crate::ble::link::{GattLink, LinkEvent};
use crate::ble::queue::{ReadOutcome, ReadQueue, ReadRequest};
use crate::ble::uuids::REQUIRED_CHARACTERISTICS;
use crate::data::{InclinationSample, Measurement, SaveResult};
use crate::error::{Error, Result};
use crate::ingest::IngestionPolicy;
use crate::poll::{PollIntervals, PollingScheduler};
use crate::session::Session;
use crate::sync::OfflineSyncEngine;
use crate::traits::{
    ActiveCylinderProvider, IntervalConfigStore, MeasurementStore, PermissionGate,
};
use crate::utils::epoch_millis;

/// One LPG cylinder scale sensor and its measurement pipeline.
pub struct SensorDevice {
    link: Arc<dyn GattLink>,
    gate: Arc<dyn PermissionGate>,
    cylinders: Arc<dyn ActiveCylinderProvider>,
    config: Arc<dyn IntervalConfigStore>,
    policy: Arc<IngestionPolicy>,

    state_tx: watch::Sender<ConnectionState>,
    measurement_tx: watch::Sender<Option<Measurement>>,
    inclination_tx: watch::Sender<Option<InclinationSample>>,
    history_tx: Arc<watch::Sender<Vec<Measurement>>>,
    intervals_tx: watch::Sender<PollIntervals>,

    session: Mutex<Option<Arc<Session>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cylinder_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SensorDevice {
    /// Build a device over a link and its collaborators.
    pub fn new(
        link: Arc<dyn GattLink>,
        gate: Arc<dyn PermissionGate>,
        cylinders: Arc<dyn ActiveCylinderProvider>,
        store: Arc<dyn MeasurementStore>,
        config: Arc<dyn IntervalConfigStore>,
    ) -> Arc<Self> {
        let policy = IngestionPolicy::new(store, Arc::clone(&cylinders));

        let (state_tx, _) = watch::channel(ConnectionState::default());
        let (measurement_tx, _) = watch::channel(None);
        let (inclination_tx, _) = watch::channel(None);
        let (history_tx, _) = watch::channel(Vec::new());
        let (intervals_tx, _) = watch::channel(config.load());

        let device = Arc::new(Self {
            link,
            gate,
            cylinders,
            config,
            policy,
            state_tx,
            measurement_tx,
            inclination_tx,
            history_tx: Arc::new(history_tx),
            intervals_tx,
            session: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cylinder_watcher: Mutex::new(None),
        });

        device.start_cylinder_watcher();
        device
    }

    /// Connect and bring the pipeline to `Ready`.
    ///
    /// A no-op when a connection attempt is already in progress or
    /// established.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` without touching the radio when the
    /// permission gate denies, `ConnectionFailed` when the physical link
    /// cannot be established, and `ServiceDiscoveryIncomplete` when the
    /// sensor does not expose all required characteristics. Every failure
    /// lands back in `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        if !self.gate.is_granted() {
            return Err(Error::PermissionDenied);
        }

        // Claim the state machine atomically so concurrent connects
        // cannot interleave.
        let claimed = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            debug!("Connect ignored: already {}", *self.state_tx.borrow());
            return Ok(());
        }

        info!("Connecting to sensor {}", self.link.address());

        if let Err(e) = self.link.connect().await {
            self.state_tx.send_replace(ConnectionState::Disconnected);
            return Err(Error::ConnectionFailed {
                reason: e.to_string(),
            });
        }

        self.state_tx.send_replace(ConnectionState::ServiceDiscovery);

        match self.verify_characteristics().await {
            Ok(()) => {}
            Err(e) => {
                // The link is up but unusable; tear it back down.
                let _ = self.link.disconnect().await;
                self.state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        }

        let queue = ReadQueue::new(Arc::clone(&self.link), Arc::clone(&self.gate));
        let session = Session::new(queue);
        *self.session.lock() = Some(Arc::clone(&session));

        self.intervals_tx.send_replace(self.config.load());
        self.history_tx.send_replace(Vec::new());

        self.state_tx.send_replace(ConnectionState::Ready);
        info!("Sensor {} ready", self.link.address());

        self.start_pipeline(session);
        Ok(())
    }

    /// Disconnect and tear the pipeline down.
    ///
    /// Safe from any state; always ends in `Disconnected` with no session,
    /// an empty operation queue, and no background tasks.
    pub async fn disconnect(&self) -> Result<()> {
        if *self.state_tx.borrow() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.state_tx.send_replace(ConnectionState::Disconnecting);
        self.teardown_session();

        let result = self.link.disconnect().await;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Sensor {} disconnected", self.link.address());

        result
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Latest live measurement, if any was taken this process.
    pub fn latest_measurement(&self) -> Option<Measurement> {
        self.measurement_tx.borrow().clone()
    }

    /// Subscribe to live measurement updates.
    pub fn subscribe_measurements(&self) -> watch::Receiver<Option<Measurement>> {
        self.measurement_tx.subscribe()
    }

    /// Latest inclination sample, if any was taken this process.
    pub fn latest_inclination(&self) -> Option<InclinationSample> {
        *self.inclination_tx.borrow()
    }

    /// Subscribe to inclination updates.
    pub fn subscribe_inclination(&self) -> watch::Receiver<Option<InclinationSample>> {
        self.inclination_tx.subscribe()
    }

    /// Subscribe to the growing, time-ordered offline history list.
    ///
    /// The list is reset to empty at the start of every connection.
    pub fn subscribe_history(&self) -> watch::Receiver<Vec<Measurement>> {
        self.history_tx.subscribe()
    }

    /// Subscribe to the result of every ingestion attempt.
    pub fn subscribe_save_results(&self) -> broadcast::Receiver<SaveResult> {
        self.policy.subscribe_save_results()
    }

    /// Currently effective polling intervals.
    pub fn intervals(&self) -> PollIntervals {
        *self.intervals_tx.borrow()
    }

    /// Persist new polling intervals and apply them to the running
    /// scheduler, which restarts its loop after a short settling pause.
    pub fn set_intervals(&self, intervals: PollIntervals) {
        self.config.save(intervals);
        self.intervals_tx.send_replace(intervals);
    }

    async fn verify_characteristics(&self) -> Result<()> {
        let found = self.link.discover_characteristics().await?;

        let missing: Vec<String> = REQUIRED_CHARACTERISTICS
            .iter()
            .filter(|uuid| !found.contains(uuid))
            .map(|uuid| uuid.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            warn!(
                "Sensor {} is missing characteristics: {}",
                self.link.address(),
                missing.join(", ")
            );
            Err(Error::ServiceDiscoveryIncomplete {
                missing: missing.join(", "),
            })
        }
    }

    fn start_pipeline(&self, session: Arc<Session>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());

        // Unsolicited link drops cancel the session from any state.
        // Tasks hold channel handles, not the device, so dropping the
        // last user handle actually drops the device.
        let drop_session = Arc::clone(&session);
        let state_tx = self.state_tx.clone();
        let mut link_events = self.link.subscribe_events();
        tasks.push(tokio::spawn(async move {
            while let Ok(event) = link_events.recv().await {
                if event == LinkEvent::Disconnected {
                    warn!("Link dropped, tearing session down");
                    drop_session.cancel();
                    state_tx.send_replace(ConnectionState::Disconnected);
                    break;
                }
            }
        }));

        tasks.push(tokio::spawn(Self::pump(
            Arc::clone(&session),
            Arc::clone(&self.policy),
            self.measurement_tx.clone(),
            self.inclination_tx.clone(),
        )));

        tasks.push(tokio::spawn(OfflineSyncEngine::run(
            Arc::clone(&session),
            Arc::clone(&self.cylinders),
            Arc::clone(&self.policy),
            Arc::clone(&self.history_tx),
        )));

        tasks.push(tokio::spawn(PollingScheduler::run(
            session,
            self.intervals_tx.subscribe(),
        )));
    }

    /// Turn completed weight and inclination reads into observable state
    /// and ingestion calls. History pages are consumed by the sync engine.
    async fn pump(
        session: Arc<Session>,
        policy: Arc<IngestionPolicy>,
        measurement_tx: watch::Sender<Option<Measurement>>,
        inclination_tx: watch::Sender<Option<InclinationSample>>,
    ) {
        let mut events = session.queue().subscribe();

        loop {
            // The closed queue broadcasts nothing further, so a plain
            // recv would park forever after a link drop.
            let received = tokio::select! {
                _ = session.cancelled() => break,
                received = events.recv() => received,
            };

            let event = match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Measurement pump lagged by {}", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if !session.is_active() {
                break;
            }

            let data = match event.outcome {
                ReadOutcome::Payload(data) => data,
                ReadOutcome::TimedOut | ReadOutcome::Failed(_) => continue,
            };

            match event.request {
                ReadRequest::Weight => match crate::protocol::parse_weight(&data) {
                    Ok(weight_kg) => {
                        let outcome = policy.ingest_live(weight_kg).await;
                        if let Some(measurement) = outcome.measurement {
                            measurement_tx.send_replace(Some(measurement));
                        }
                    }
                    Err(e) => warn!("Discarding weight payload: {}", e),
                },
                ReadRequest::Inclination => match crate::protocol::parse_inclination(&data) {
                    Ok((pitch, roll)) => {
                        let sample = InclinationSample::new(pitch, roll, epoch_millis());
                        inclination_tx.send_replace(Some(sample));
                    }
                    Err(e) => warn!("Discarding inclination payload: {}", e),
                },
                ReadRequest::HistoryPage => {}
            }
        }
    }

    fn teardown_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn start_cylinder_watcher(&self) {
        let policy = Arc::clone(&self.policy);
        let mut active_rx = self.cylinders.subscribe();

        let handle = tokio::spawn(async move {
            while active_rx.changed().await.is_ok() {
                debug!("Active cylinder changed, resetting live rate limit");
                policy.reset_rate_limit();
            }
        });

        *self.cylinder_watcher.lock() = Some(handle);
    }
}

impl Drop for SensorDevice {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(handle) = self.cylinder_watcher.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{
        HISTORY_CHARACTERISTIC_UUID, INCLINATION_CHARACTERISTIC_UUID, WEIGHT_CHARACTERISTIC_UUID,
    };
    use crate::data::Cylinder;
    use crate::mock::{
        CylinderRegistry, MemoryIntervalStore, MemoryStore, MockLink, MockPermissionGate,
    };
    use std::time::Duration;

    struct Fixture {
        link: Arc<MockLink>,
        registry: Arc<CylinderRegistry>,
        store: Arc<MemoryStore>,
        config: Arc<MemoryIntervalStore>,
        device: Arc<SensorDevice>,
    }

    fn fixture_with(link: MockLink, gate: MockPermissionGate) -> Fixture {
        let link = Arc::new(link);
        let registry = Arc::new(CylinderRegistry::new());
        let cylinder = Cylinder::new("Test", 5.0, 11.0);
        let id = cylinder.id;
        registry.add(cylinder);
        registry.set_active(id).unwrap();

        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(MemoryIntervalStore::new());

        let device = SensorDevice::new(
            link.clone() as Arc<dyn GattLink>,
            Arc::new(gate),
            registry.clone() as Arc<dyn ActiveCylinderProvider>,
            store.clone() as Arc<dyn MeasurementStore>,
            config.clone() as Arc<dyn IntervalConfigStore>,
        );

        Fixture {
            link,
            registry,
            store,
            config,
            device,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            MockLink::with_all_characteristics(),
            MockPermissionGate::granted(),
        )
    }

    #[tokio::test]
    async fn test_connect_reaches_ready_and_polls() {
        let f = fixture();

        f.device.connect().await.unwrap();
        assert_eq!(f.device.state(), ConnectionState::Ready);

        // The scheduler's first cycle reads both characteristics and the
        // pump turns them into observable state.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(f.device.latest_measurement().is_some());
        assert!(f.device.latest_inclination().is_some());
        assert!(!f.store.measurements().is_empty());

        f.device.disconnect().await.unwrap();
        assert_eq!(f.device.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_denied_without_permission() {
        let f = fixture_with(
            MockLink::with_all_characteristics(),
            MockPermissionGate::denied(),
        );

        let err = f.device.connect().await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied));
        assert_eq!(f.device.state(), ConnectionState::Disconnected);
        assert!(!f.link.is_connected());
    }

    #[tokio::test]
    async fn test_missing_characteristic_fails_discovery() {
        let f = fixture_with(
            MockLink::with_characteristics(vec![
                WEIGHT_CHARACTERISTIC_UUID,
                INCLINATION_CHARACTERISTIC_UUID,
            ]),
            MockPermissionGate::granted(),
        );

        let err = f.device.connect().await.unwrap_err();
        assert!(matches!(err, Error::ServiceDiscoveryIncomplete { .. }));
        assert_eq!(f.device.state(), ConnectionState::Disconnected);
        // The half-open link was torn back down.
        assert!(!f.link.is_connected());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let f = fixture();

        f.device.connect().await.unwrap();
        f.device.connect().await.unwrap();
        assert_eq!(f.device.state(), ConnectionState::Ready);

        f.device.disconnect().await.unwrap();
        f.device.disconnect().await.unwrap();
        assert_eq!(f.device.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_drop_lands_in_disconnected() {
        let f = fixture();

        f.device.connect().await.unwrap();
        assert_eq!(f.device.state(), ConnectionState::Ready);

        f.link.emit_link_dropped();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.device.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_offline_history_synced_on_connect() {
        let f = fixture();
        let mut history_rx = f.device.subscribe_history();

        f.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        // The default "[]" page ends the sync afterwards.

        f.device.connect().await.unwrap();

        history_rx
            .changed()
            .await
            .expect("history slot never updated");
        let list = history_rx.borrow_and_update().clone();
        assert_eq!(list.len(), 1);
        assert!(list[0].is_historical);

        f.device.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_dedup_resets_across_reconnects() {
        let f = fixture();

        f.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        f.device.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        f.device.disconnect().await.unwrap();

        // The sensor never learned its batch was persisted and
        // retransmits it on the next connection. Dedup state died with
        // the old session, so the batch is accepted again.
        f.link
            .script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.1,"t":300000}]"#);
        f.device.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        f.device.disconnect().await.unwrap();

        let historical = f
            .store
            .measurements()
            .into_iter()
            .filter(|m| m.is_historical)
            .count();
        assert_eq!(historical, 2);
    }

    #[tokio::test]
    async fn test_pump_stops_after_session_cancel() {
        let link = Arc::new(MockLink::with_all_characteristics());
        link.connect().await.unwrap();

        let queue = ReadQueue::new(
            link as Arc<dyn GattLink>,
            Arc::new(MockPermissionGate::granted()),
        );
        let session = Session::new(queue);

        let policy = IngestionPolicy::new(
            Arc::new(MemoryStore::new()) as Arc<dyn MeasurementStore>,
            Arc::new(CylinderRegistry::new()) as Arc<dyn ActiveCylinderProvider>,
        );
        let (measurement_tx, _) = watch::channel(None);
        let (inclination_tx, _) = watch::channel(None);

        let handle = tokio::spawn(SensorDevice::pump(
            session.clone(),
            policy,
            measurement_tx,
            inclination_tx,
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Cancelling closes the queue; no further events will arrive, so
        // only the cancellation signal can wake the pump.
        session.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pump stayed parked after session cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_intervals_persists() {
        let f = fixture();

        let intervals = PollIntervals::from_millis(30_000, 60_000);
        f.device.set_intervals(intervals);

        assert_eq!(f.config.load(), intervals);
        assert_eq!(f.device.intervals(), intervals);
    }

    #[tokio::test]
    async fn test_cylinder_change_resets_rate_limit() {
        let f = fixture();

        f.device.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        let persisted = f.store.measurements().len();
        assert!(persisted >= 1);

        // Switching cylinders lets the next sample through the rate
        // limiter immediately.
        let spare = Cylinder::new("Spare", 6.0, 13.0);
        let spare_id = spare.id;
        f.registry.add(spare);
        f.registry.set_active(spare_id).unwrap();

        let intervals = PollIntervals::from_millis(200, 60_000);
        f.device.set_intervals(intervals);
        tokio::time::sleep(Duration::from_millis(900)).await;

        let after: Vec<_> = f
            .store
            .measurements()
            .into_iter()
            .filter(|m| m.cylinder_id == spare_id)
            .collect();
        assert!(!after.is_empty());

        f.device.disconnect().await.unwrap();
    }
}
