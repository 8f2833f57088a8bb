//! Mock and in-memory collaborator implementations.
//!
//! [`MockLink`] implements [`GattLink`] with scripted payloads, latency
//! and failure injection, and concurrency accounting, so the whole
//! pipeline can be exercised without BLE hardware. The in-memory
//! [`MemoryStore`], [`CylinderRegistry`], and [`MemoryIntervalStore`]
//! stand in for the application's durable collaborators in tests and
//! demos.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::ble::link::{GattLink, LinkEvent};
use crate::ble::uuids::{
    HISTORY_CHARACTERISTIC_UUID, INCLINATION_CHARACTERISTIC_UUID, REQUIRED_CHARACTERISTICS,
    WEIGHT_CHARACTERISTIC_UUID,
};
use crate::data::{ConsumptionRecord, Cylinder, Measurement};
use crate::error::{Error, Result};
use crate::poll::PollIntervals;
use crate::traits::{ActiveCylinderProvider, IntervalConfigStore, MeasurementStore, PermissionGate};

enum MockResponse {
    Payload(Vec<u8>),
    Error(String),
    /// Never answer; exercises the read-timeout watchdog.
    Stall,
}

/// A scripted in-memory [`GattLink`].
pub struct MockLink {
    characteristics: RwLock<Vec<Uuid>>,
    responses: Mutex<HashMap<Uuid, VecDeque<MockResponse>>>,
    default_payloads: Mutex<HashMap<Uuid, Vec<u8>>>,
    connected: AtomicBool,
    read_latency: Mutex<Duration>,
    read_counts: Mutex<HashMap<Uuid, u32>>,
    active_reads: AtomicU32,
    max_concurrent_reads: AtomicU32,
    event_tx: broadcast::Sender<LinkEvent>,
}

impl MockLink {
    /// A link exposing an arbitrary characteristic set.
    pub fn with_characteristics(characteristics: Vec<Uuid>) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            characteristics: RwLock::new(characteristics),
            responses: Mutex::new(HashMap::new()),
            default_payloads: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            read_latency: Mutex::new(Duration::ZERO),
            read_counts: Mutex::new(HashMap::new()),
            active_reads: AtomicU32::new(0),
            max_concurrent_reads: AtomicU32::new(0),
            event_tx,
        }
    }

    /// A healthy sensor exposing all three characteristics with benign
    /// default payloads.
    pub fn with_all_characteristics() -> Self {
        let link = Self::with_characteristics(REQUIRED_CHARACTERISTICS.to_vec());
        link.set_default_payload(WEIGHT_CHARACTERISTIC_UUID, br#"{"w": 10.5}"#.to_vec());
        link.set_default_payload(
            INCLINATION_CHARACTERISTIC_UUID,
            br#"{"p": 1.0, "r": -1.0}"#.to_vec(),
        );
        link.set_default_payload(HISTORY_CHARACTERISTIC_UUID, b"[]".to_vec());
        link
    }

    /// Queue a payload for the next read of a characteristic.
    pub fn script_read(&self, characteristic: Uuid, payload: &[u8]) {
        self.responses
            .lock()
            .entry(characteristic)
            .or_default()
            .push_back(MockResponse::Payload(payload.to_vec()));
    }

    /// Make the next read of a characteristic fail with a device error.
    pub fn fail_next_read(&self, characteristic: Uuid, message: &str) {
        self.responses
            .lock()
            .entry(characteristic)
            .or_default()
            .push_back(MockResponse::Error(message.to_string()));
    }

    /// Make the next read of a characteristic hang forever.
    pub fn stall_next_read(&self, characteristic: Uuid) {
        self.responses
            .lock()
            .entry(characteristic)
            .or_default()
            .push_back(MockResponse::Stall);
    }

    /// Payload returned when nothing is scripted for a characteristic.
    pub fn set_default_payload(&self, characteristic: Uuid, payload: Vec<u8>) {
        self.default_payloads.lock().insert(characteristic, payload);
    }

    /// Simulated per-read latency.
    pub fn set_read_latency(&self, latency: Duration) {
        *self.read_latency.lock() = latency;
    }

    /// Number of reads issued against a characteristic.
    pub fn read_count(&self, characteristic: &Uuid) -> u32 {
        self.read_counts
            .lock()
            .get(characteristic)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of reads ever in flight simultaneously.
    pub fn max_concurrent_reads(&self) -> u32 {
        self.max_concurrent_reads.load(Ordering::SeqCst)
    }

    /// Simulate an unsolicited link drop.
    pub fn emit_link_dropped(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.event_tx.send(LinkEvent::Disconnected);
    }

    /// Whether the link is currently connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Tracks concurrent reads even when a read future is dropped mid-flight
/// by the queue's timeout.
struct ReadGuard<'a> {
    active: &'a AtomicU32,
}

impl<'a> ReadGuard<'a> {
    fn enter(active: &'a AtomicU32, max: &AtomicU32) -> Self {
        let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now_active, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn discover_characteristics(&self) -> Result<Vec<Uuid>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(self.characteristics.read().clone())
    }

    async fn read(&self, characteristic: &Uuid) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if !self.characteristics.read().contains(characteristic) {
            return Err(Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            });
        }

        let _guard = ReadGuard::enter(&self.active_reads, &self.max_concurrent_reads);
        *self.read_counts.lock().entry(*characteristic).or_insert(0) += 1;

        let response = self
            .responses
            .lock()
            .get_mut(characteristic)
            .and_then(|queue| queue.pop_front());

        let latency = *self.read_latency.lock();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }

        match response {
            Some(MockResponse::Payload(data)) => Ok(data),
            Some(MockResponse::Error(message)) => Err(Error::DeviceReportedError { message }),
            Some(MockResponse::Stall) => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Err(Error::ReadTimeout)
            }
            None => self
                .default_payloads
                .lock()
                .get(characteristic)
                .cloned()
                .ok_or(Error::DeviceReportedError {
                    message: "no scripted response".to_string(),
                }),
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    fn address(&self) -> &str {
        "MOCK-SCALE"
    }
}

/// Permission gate with a settable answer.
pub struct MockPermissionGate {
    granted: AtomicBool,
}

impl MockPermissionGate {
    /// A gate that always grants.
    pub fn granted() -> Self {
        Self {
            granted: AtomicBool::new(true),
        }
    }

    /// A gate that always denies.
    pub fn denied() -> Self {
        Self {
            granted: AtomicBool::new(false),
        }
    }

    /// Change the answer at runtime.
    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }
}

impl PermissionGate for MockPermissionGate {
    fn is_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }
}

/// In-memory append-only measurement store.
pub struct MemoryStore {
    measurements: RwLock<Vec<Measurement>>,
    consumption: RwLock<Vec<ConsumptionRecord>>,
    fail_writes: AtomicBool,
    fail_next_write: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            measurements: RwLock::new(Vec::new()),
            consumption: RwLock::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_next_write: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only the next write fail.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Snapshot of all persisted measurements.
    pub fn measurements(&self) -> Vec<Measurement> {
        self.measurements.read().clone()
    }

    /// Snapshot of all persisted consumption records.
    pub fn consumption_records(&self) -> Vec<ConsumptionRecord> {
        self.consumption.read().clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_next_write.swap(false, Ordering::SeqCst)
            || self.fail_writes.load(Ordering::SeqCst)
        {
            Err(Error::Storage {
                reason: "injected write failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeasurementStore for MemoryStore {
    async fn insert(&self, measurement: &Measurement) -> Result<()> {
        self.check_writable()?;
        self.measurements.write().push(measurement.clone());
        Ok(())
    }

    async fn insert_batch(&self, measurements: &[Measurement]) -> Result<()> {
        self.check_writable()?;
        self.measurements.write().extend_from_slice(measurements);
        Ok(())
    }

    async fn insert_consumption(&self, record: &ConsumptionRecord) -> Result<()> {
        self.check_writable()?;
        self.consumption.write().push(record.clone());
        Ok(())
    }
}

/// In-memory cylinder configuration with the single-active invariant.
pub struct CylinderRegistry {
    cylinders: RwLock<Vec<Cylinder>>,
    active_tx: watch::Sender<Option<Cylinder>>,
}

impl CylinderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            cylinders: RwLock::new(Vec::new()),
            active_tx,
        }
    }

    /// Register a cylinder.
    pub fn add(&self, cylinder: Cylinder) {
        self.cylinders.write().push(cylinder);
    }

    /// Activate one cylinder, deactivating all others atomically.
    pub fn set_active(&self, id: Uuid) -> Result<()> {
        let mut cylinders = self.cylinders.write();

        if !cylinders.iter().any(|c| c.id == id) {
            return Err(Error::Internal(format!("unknown cylinder: {id}")));
        }

        for cylinder in cylinders.iter_mut() {
            cylinder.is_active = cylinder.id == id;
        }

        let active = cylinders.iter().find(|c| c.is_active).cloned();
        self.active_tx.send_replace(active);
        Ok(())
    }

    /// Deactivate all cylinders.
    pub fn clear_active(&self) {
        for cylinder in self.cylinders.write().iter_mut() {
            cylinder.is_active = false;
        }
        self.active_tx.send_replace(None);
    }

    /// Snapshot of all registered cylinders.
    pub fn cylinders(&self) -> Vec<Cylinder> {
        self.cylinders.read().clone()
    }
}

impl Default for CylinderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveCylinderProvider for CylinderRegistry {
    fn active(&self) -> Option<Cylinder> {
        self.cylinders.read().iter().find(|c| c.is_active).cloned()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Cylinder>> {
        self.active_tx.subscribe()
    }
}

/// In-memory polling-interval configuration.
pub struct MemoryIntervalStore {
    intervals: Mutex<PollIntervals>,
}

impl MemoryIntervalStore {
    /// Store holding the default intervals.
    pub fn new() -> Self {
        Self::with_intervals(PollIntervals::default())
    }

    /// Store holding specific intervals.
    pub fn with_intervals(intervals: PollIntervals) -> Self {
        Self {
            intervals: Mutex::new(intervals),
        }
    }
}

impl Default for MemoryIntervalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalConfigStore for MemoryIntervalStore {
    fn load(&self) -> PollIntervals {
        *self.intervals.lock()
    }

    fn save(&self, intervals: PollIntervals) {
        *self.intervals.lock() = intervals;
    }
}
