// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # gasgauge-ble
//!
//! A cross-platform Rust library for communicating with smart LPG cylinder
//! scale sensors via Bluetooth Low Energy.
//!
//! The sensor sits under a gas cylinder and exposes three GATT
//! characteristics: live total weight, two-axis inclination, and a buffer
//! of offline history accumulated while no collector was connected. This
//! library drives the full ingestion pipeline on top of that surface.
//!
//! ## Features
//!
//! - **Sensor Discovery**: Scan for nearby cylinder scale sensors
//! - **Live Polling**: Independently configurable weight and inclination cadences
//! - **Single-flight Read Queue**: Serialized GATT reads with a timeout watchdog
//! - **Offline Sync**: Drain the sensor's buffered history after a reconnect,
//!   with per-session deduplication
//! - **Fuel Accounting**: Convert raw weights to fuel mass and percentage
//!   against the active cylinder's tare and capacity
//! - **Consumption History**: Significant-change tracking keeps the durable
//!   record dense around events and sparse when idle
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gasgauge_ble::{BtleplugLink, Result, SensorDevice};
//! use gasgauge_ble::mock::{CylinderRegistry, MemoryIntervalStore, MemoryStore, MockPermissionGate};
//! use gasgauge_ble::Cylinder;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Find a sensor and set up the collaborators.
//!     let link = Arc::new(BtleplugLink::discover(Duration::from_secs(10)).await?);
//!     let registry = Arc::new(CylinderRegistry::new());
//!     let cylinder = Cylinder::new("Patio", 5.0, 11.0);
//!     let id = cylinder.id;
//!     registry.add(cylinder);
//!     registry.set_active(id)?;
//!
//!     let device = SensorDevice::new(
//!         link,
//!         Arc::new(MockPermissionGate::granted()),
//!         registry,
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryIntervalStore::new()),
//!     );
//!
//!     device.connect().await?;
//!
//!     // Watch live measurements arrive.
//!     let mut measurements = device.subscribe_measurements();
//!     while measurements.changed().await.is_ok() {
//!         if let Some(m) = measurements.borrow_and_update().clone() {
//!             println!("{:.2} kg fuel ({:.1}%)", m.fuel_kg, m.fuel_percent);
//!         }
//!     }
//!
//!     device.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod data;
pub mod device;
pub mod error;
pub mod ingest;
pub mod mock;
pub mod poll;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod traits;
pub mod utils;

// Re-exports for convenience
pub use device::SensorDevice;
pub use error::{Error, Result};
pub use utils::{kg_to_lb, lb_to_kg};

// Re-export commonly used types from submodules
pub use ble::connection::ConnectionState;
pub use ble::link::{BtleplugLink, GattLink};
pub use ble::queue::{ReadOutcome, ReadRequest, DEFAULT_READ_TIMEOUT};
pub use data::{
    ConsumptionRecord, Cylinder, InclinationSample, Measurement, SaveResult,
    LEVEL_THRESHOLD_DEGREES,
};
pub use ingest::{IngestionPolicy, SignificantChangeTracker};
pub use poll::{PollIntervals, DEFAULT_POLL_INTERVAL_MS};
pub use sync::OfflineSyncEngine;
pub use traits::{ActiveCylinderProvider, IntervalConfigStore, MeasurementStore, PermissionGate};
