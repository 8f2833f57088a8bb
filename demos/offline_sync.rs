//! Offline history sync walkthrough
//!
//! Runs the full pipeline against a scripted mock sensor, so it works
//! without any BLE hardware. The mock's history characteristic serves two
//! buffered pages (one of them retransmitted) followed by the end-of-data
//! sentinel; the pipeline drains, deduplicates, and persists them.
//!
//! Run with: cargo run --example offline_sync

use gasgauge_ble::mock::{
    CylinderRegistry, MemoryIntervalStore, MemoryStore, MockLink, MockPermissionGate,
};
use gasgauge_ble::{ble::uuids::HISTORY_CHARACTERISTIC_UUID, Cylinder, Result, SensorDevice};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("info,gasgauge_ble=debug")
        .init();

    println!("Offline Sync Walkthrough");
    println!("========================\n");

    let link = Arc::new(MockLink::with_all_characteristics());

    // Two buffered pages; the first is retransmitted because the mock
    // sensor "never saw" an acknowledgement for it.
    link.script_read(
        HISTORY_CHARACTERISTIC_UUID,
        br#"[{"w":25.10,"t":900000},{"w":24.95,"t":600000}]"#,
    );
    link.script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":25.10,"t":900000}]"#);
    link.script_read(HISTORY_CHARACTERISTIC_UUID, br#"[{"w":24.80,"t":300000}]"#);
    link.script_read(HISTORY_CHARACTERISTIC_UUID, b"END");

    let registry = Arc::new(CylinderRegistry::new());
    let cylinder = Cylinder::new("Demo cylinder", 14.5, 11.0);
    let id = cylinder.id;
    registry.add(cylinder);
    registry.set_active(id)?;

    let store = Arc::new(MemoryStore::new());
    let device = SensorDevice::new(
        link,
        Arc::new(MockPermissionGate::granted()),
        registry,
        store.clone(),
        Arc::new(MemoryIntervalStore::new()),
    );

    let mut history = device.subscribe_history();

    device.connect().await?;
    println!("Connected; draining the offline buffer...\n");

    // Watch the time-ordered history list grow as pages arrive.
    while tokio::time::timeout(Duration::from_secs(2), history.changed())
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    {
        let list = history.borrow_and_update().clone();
        println!("History so far ({} samples):", list.len());
        for m in &list {
            println!(
                "  {} | {:6.2} kg total | fuel {:5.2} kg ({:5.1}%)",
                m.timestamp_ms, m.total_weight_kg, m.fuel_kg, m.fuel_percent
            );
        }
        println!();
    }

    device.disconnect().await?;

    let historical = store
        .measurements()
        .into_iter()
        .filter(|m| m.is_historical)
        .count();
    println!("Persisted {} historical measurements (retransmission deduplicated).", historical);
    println!("Consumption records: {}", store.consumption_records().len());

    Ok(())
}
