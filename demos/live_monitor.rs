//! Live cylinder monitoring example
//!
//! Discovers a nearby cylinder scale sensor, connects, and streams live
//! weight and inclination readings for a minute.
//!
//! Run with: cargo run --example live_monitor
//!
//! Cylinder geometry can be overridden on the command line:
//!   cargo run --example live_monitor -- --tare 5.0 --capacity 11.0

use gasgauge_ble::mock::{CylinderRegistry, MemoryIntervalStore, MemoryStore, MockPermissionGate};
use gasgauge_ble::{BtleplugLink, Cylinder, GattLink, Result, SensorDevice};
use std::sync::Arc;
use std::time::Duration;

fn arg_value(args: &[String], flag: &str) -> Option<f64> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,gasgauge_ble=debug")
        .init();

    println!("Live Cylinder Monitor");
    println!("=====================\n");

    let args: Vec<String> = std::env::args().collect();
    let tare_kg = arg_value(&args, "--tare").unwrap_or(5.0);
    let capacity_kg = arg_value(&args, "--capacity").unwrap_or(11.0);

    println!("Scanning for a cylinder scale sensor...");
    let link = Arc::new(BtleplugLink::discover(Duration::from_secs(10)).await?);
    println!("Found sensor at {}\n", link.address());

    let registry = Arc::new(CylinderRegistry::new());
    let cylinder = Cylinder::new("Demo cylinder", tare_kg, capacity_kg);
    let id = cylinder.id;
    registry.add(cylinder);
    registry.set_active(id)?;

    let device = SensorDevice::new(
        link,
        Arc::new(MockPermissionGate::granted()),
        registry,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryIntervalStore::new()),
    );

    device.connect().await?;
    println!("Connected; polling for 60 seconds...\n");

    let mut measurements = device.subscribe_measurements();
    let mut inclinations = device.subscribe_inclination();
    let deadline = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            changed = measurements.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(m) = measurements.borrow_and_update().clone() {
                    println!(
                        "Weight: {:6.2} kg total | fuel {:5.2} kg ({:5.1}%)",
                        m.total_weight_kg, m.fuel_kg, m.fuel_percent
                    );
                }
            }
            changed = inclinations.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(sample) = *inclinations.borrow_and_update() {
                    println!(
                        "Tilt:   pitch {:+5.1}° roll {:+5.1}° ({})",
                        sample.pitch_degrees,
                        sample.roll_degrees,
                        if sample.is_level() { "level" } else { "NOT LEVEL" }
                    );
                }
            }
        }
    }

    device.disconnect().await?;
    println!("\nDisconnected.");
    Ok(())
}
