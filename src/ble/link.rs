//! GATT link transport.
//!
//! [`GattLink`] abstracts the physical BLE link so the pipeline can run
//! against mock transports in tests. [`BtleplugLink`] is the production
//! implementation over btleplug.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::uuids::SCALE_SERVICE_UUID;
use crate::error::{Error, Result};

/// Event emitted by the link transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The physical link dropped without a disconnect request.
    Disconnected,
}

/// A single physical GATT link to one sensor.
///
/// Implementations expose exactly the surface the pipeline needs: connect,
/// discover, read, disconnect, and a stream of unsolicited link events.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Establish the physical link.
    async fn connect(&self) -> Result<()>;

    /// Tear the physical link down.
    async fn disconnect(&self) -> Result<()>;

    /// Discover services and return the characteristic UUIDs found.
    async fn discover_characteristics(&self) -> Result<Vec<Uuid>>;

    /// Read the current value of a characteristic.
    async fn read(&self, characteristic: &Uuid) -> Result<Vec<u8>>;

    /// Subscribe to unsolicited link events.
    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Address or identifier of the peer, for logging.
    fn address(&self) -> &str;
}

/// Production [`GattLink`] over a btleplug peripheral.
pub struct BtleplugLink {
    adapter: Adapter,
    peripheral: Peripheral,
    address: String,
    characteristics: RwLock<HashMap<Uuid, btleplug::api::Characteristic>>,
    event_tx: broadcast::Sender<LinkEvent>,
    monitor_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BtleplugLink {
    /// Wrap an already-located peripheral.
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        let address = format!("{:?}", peripheral.id());
        let (event_tx, _) = broadcast::channel(16);

        Self {
            adapter,
            peripheral,
            address,
            characteristics: RwLock::new(HashMap::new()),
            event_tx,
            monitor_handle: RwLock::new(None),
        }
    }

    /// Scan for the first peripheral advertising the scale service.
    ///
    /// # Errors
    ///
    /// Returns `BluetoothUnavailable` if no adapter is present, or
    /// `ConnectionFailed` if nothing was found within `timeout`.
    pub async fn discover(timeout: Duration) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Scanning for cylinder scale sensors on adapter {:?}",
            adapter.adapter_info().await.ok()
        );

        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SCALE_SERVICE_UUID],
            })
            .await
            .map_err(Error::Bluetooth)?;

        let found = tokio::time::timeout(timeout, async {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDiscovered(id) = event {
                    match adapter.peripheral(&id).await {
                        Ok(peripheral) => return Some(peripheral),
                        Err(e) => debug!("Discovered peripheral vanished: {}", e),
                    }
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        let _ = adapter.stop_scan().await;

        match found {
            Some(peripheral) => {
                info!("Found cylinder scale sensor: {:?}", peripheral.id());
                Ok(Self::new(adapter, peripheral))
            }
            None => Err(Error::ConnectionFailed {
                reason: "no cylinder scale sensor found".to_string(),
            }),
        }
    }

    /// Start the background task that watches for unsolicited disconnects.
    async fn start_disconnect_monitor(&self) -> Result<()> {
        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        let peripheral_id = self.peripheral.id();
        let event_tx = self.event_tx.clone();
        let address = self.address.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        warn!("Link to {} dropped", address);
                        let _ = event_tx.send(LinkEvent::Disconnected);
                        break;
                    }
                }
            }
        });

        if let Some(old) = self.monitor_handle.write().replace(handle) {
            old.abort();
        }

        Ok(())
    }

    fn stop_disconnect_monitor(&self) {
        if let Some(handle) = self.monitor_handle.write().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn connect(&self) -> Result<()> {
        if !self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.connect().await.map_err(Error::Bluetooth)?;
        }

        info!("Connected to sensor {}", self.address);
        self.start_disconnect_monitor().await?;

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_disconnect_monitor();
        self.characteristics.write().clear();

        self.peripheral
            .disconnect()
            .await
            .map_err(Error::Bluetooth)?;

        info!("Disconnected from sensor {}", self.address);
        Ok(())
    }

    async fn discover_characteristics(&self) -> Result<Vec<Uuid>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let mut cache = self.characteristics.write();
        cache.clear();

        for service in self.peripheral.services() {
            for characteristic in service.characteristics {
                trace!(
                    "Found characteristic {} in service {}",
                    characteristic.uuid,
                    service.uuid
                );
                cache.insert(characteristic.uuid, characteristic);
            }
        }

        debug!("Discovered {} characteristics", cache.len());
        Ok(cache.keys().copied().collect())
    }

    async fn read(&self, characteristic: &Uuid) -> Result<Vec<u8>> {
        let target = self
            .characteristics
            .read()
            .get(characteristic)
            .cloned()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: characteristic.to_string(),
            })?;

        let data = self
            .peripheral
            .read(&target)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Read {} bytes from {}", data.len(), characteristic);
        Ok(data)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.event_tx.subscribe()
    }

    fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_disconnect_monitor();
    }
}
