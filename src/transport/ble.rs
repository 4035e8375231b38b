//! Bluetooth Low Energy printers via btleplug.
//!
//! Sessions hold a connected peripheral and the GATT characteristic chosen
//! for writes. Known printer profiles are tried before falling back to any
//! writable characteristic.

use super::{AuthorizedDevices, ChunkPolicy, DiscoveredDevice, TransportAdapter, TransportEvent, TransportSession};
use crate::config::BleConfig;
use crate::errors::{LinkError, Result};
use crate::record::TransportKind;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `(service, characteristic)` pairs used by common receipt printers.
const KNOWN_PROFILES: &[(Uuid, Uuid)] = &[
    // Generic BLE printer
    (
        Uuid::from_u128(0x000018F0_0000_1000_8000_00805F9B34FB),
        Uuid::from_u128(0x00002AF1_0000_1000_8000_00805F9B34FB),
    ),
    // Star Micronics
    (
        Uuid::from_u128(0x49535343_FE7D_4AE5_8FA9_9FAFD205E455),
        Uuid::from_u128(0x49535343_8841_43F4_A8D4_ECBE34729BB3),
    ),
    // Serial port profile bridges
    (
        Uuid::from_u128(0x00001101_0000_1000_8000_00805F9B34FB),
        Uuid::from_u128(0x00001102_0000_1000_8000_00805F9B34FB),
    ),
    // HM-10 style UART modules
    (
        Uuid::from_u128(0x0000FFE0_0000_1000_8000_00805F9B34FB),
        Uuid::from_u128(0x0000FFE1_0000_1000_8000_00805F9B34FB),
    ),
];

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BleAdapter {
    central: Option<Adapter>,
    config: BleConfig,
    events: broadcast::Sender<TransportEvent>,
    pump: Option<JoinHandle<()>>,
}

impl BleAdapter {
    /// Attach to the first Bluetooth adapter. A host without one still yields an adapter whose calls report `TransportUnavailable`.
    pub async fn new(config: BleConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(32);

        let central = match Manager::new().await {
            Ok(manager) => manager.adapters().await?.into_iter().next(),
            Err(e) => {
                warn!("Bluetooth manager unavailable: {}", e);
                None
            }
        };

        let pump = match &central {
            Some(central) => Some(spawn_disconnect_pump(central.clone(), events.clone()).await?),
            None => {
                warn!("No Bluetooth adapters found");
                None
            }
        };

        Ok(Self {
            central,
            config,
            events,
            pump,
        })
    }

    fn central(&self) -> Result<&Adapter> {
        self.central
            .as_ref()
            .ok_or_else(|| LinkError::TransportUnavailable("no Bluetooth adapter on this host".to_string()))
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.central()?.peripherals().await? {
            if peripheral_address(&peripheral).await.as_deref() == Some(address) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn describe(peripheral: &Peripheral) -> Option<DiscoveredDevice> {
        let props = peripheral.properties().await.ok().flatten()?;
        Some(DiscoveredDevice::new(
            TransportKind::Ble,
            props.address.to_string(),
            props.local_name,
        ))
    }
}

impl Drop for BleAdapter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Forward adapter-level disconnect notifications as transport events.
async fn spawn_disconnect_pump(central: Adapter, events: broadcast::Sender<TransportEvent>) -> Result<JoinHandle<()>> {
    let mut stream = central.events().await?;
    Ok(tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            if let CentralEvent::DeviceDisconnected(id) = event {
                let Ok(peripheral) = central.peripheral(&id).await else {
                    continue;
                };
                if let Some(address) = peripheral_address(&peripheral).await {
                    debug!("BLE peripheral {} reported disconnect", address);
                    let _ = events.send(TransportEvent::Disconnected {
                        kind: TransportKind::Ble,
                        address,
                    });
                }
            }
        }
    }))
}

async fn peripheral_address(peripheral: &Peripheral) -> Option<String> {
    peripheral
        .properties()
        .await
        .ok()
        .flatten()
        .map(|props| props.address.to_string())
}

/// Check if a BLE device name looks like a receipt printer
fn is_bluetooth_printer(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("printer")
        || lower.contains("star")
        || lower.contains("sm-")
        || lower.contains("tm-")
        || lower.contains("tsp")
        || lower.contains("citizen")
        || lower.contains("pos")
        || lower.contains("receipt")
}

/// Pick the characteristic to write print data to.
fn select_characteristic(characteristics: &[Characteristic]) -> Option<Characteristic> {
    let writable = |c: &&Characteristic| {
        c.properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    };

    KNOWN_PROFILES
        .iter()
        .find_map(|(service, characteristic)| {
            characteristics
                .iter()
                .filter(writable)
                .find(|c| c.service_uuid == *service && c.uuid == *characteristic)
        })
        .or_else(|| {
            characteristics
                .iter()
                .find(|c| c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE))
        })
        .or_else(|| characteristics.iter().find(|c| c.properties.contains(CharPropFlags::WRITE)))
        .cloned()
}

#[async_trait]
impl TransportAdapter for BleAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn chunking(&self) -> ChunkPolicy {
        ChunkPolicy {
            size: Some(self.config.chunk_size),
            delay: Duration::from_millis(self.config.chunk_delay_ms),
        }
    }

    async fn authorized_devices(&self) -> Result<AuthorizedDevices> {
        let mut devices = Vec::new();
        for peripheral in self.central()?.peripherals().await? {
            if let Some(device) = Self::describe(&peripheral).await {
                devices.push(device);
            }
        }
        Ok(AuthorizedDevices::Devices(devices))
    }

    async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        let central = self.central()?;
        info!("Starting Bluetooth printer scan ({}ms)", self.config.scan_ms);

        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(self.config.scan_ms)).await;
        let peripherals = central.peripherals().await;
        central.stop_scan().await.ok();

        let mut found = Vec::new();
        for peripheral in peripherals? {
            if let Some(device) = Self::describe(&peripheral).await {
                if device.name.as_deref().map(is_bluetooth_printer).unwrap_or(false) {
                    found.push(device);
                }
            }
        }

        info!("Bluetooth scan complete: {} printers found", found.len());
        Ok(found)
    }

    async fn probe(&self, device: &DiscoveredDevice) -> Result<bool> {
        let Some(peripheral) = self.find_peripheral(&device.address).await? else {
            return Ok(false);
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            return Ok(true);
        }
        // Recent advertisement means it is in range
        Ok(peripheral
            .properties()
            .await?
            .and_then(|props| props.rssi)
            .is_some())
    }

    async fn open(&self, device: &DiscoveredDevice) -> Result<Arc<dyn TransportSession>> {
        let peripheral = self
            .find_peripheral(&device.address)
            .await?
            .ok_or_else(|| LinkError::OutOfRange(format!("{} not in range", device.address)))?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }
        info!("Connected to BLE peripheral: {}", device.address);

        peripheral.discover_services().await?;
        let characteristics: Vec<Characteristic> = peripheral.characteristics().into_iter().collect();

        let Some(characteristic) = select_characteristic(&characteristics) else {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnecting {} after profile mismatch failed: {}", device.address, e);
            }
            return Err(LinkError::ProtocolMismatch(format!(
                "no writable characteristic on {}",
                device.display_name()
            )));
        };

        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };
        debug!(
            "Using BLE characteristic {} (service: {}, type: {:?})",
            characteristic.uuid, characteristic.service_uuid, write_type
        );

        Ok(Arc::new(BleSession {
            peripheral,
            characteristic,
            write_type,
        }))
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        self.central.as_ref().map(|_| self.events.subscribe())
    }
}

struct BleSession {
    peripheral: Peripheral,
    characteristic: Characteristic,
    write_type: WriteType,
}

#[async_trait]
impl TransportSession for BleSession {
    async fn write(&self, chunk: &[u8]) -> Result<()> {
        tokio::time::timeout(
            WRITE_TIMEOUT,
            self.peripheral.write(&self.characteristic, chunk, self.write_type),
        )
        .await??;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
