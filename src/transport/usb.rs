//! USB printers via rusb. libusb calls block, so every one runs on the
//! blocking thread pool.

use super::{AuthorizedDevices, ChunkPolicy, DiscoveredDevice, TransportAdapter, TransportSession};
use crate::config::UsbConfig;
use crate::errors::{LinkError, Result};
use crate::record::TransportKind;
use async_trait::async_trait;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Known thermal printer vendor IDs
const VENDOR_IDS: &[(u16, &str)] = &[
    (0x04b8, "Epson"),
    (0x0519, "Star Micronics"),
    (0x04f9, "Brother"),
    (0x1d90, "Citizen"),
    (0x0fe6, "ICS Advent"),
    (0x154f, "Wincor Nixdorf"),
];

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

/// Parsed `usb:vvvv:pppp[:serial]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbAddress {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

impl UsbAddress {
    pub fn parse(address: &str) -> Result<Self> {
        let mut parts = address.splitn(4, ':');
        let invalid = || LinkError::InvalidRequest(format!("Invalid USB address: {}", address));

        if parts.next() != Some("usb") {
            return Err(invalid());
        }
        let vendor_id = parts.next().and_then(|p| u16::from_str_radix(p, 16).ok()).ok_or_else(invalid)?;
        let product_id = parts.next().and_then(|p| u16::from_str_radix(p, 16).ok()).ok_or_else(invalid)?;
        let serial = parts.next().filter(|s| !s.is_empty()).map(str::to_string);

        Ok(Self {
            vendor_id,
            product_id,
            serial,
        })
    }
}

impl std::fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "usb:{:04x}:{:04x}", self.vendor_id, self.product_id)?;
        if let Some(serial) = &self.serial {
            write!(f, ":{}", serial)?;
        }
        Ok(())
    }
}

fn vendor_name(vendor_id: u16) -> Option<&'static str> {
    VENDOR_IDS.iter().find(|(vid, _)| *vid == vendor_id).map(|(_, name)| *name)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LinkError::Other(anyhow::anyhow!("USB worker failed: {}", e)))?
}

pub struct UsbAdapter {
    context: Context,
    config: UsbConfig,
}

impl UsbAdapter {
    pub fn new(config: UsbConfig) -> Result<Self> {
        info!("Initializing USB transport");
        let context = Context::new().map_err(|e| match e {
            rusb::Error::NotSupported => LinkError::TransportUnavailable("libusb is not supported on this host".to_string()),
            other => LinkError::Usb(other),
        })?;
        Ok(Self { context, config })
    }

    fn enumerate(context: &Context) -> Result<Vec<DiscoveredDevice>> {
        let mut found = Vec::new();

        for device in context.devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            let Some(vendor) = vendor_name(desc.vendor_id()) else {
                continue;
            };

            let (product, serial) = read_strings(&device, &desc);
            let address = UsbAddress {
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                serial,
            };
            let mut discovered = DiscoveredDevice::new(
                TransportKind::Usb,
                address.to_string(),
                Some(product.unwrap_or_else(|| format!("{} Printer", vendor))),
            );
            discovered.vendor = Some(vendor.to_string());
            found.push(discovered);
        }

        Ok(found)
    }

    fn find_device(context: &Context, address: &UsbAddress) -> Result<Option<Device<Context>>> {
        for device in context.devices()?.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != address.vendor_id || desc.product_id() != address.product_id {
                continue;
            }
            match &address.serial {
                None => return Ok(Some(device)),
                Some(wanted) => {
                    let (_, serial) = read_strings(&device, &desc);
                    if serial.as_deref() == Some(wanted.as_str()) {
                        return Ok(Some(device));
                    }
                }
            }
        }
        Ok(None)
    }

    fn open_blocking(context: &Context, address: &UsbAddress, config: &UsbConfig) -> Result<UsbSession> {
        let device = Self::find_device(context, address)?
            .ok_or_else(|| LinkError::OutOfRange(format!("USB device {} is not attached", address)))?;

        let (interface, endpoint, packet_size) = bulk_out_endpoint(&device)?
            .ok_or_else(|| LinkError::ProtocolMismatch(format!("no bulk OUT endpoint on {}", address)))?;

        let handle = device.open().map_err(|e| match e {
            rusb::Error::Access => {
                warn!("USB access denied for {}", address);
                LinkError::PermissionDenied(format!("USB access denied for {}", address))
            }
            other => LinkError::Usb(other),
        })?;

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable for {}: {}", address, e);
        }
        handle.claim_interface(interface).map_err(|e| match e {
            rusb::Error::Busy => {
                warn!("Cannot claim USB interface {} on {}: another driver may be active", interface, address);
                LinkError::TransportBusy(format!(
                    "USB interface {} on {} is claimed by another driver or application",
                    interface, address
                ))
            }
            rusb::Error::Access => LinkError::PermissionDenied(format!("cannot claim USB interface on {}", address)),
            other => LinkError::Usb(other),
        })?;

        debug!(
            "Claimed USB interface {} on {} (endpoint 0x{:02x}, packet {}B)",
            interface, address, endpoint, packet_size
        );

        Ok(UsbSession {
            handle: Arc::new(handle),
            interface,
            endpoint,
            packet_size: if packet_size == 0 {
                config.fallback_chunk_size
            } else {
                packet_size
            },
            timeout: Duration::from_millis(config.write_timeout_ms),
        })
    }
}

fn read_strings(device: &Device<Context>, desc: &DeviceDescriptor) -> (Option<String>, Option<String>) {
    let Ok(handle) = device.open() else {
        return (None, None);
    };
    let Some(language) = handle
        .read_languages(DESCRIPTOR_TIMEOUT)
        .ok()
        .and_then(|langs| langs.first().copied())
    else {
        return (None, None);
    };
    let product = handle.read_product_string(language, desc, DESCRIPTOR_TIMEOUT).ok();
    let serial = handle.read_serial_number_string(language, desc, DESCRIPTOR_TIMEOUT).ok();
    (product, serial)
}

/// `(interface, endpoint address, max packet size)` of the first bulk OUT endpoint.
fn bulk_out_endpoint(device: &Device<Context>) -> Result<Option<(u8, u8, usize)>> {
    let config = device.active_config_descriptor()?;
    for interface in config.interfaces() {
        for iface_desc in interface.descriptors() {
            for ep in iface_desc.endpoint_descriptors() {
                if ep.direction() == Direction::Out && ep.transfer_type() == TransferType::Bulk {
                    return Ok(Some((
                        iface_desc.interface_number(),
                        ep.address(),
                        usize::from(ep.max_packet_size()),
                    )));
                }
            }
        }
    }
    Ok(None)
}

#[async_trait]
impl TransportAdapter for UsbAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn chunking(&self) -> ChunkPolicy {
        ChunkPolicy {
            size: Some(self.config.fallback_chunk_size),
            delay: Duration::ZERO,
        }
    }

    async fn authorized_devices(&self) -> Result<AuthorizedDevices> {
        let context = self.context.clone();
        let devices = blocking(move || Self::enumerate(&context)).await?;
        Ok(AuthorizedDevices::Devices(devices))
    }

    async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        let context = self.context.clone();
        let devices = blocking(move || Self::enumerate(&context)).await?;
        info!("USB scan complete: {} printers attached", devices.len());
        Ok(devices)
    }

    async fn probe(&self, device: &DiscoveredDevice) -> Result<bool> {
        let address = UsbAddress::parse(&device.address)?;
        let context = self.context.clone();
        blocking(move || Ok(Self::find_device(&context, &address)?.is_some())).await
    }

    async fn open(&self, device: &DiscoveredDevice) -> Result<Arc<dyn TransportSession>> {
        let address = UsbAddress::parse(&device.address)?;
        let context = self.context.clone();
        let config = self.config.clone();
        let session = blocking(move || Self::open_blocking(&context, &address, &config)).await?;
        info!("Opened USB printer {}", device.address);
        Ok(Arc::new(session))
    }
}

struct UsbSession {
    handle: Arc<DeviceHandle<Context>>,
    interface: u8,
    endpoint: u8,
    packet_size: usize,
    timeout: Duration,
}

#[async_trait]
impl TransportSession for UsbSession {
    async fn write(&self, chunk: &[u8]) -> Result<()> {
        let handle = self.handle.clone();
        let endpoint = self.endpoint;
        let timeout = self.timeout;
        let data = chunk.to_vec();
        blocking(move || {
            let mut offset = 0;
            while offset < data.len() {
                offset += handle.write_bulk(endpoint, &data[offset..], timeout)?;
            }
            Ok(())
        })
        .await
    }

    async fn is_alive(&self) -> bool {
        let handle = self.handle.clone();
        blocking(move || Ok(handle.active_configuration().is_ok()))
            .await
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        let handle = self.handle.clone();
        let interface = self.interface;
        blocking(move || match handle.release_interface(interface) {
            Ok(()) | Err(rusb::Error::NoDevice) | Err(rusb::Error::NotFound) => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await
    }

    fn max_chunk(&self) -> Option<usize> {
        Some(self.packet_size)
    }
}
