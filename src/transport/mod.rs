//! Transport capability set shared by the BLE, USB and network-relay printers.
//!
//! The lifecycle core only ever talks to [`TransportAdapter`] and
//! [`TransportSession`]; everything device specific (GATT discovery, USB
//! interface claiming, relay HTTP calls) lives in the submodules.

pub mod ble;
pub mod network;
pub mod usb;

use crate::errors::Result;
use crate::record::{normalize_name, ConnectionRecord, HandleId, TransportKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A device reported by a transport, before or after it is bound to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub kind: TransportKind,
    pub address: String,
    pub name: Option<String>,
    pub vendor: Option<String>,
}

impl DiscoveredDevice {
    pub fn new(kind: TransportKind, address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            name,
            vendor: None,
        }
    }

    /// The device a record already describes, for transports whose address is enough to connect.
    pub fn from_record(record: &ConnectionRecord) -> Self {
        Self::new(
            record.transport_kind,
            record.transport_address.clone(),
            Some(record.display_name.clone()),
        )
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| match self.kind {
            TransportKind::Ble => "Bluetooth Printer".to_string(),
            TransportKind::Usb => "USB Printer".to_string(),
            TransportKind::Network => format!("Network Printer {}", self.address),
        })
    }
}

/// Result of asking a transport for devices this host already has access to.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthorizedDevices {
    /// The transport cannot list devices; records connect by address alone.
    Unsupported,
    Devices(Vec<DiscoveredDevice>),
}

/// Asynchronous notifications raised by a transport outside any call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Disconnected { kind: TransportKind, address: String },
}

/// How payloads are split before writing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkPolicy {
    /// `None` sends the whole payload in one write.
    pub size: Option<usize>,
    /// Pause between chunks for controllers with little buffering.
    pub delay: Duration,
}

impl ChunkPolicy {
    pub fn unchunked() -> Self {
        Self {
            size: None,
            delay: Duration::ZERO,
        }
    }

    pub fn split<'a>(&self, bytes: &'a [u8]) -> Vec<&'a [u8]> {
        match self.size {
            Some(size) if size > 0 => bytes.chunks(size).collect(),
            _ if bytes.is_empty() => Vec::new(),
            _ => vec![bytes],
        }
    }
}

/// An open connection to one printer.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn write(&self, chunk: &[u8]) -> Result<()>;

    /// Write with a job label, for transports that forward one (the network relay).
    async fn write_labeled(&self, chunk: &[u8], _label: Option<&str>) -> Result<()> {
        self.write(chunk).await
    }

    /// Side-effect-light check that the session is still usable.
    async fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<()>;

    /// Session-specific chunk size, e.g. the USB endpoint packet size.
    fn max_chunk(&self) -> Option<usize> {
        None
    }
}

impl fmt::Debug for dyn TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn chunking(&self) -> ChunkPolicy;

    /// Devices this host is already authorized to use, without prompting anyone.
    async fn authorized_devices(&self) -> Result<AuthorizedDevices>;

    /// Look for new devices (used when pairing).
    async fn scan(&self) -> Result<Vec<DiscoveredDevice>>;

    /// Liveness probe performed before any open: is the device reachable right now?
    async fn probe(&self, device: &DiscoveredDevice) -> Result<bool>;

    async fn open(&self, device: &DiscoveredDevice) -> Result<Arc<dyn TransportSession>>;

    /// Disconnect notifications, when the transport reports them.
    fn subscribe(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        None
    }
}

/// Exclusive handle to an open session, owned by a registry entry.
#[derive(Clone)]
pub struct LiveHandle {
    id: HandleId,
    session: Arc<dyn TransportSession>,
}

impl LiveHandle {
    pub fn new(id: HandleId, session: Arc<dyn TransportSession>) -> Self {
        Self { id, session }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn TransportSession> {
        &self.session
    }
}

impl fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveHandle").field("id", &self.id).finish()
    }
}

/// External collaborator that lets a person choose a new device. `None` means cancelled.
#[async_trait]
pub trait DevicePicker: Send + Sync {
    async fn pick(&self, candidates: Vec<DiscoveredDevice>) -> Option<DiscoveredDevice>;
}

/// Picks the first candidate whose address or name matches the given selector.
#[derive(Debug, Clone)]
pub struct SelectorPicker {
    pub selector: Option<String>,
}

#[async_trait]
impl DevicePicker for SelectorPicker {
    async fn pick(&self, candidates: Vec<DiscoveredDevice>) -> Option<DiscoveredDevice> {
        match &self.selector {
            None => candidates.into_iter().next(),
            Some(selector) => {
                let wanted = normalize_name(selector);
                candidates.into_iter().find(|d| {
                    d.address.eq_ignore_ascii_case(selector)
                        || d.name.as_deref().map(normalize_name).as_deref() == Some(wanted.as_str())
                })
            }
        }
    }
}

/// Match a stored record against devices a transport reports.
///
/// Address is the primary key; only when no device carries the record's
/// address does a case-normalized display-name match apply. First match wins.
pub fn match_device<'a>(record: &ConnectionRecord, devices: &'a [DiscoveredDevice]) -> Option<&'a DiscoveredDevice> {
    if !record.transport_address.is_empty() {
        if let Some(found) = devices.iter().find(|d| d.address == record.transport_address) {
            return Some(found);
        }
    }

    let wanted = normalize_name(&record.display_name);
    if wanted.is_empty() {
        return None;
    }
    devices
        .iter()
        .find(|d| d.name.as_deref().map(normalize_name).as_deref() == Some(wanted.as_str()))
}
