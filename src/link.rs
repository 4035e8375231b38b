//! The constructed context that owns one printer link: registry, store,
//! transports, controller and dispatcher. Built once by the application
//! shell and torn down with [`PrinterLink::shutdown`].

use crate::broadcast::{BroadcastHub, BroadcastType, CrossTabBroadcaster};
use crate::clock::{Clock, SystemClock};
use crate::config::LinkConfig;
use crate::controller::{LinkServices, ReconnectionController, SweepOutcome};
use crate::dispatcher::{PrintDispatcher, PrintOutcome};
use crate::errors::{LinkError, Result};
use crate::metrics::{LinkMetrics, MetricsSnapshot};
use crate::notifier::{Level, LogSink, NotificationSink, Notification, StatusKind, StatusNotifier};
use crate::record::{ConnectionStatus, RecordSummary, TransportKind};
use crate::registry::{ConnectionRegistry, RecordAttrs};
use crate::store::PersistenceStore;
use crate::transport::ble::BleAdapter;
use crate::transport::network::{NetworkAddress, NetworkAdapter};
use crate::transport::usb::UsbAdapter;
use crate::transport::{match_device, AuthorizedDevices, DevicePicker, DiscoveredDevice, TransportAdapter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Connected,
    Partial,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub connected: usize,
    pub total: usize,
    pub status: OverallStatus,
}

/// Collaborators a link is built from. Lets tests swap in mock transports and a manual clock.
pub struct LinkParts {
    pub config: LinkConfig,
    pub adapters: Vec<Arc<dyn TransportAdapter>>,
    pub store: Arc<PersistenceStore>,
    pub hub: Arc<BroadcastHub>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

pub struct PrinterLink {
    config: LinkConfig,
    registry: Arc<ConnectionRegistry>,
    controller: ReconnectionController,
    dispatcher: PrintDispatcher,
    metrics: Arc<LinkMetrics>,
    notifier: Arc<StatusNotifier>,
    broadcaster: CrossTabBroadcaster,
}

impl PrinterLink {
    /// Build a link over the real transports and the on-disk store.
    pub async fn from_config(config: LinkConfig, hub: Arc<BroadcastHub>) -> Result<Self> {
        let store = Arc::new(PersistenceStore::open(&config.database_path()).await?);
        let mut adapters: Vec<Arc<dyn TransportAdapter>> = Vec::new();

        for kind in &config.enabled_transports {
            let adapter: Result<Arc<dyn TransportAdapter>> = match kind {
                TransportKind::Ble => BleAdapter::new(config.ble.clone())
                    .await
                    .map(|a| Arc::new(a) as Arc<dyn TransportAdapter>),
                TransportKind::Usb => {
                    UsbAdapter::new(config.usb.clone()).map(|a| Arc::new(a) as Arc<dyn TransportAdapter>)
                }
                TransportKind::Network => {
                    NetworkAdapter::new(&config.relay).map(|a| Arc::new(a) as Arc<dyn TransportAdapter>)
                }
            };
            match adapter {
                Ok(adapter) => adapters.push(adapter),
                Err(e) => warn!("{} transport disabled: {}", kind, e),
            }
        }

        Self::new(LinkParts {
            config,
            adapters,
            store,
            hub,
            sink: Arc::new(LogSink),
            clock: Arc::new(SystemClock),
        })
        .await
    }

    /// Restore persisted records (all DISCONNECTED) and wire the components together.
    pub async fn new(parts: LinkParts) -> Result<Self> {
        parts.config.validate()?;

        let registry = Arc::new(ConnectionRegistry::new(parts.clock));
        let restored = registry.restore(parts.store.load().await).await;
        info!("Restored {} printers from storage", restored);

        let metrics = Arc::new(LinkMetrics::new());
        let notifier = Arc::new(StatusNotifier::new(parts.sink));
        let broadcaster = CrossTabBroadcaster::new(parts.hub);

        let controller = ReconnectionController::new(LinkServices {
            registry: registry.clone(),
            adapters: parts.adapters,
            store: parts.store,
            notifier: notifier.clone(),
            broadcaster: broadcaster.clone(),
            metrics: metrics.clone(),
            policy: parts.config.policy.clone(),
        });
        let dispatcher = PrintDispatcher::new(controller.clone(), metrics.clone());

        Ok(Self {
            config: parts.config,
            registry,
            controller,
            dispatcher,
            metrics,
            notifier,
            broadcaster,
        })
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn controller(&self) -> &ReconnectionController {
        &self.controller
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn start(&self) {
        self.controller.start();
    }

    /// Stop background work and close every live session. Records stay persisted.
    pub async fn shutdown(&self) {
        self.controller.stop();
        let closed = self.registry.disconnect_all().await;
        self.controller.persist().await;
        info!("Printer link shut down ({} sessions closed)", closed);
    }

    /// User-initiated connect of a known printer. Re-arms the sweep gates.
    pub async fn connect_printer(&self, id: &str) -> Result<RecordSummary> {
        self.controller.reset_gates();
        let record = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| LinkError::PrinterNotFound(id.to_string()))?;
        if record.is_connected() {
            return Ok(record.summary());
        }

        let adapter = self.controller.adapter(record.transport_kind)?;
        let device = match adapter.authorized_devices().await? {
            AuthorizedDevices::Unsupported => DiscoveredDevice::from_record(&record),
            AuthorizedDevices::Devices(devices) => match match_device(&record, &devices) {
                Some(device) => device.clone(),
                None => {
                    return Err(LinkError::OutOfRange(format!(
                        "{} was not found. Check if it's powered on and in range.",
                        record.display_name
                    )))
                }
            },
        };

        Ok(self.controller.connect_device(id, &device).await?.summary())
    }

    /// Add a network printer by IP. Nothing is kept unless the relay can reach it.
    pub async fn add_network_printer(&self, name: &str, ip: &str, port: Option<u16>) -> Result<RecordSummary> {
        let address = NetworkAddress::new(ip, port.unwrap_or(crate::transport::network::DEFAULT_PORT))?;
        let address = address.to_string();
        let existed = self
            .registry
            .find_by_address(TransportKind::Network, &address)
            .await
            .is_some();

        let id = self
            .registry
            .upsert(TransportKind::Network, &address, RecordAttrs::named(name))
            .await;
        let device = DiscoveredDevice::new(TransportKind::Network, address, Some(name.to_string()));

        match self.controller.connect_device(&id, &device).await {
            Ok(record) => Ok(record.summary()),
            Err(e) => {
                if !existed {
                    if let Err(remove_err) = self.registry.remove(&id).await {
                        debug!("Could not drop unreachable network printer {}: {}", id, remove_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Let a person pick a new device. `Ok(None)` means the picker was cancelled.
    pub async fn pair_new_printer(&self, kind: TransportKind, picker: &dyn DevicePicker) -> Result<Option<RecordSummary>> {
        let candidates = self.discover_printers(kind).await?;
        let Some(device) = picker.pick(candidates).await else {
            info!("{} device selection cancelled", kind);
            return Ok(None);
        };

        let id = self
            .registry
            .upsert(kind, &device.address, RecordAttrs::named(device.display_name()))
            .await;
        self.controller.reset_gates();
        let record = self.controller.connect_device(&id, &device).await?;
        Ok(Some(record.summary()))
    }

    pub async fn discover_printers(&self, kind: TransportKind) -> Result<Vec<DiscoveredDevice>> {
        self.controller.adapter(kind)?.scan().await
    }

    /// Forget a printer, closing its session first.
    pub async fn disconnect_printer(&self, id: &str) -> Result<()> {
        let record = self.registry.remove(id).await?;
        self.broadcaster.publish(BroadcastType::Disconnected, &record);
        let aggregate = self.registry.aggregate().await;
        self.notifier.emit(
            StatusKind::Removed,
            &record,
            aggregate,
            Some(Notification::new(Level::Info, format!("Disconnected from {}", record.display_name))),
        );
        self.controller.persist().await;
        Ok(())
    }

    /// Forget every printer.
    pub async fn disconnect_all(&self) -> usize {
        let records = self.registry.list().await;
        let removed = self.registry.clear().await;
        for record in &records {
            self.broadcaster.publish(BroadcastType::Disconnected, record);
        }
        self.controller.persist().await;
        info!("Disconnected all {} printers", removed);
        removed
    }

    /// Drop every DISCONNECTED or FAILED record. Attempts in flight are left alone.
    pub async fn clear_disconnected(&self) -> usize {
        let removed = self
            .registry
            .remove_where(|r| matches!(r.status, ConnectionStatus::Disconnected | ConnectionStatus::Failed))
            .await;
        if !removed.is_empty() {
            self.controller.persist().await;
        }
        removed.len()
    }

    /// Forget everything and start from a clean slate.
    pub async fn reset_all(&self) {
        self.disconnect_all().await;
        self.metrics.reset().await;
        self.controller.reset_gates();
        info!("Printer link reset");
    }

    pub async fn list_printers(&self) -> Vec<RecordSummary> {
        self.registry.list().await.iter().map(|r| r.summary()).collect()
    }

    pub async fn connected_printers(&self) -> Vec<RecordSummary> {
        self.registry
            .list_by_status(ConnectionStatus::Connected)
            .await
            .iter()
            .map(|r| r.summary())
            .collect()
    }

    pub async fn connection_status(&self) -> LinkStatus {
        let (connected, total) = self.registry.aggregate().await;
        let status = if connected == 0 {
            OverallStatus::Disconnected
        } else if connected == total {
            OverallStatus::Connected
        } else {
            OverallStatus::Partial
        };
        LinkStatus {
            connected,
            total,
            status,
        }
    }

    pub async fn send_to(&self, id: &str, bytes: &[u8], label: Option<&str>) -> Result<()> {
        self.dispatcher.send_to(id, bytes, label).await
    }

    pub async fn send_to_all_connected(&self, bytes: &[u8], label: Option<&str>) -> Result<Vec<PrintOutcome>> {
        self.dispatcher.send_to_all_connected(bytes, label).await
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot().await
    }

    pub async fn on_foreground(&self) -> SweepOutcome {
        self.controller.on_foreground().await
    }

    pub async fn prune_unreachable(&self) -> Vec<RecordSummary> {
        self.controller
            .prune_unreachable(self.config.policy.prune_threshold())
            .await
            .iter()
            .map(|r| r.summary())
            .collect()
    }
}
