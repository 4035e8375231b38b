//! Best-effort connection notices between link contexts in one process.
//!
//! Each transport kind has its own named channel. Receivers only ever merge
//! metadata or align a record to DISCONNECTED; a remote "connected" never
//! makes a local record CONNECTED, since sessions cannot move between contexts.

use crate::record::{ConnectionRecord, ConnectionStatus, TransportKind};
use crate::registry::ConnectionRegistry;
use crate::transport::LiveHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastType {
    Connected,
    Reconnected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrinterNotice {
    pub id: String,
    pub name: String,
    pub address: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: BroadcastType,
    pub printer: PrinterNotice,
}

impl BroadcastMessage {
    pub fn new(kind: BroadcastType, record: &ConnectionRecord) -> Self {
        Self {
            kind,
            printer: PrinterNotice {
                id: record.id.clone(),
                name: record.display_name.clone(),
                address: record.transport_address.clone(),
                connected_at: record.connected_at,
                last_used: record.last_used_at,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: Uuid,
    message: BroadcastMessage,
}

/// The set of named channels shared by every context in the process.
#[derive(Debug)]
pub struct BroadcastHub {
    channels: HashMap<&'static str, broadcast::Sender<Envelope>>,
}

impl BroadcastHub {
    pub fn new() -> Arc<Self> {
        let channels = TransportKind::ALL
            .iter()
            .map(|kind| (kind.channel_name(), broadcast::channel(64).0))
            .collect();
        Arc::new(Self { channels })
    }

    fn channel(&self, kind: TransportKind) -> Option<&broadcast::Sender<Envelope>> {
        self.channels.get(kind.channel_name())
    }
}

/// One context's endpoint on the hub.
#[derive(Debug, Clone)]
pub struct CrossTabBroadcaster {
    origin: Uuid,
    hub: Arc<BroadcastHub>,
}

impl CrossTabBroadcaster {
    pub fn new(hub: Arc<BroadcastHub>) -> Self {
        Self {
            origin: Uuid::new_v4(),
            hub,
        }
    }

    pub fn publish(&self, kind: BroadcastType, record: &ConnectionRecord) {
        let Some(channel) = self.hub.channel(record.transport_kind) else {
            return;
        };
        let envelope = Envelope {
            origin: self.origin,
            message: BroadcastMessage::new(kind, record),
        };
        if channel.send(envelope).is_err() {
            debug!("No listeners on {}", record.transport_kind.channel_name());
        }
    }

    pub fn subscribe(&self, kind: TransportKind) -> Option<Subscription> {
        self.hub.channel(kind).map(|channel| Subscription {
            origin: self.origin,
            rx: channel.subscribe(),
        })
    }
}

pub struct Subscription {
    origin: Uuid,
    rx: broadcast::Receiver<Envelope>,
}

impl Subscription {
    /// Next message from another context. `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<BroadcastMessage> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.origin == self.origin => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} cross-context printer notices", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// What a remote notice did to the local registry.
#[derive(Debug)]
pub enum RemoteMerge {
    Ignored,
    MetadataUpdated(ConnectionRecord),
    /// The local record was CONNECTED and is now DISCONNECTED; the handle must be released.
    AlignedDisconnected(ConnectionRecord, LiveHandle),
}

pub async fn apply_remote(registry: &ConnectionRegistry, kind: TransportKind, message: BroadcastMessage) -> RemoteMerge {
    let Some(local) = registry.find_by_address(kind, &message.printer.address).await else {
        return RemoteMerge::Ignored;
    };

    match message.kind {
        BroadcastType::Connected | BroadcastType::Reconnected => {
            if !matches!(local.status, ConnectionStatus::Disconnected | ConnectionStatus::Failed) {
                return RemoteMerge::Ignored;
            }
            registry
                .merge_metadata(
                    &local.id,
                    Some(message.printer.name),
                    message.printer.connected_at,
                    message.printer.last_used,
                )
                .await;
            match registry.get(&local.id).await {
                Some(updated) => RemoteMerge::MetadataUpdated(updated),
                None => RemoteMerge::Ignored,
            }
        }
        BroadcastType::Disconnected => match registry.mark_disconnected(&local.id).await {
            Some(handle) => match registry.get(&local.id).await {
                Some(updated) => RemoteMerge::AlignedDisconnected(updated, handle),
                None => RemoteMerge::Ignored,
            },
            None => RemoteMerge::Ignored,
        },
    }
}
