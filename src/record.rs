use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ble,
    Usb,
    Network,
}

impl TransportKind {
    pub const ALL: [TransportKind; 3] = [TransportKind::Ble, TransportKind::Usb, TransportKind::Network];

    /// Storage namespace for this transport's persisted list.
    pub fn namespace(&self) -> &'static str {
        match self {
            TransportKind::Ble => "bluetooth-printer-connections",
            TransportKind::Usb => "usb-printer-connections",
            TransportKind::Network => "wifi-printer-connections",
        }
    }

    /// Name of the cross-context channel for this transport.
    pub fn channel_name(&self) -> &'static str {
        self.namespace()
    }

    pub fn id_prefix(&self) -> &'static str {
        match self {
            TransportKind::Ble => "ble",
            TransportKind::Usb => "usb",
            TransportKind::Network => "wifi",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Ble => "ble",
            TransportKind::Usb => "usb",
            TransportKind::Network => "network",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Soft failure: the last attempt hit a non-retryable error. Eligible again on the next sweep.
    Failed,
}

/// Identifies the open session owned by a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u64);

/// Point-in-time view of one known printer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub display_name: String,
    pub transport_kind: TransportKind,
    pub transport_address: String,
    pub status: ConnectionStatus,
    /// Present iff `status == Connected`.
    pub live_handle: Option<HandleId>,
    pub retry_count: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub disconnected_since: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub frozen_until: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    pub fn new(id: String, kind: TransportKind, address: String, display_name: String) -> Self {
        Self {
            id,
            display_name,
            transport_kind: kind,
            transport_address: address,
            status: ConnectionStatus::Disconnected,
            live_handle: None,
            retry_count: 0,
            last_used_at: None,
            connected_at: None,
            disconnected_since: None,
            frozen_until: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// Most recent moment the printer was known to be usable.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        [self.disconnected_since, self.last_used_at, self.connected_at]
            .into_iter()
            .flatten()
            .max()
    }

    pub fn to_persisted(&self) -> PersistedRecord {
        PersistedRecord {
            id: self.id.clone(),
            name: self.display_name.clone(),
            transport_kind: self.transport_kind,
            address: self.transport_address.clone(),
            connected_at: self.connected_at,
            last_used: self.last_used_at,
        }
    }

    /// Rebuild a record from storage. Stored status is never trusted.
    pub fn from_persisted(persisted: PersistedRecord) -> Self {
        Self {
            connected_at: persisted.connected_at,
            last_used_at: persisted.last_used,
            ..Self::new(persisted.id, persisted.transport_kind, persisted.address, persisted.name)
        }
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id.clone(),
            name: self.display_name.clone(),
            transport_kind: self.transport_kind,
            address: self.transport_address.clone(),
            status: self.status,
            retry_count: self.retry_count,
            connected_at: self.connected_at,
            last_used: self.last_used_at,
        }
    }
}

/// The persist-safe subset of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    pub id: String,
    pub name: String,
    pub transport_kind: TransportKind,
    pub address: String,
    #[serde(default)]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

/// Record shape carried by status events and the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSummary {
    pub id: String,
    pub name: String,
    pub transport_kind: TransportKind,
    pub address: String,
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Lower-cased, trimmed display name used for fallback matching.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}
