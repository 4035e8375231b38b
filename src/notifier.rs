//! Status events for whatever UI sits on top of the link.

use crate::record::{ConnectionRecord, RecordSummary};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Connecting,
    Connected,
    Reconnected,
    Disconnected,
    Failed,
    /// Retry ceiling reached; attempts paused until the cooldown elapses.
    Frozen,
    /// No reported device matched a stored record.
    Unmatched,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatus {
    pub connected_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: StatusKind,
    pub record: RecordSummary,
    pub aggregate_status: AggregateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Success,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: Level,
    pub message: String,
}

impl Notification {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }
}

/// The single consumer of status events.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, event: &StatusEvent);
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, event: &StatusEvent) {
        let Some(notification) = &event.notification else {
            info!(
                "Printer {} is now {:?} ({}/{} connected)",
                event.record.name, event.kind, event.aggregate_status.connected_count, event.aggregate_status.total_count
            );
            return;
        };
        match notification.level {
            Level::Success | Level::Info => info!("{}", notification.message),
            Level::Warning => warn!("{}", notification.message),
            Level::Error => error!("{}", notification.message),
        }
    }
}

/// Fans events out to async subscribers, e.g. a UI bridge. Logs as well.
#[derive(Debug)]
pub struct ChannelSink {
    tx: broadcast::Sender<StatusEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for ChannelSink {
    fn deliver(&self, event: &StatusEvent) {
        LogSink.deliver(event);
        // No subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

pub struct StatusNotifier {
    sink: Arc<dyn NotificationSink>,
}

impl StatusNotifier {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, kind: StatusKind, record: &ConnectionRecord, aggregate: (usize, usize), notification: Option<Notification>) {
        self.sink.deliver(&StatusEvent {
            kind,
            record: record.summary(),
            aggregate_status: AggregateStatus {
                connected_count: aggregate.0,
                total_count: aggregate.1,
            },
            notification,
        });
    }
}
