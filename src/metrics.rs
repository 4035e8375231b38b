use crate::record::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tracing::debug;

/// Samples kept for the rolling averages
const MAX_SAMPLES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkEvent {
    ConnectionEstablished {
        printer_id: String,
        kind: TransportKind,
        duration_ms: u64,
    },
    ConnectionFailed {
        printer_id: String,
        kind: TransportKind,
        error: String,
    },
    ConnectionLost {
        printer_id: String,
        kind: TransportKind,
    },
    PrintCompleted {
        printer_id: String,
        bytes: usize,
        duration_ms: u64,
    },
    PrintFailed {
        printer_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub failed_connections: u64,
    pub connections_lost: u64,
    pub avg_connection_time_ms: u64,
    pub total_prints: u64,
    pub failed_prints: u64,
    pub avg_print_time_ms: u64,
    pub bytes_printed: u64,
    pub error_count: u64,
}

#[derive(Debug, Default)]
struct Samples {
    connection: VecDeque<u64>,
    print: VecDeque<u64>,
}

fn push_sample(samples: &mut VecDeque<u64>, value: u64) -> u64 {
    samples.push_back(value);
    if samples.len() > MAX_SAMPLES {
        samples.pop_front();
    }
    samples.iter().sum::<u64>() / samples.len() as u64
}

/// Connection and print counters for the whole link.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    snapshot: RwLock<MetricsSnapshot>,
    samples: RwLock<Samples>,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, event: LinkEvent) {
        let mut metrics = self.snapshot.write().await;

        match &event {
            LinkEvent::ConnectionEstablished { duration_ms, .. } => {
                metrics.total_connections += 1;
                let mut samples = self.samples.write().await;
                metrics.avg_connection_time_ms = push_sample(&mut samples.connection, *duration_ms);
            }
            LinkEvent::ConnectionFailed { .. } => {
                metrics.failed_connections += 1;
                metrics.error_count += 1;
            }
            LinkEvent::ConnectionLost { .. } => {
                metrics.connections_lost += 1;
            }
            LinkEvent::PrintCompleted { bytes, duration_ms, .. } => {
                metrics.total_prints += 1;
                metrics.bytes_printed += *bytes as u64;
                let mut samples = self.samples.write().await;
                metrics.avg_print_time_ms = push_sample(&mut samples.print, *duration_ms);
            }
            LinkEvent::PrintFailed { .. } => {
                metrics.failed_prints += 1;
                metrics.error_count += 1;
            }
        }

        debug!("Metrics event: {:?}", event);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn reset(&self) {
        *self.snapshot.write().await = MetricsSnapshot::default();
        *self.samples.write().await = Samples::default();
    }
}
