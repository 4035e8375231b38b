use crate::controller::ReconnectionController;
use crate::errors::{LinkError, Result};
use crate::metrics::{LinkEvent, LinkMetrics};
use crate::record::ConnectionStatus;
use crate::transport::ChunkPolicy;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Per-printer result of a fan-out print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrintOutcome {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct PrintDispatcher {
    controller: ReconnectionController,
    metrics: Arc<LinkMetrics>,
    send_timeout: Duration,
}

impl PrintDispatcher {
    pub fn new(controller: ReconnectionController, metrics: Arc<LinkMetrics>) -> Self {
        let send_timeout = controller.policy().send_timeout();
        Self {
            controller,
            metrics,
            send_timeout,
        }
    }

    /// Write `bytes` to one CONNECTED printer. Never reconnects and never retries.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn send_to(&self, id: &str, bytes: &[u8], label: Option<&str>) -> Result<()> {
        let registry = self.controller.registry();
        let (record, handle) = registry.lease(id).await?;
        let adapter = self.controller.adapter(record.transport_kind)?;

        let policy = adapter.chunking();
        let chunking = ChunkPolicy {
            size: handle.session().max_chunk().or(policy.size),
            delay: policy.delay,
        };
        let chunks = chunking.split(bytes);
        debug!(
            "Sending {} bytes to {} in {} chunks",
            bytes.len(),
            record.display_name,
            chunks.len()
        );

        let started = Instant::now();
        let session = handle.session();
        let written = tokio::time::timeout(self.send_timeout, async {
            for (index, chunk) in chunks.iter().enumerate() {
                if index > 0 && !chunking.delay.is_zero() {
                    tokio::time::sleep(chunking.delay).await;
                }
                session.write_labeled(chunk, label).await?;
            }
            Ok::<(), LinkError>(())
        })
        .await;
        let written = match written {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        match written {
            Ok(()) => {
                registry.touch(id).await;
                self.metrics
                    .record(LinkEvent::PrintCompleted {
                        printer_id: id.to_string(),
                        bytes: bytes.len(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
                info!("Printed {} bytes on {}", bytes.len(), record.display_name);
                Ok(())
            }
            Err(e) => {
                warn!("Print to {} failed: {}", record.display_name, e);
                self.metrics
                    .record(LinkEvent::PrintFailed {
                        printer_id: id.to_string(),
                        error: e.code().to_string(),
                    })
                    .await;
                if e.is_liveness_loss() {
                    self.controller.connection_lost(id, Some(handle.id())).await;
                }
                Err(e)
            }
        }
    }

    /// Send to every CONNECTED printer in parallel. Fails only when none are connected.
    pub async fn send_to_all_connected(&self, bytes: &[u8], label: Option<&str>) -> Result<Vec<PrintOutcome>> {
        let targets = self
            .controller
            .registry()
            .list_by_status(ConnectionStatus::Connected)
            .await;
        if targets.is_empty() {
            return Err(LinkError::NoPrintersConnected);
        }

        let sends = targets.iter().map(|record| async move {
            match self.send_to(&record.id, bytes, label).await {
                Ok(()) => PrintOutcome {
                    id: record.id.clone(),
                    success: true,
                    error: None,
                },
                Err(e) => PrintOutcome {
                    id: record.id.clone(),
                    success: false,
                    error: Some(e.code().to_string()),
                },
            }
        });
        let outcomes = join_all(sends).await;

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!("Printed on {}/{} connected printers", succeeded, outcomes.len());
        Ok(outcomes)
    }
}
