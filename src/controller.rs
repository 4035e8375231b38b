//! Reconnection state machine.
//!
//! A sweep walks every DISCONNECTED or FAILED record, resolves it to a device
//! the transport can see, probes it, and only then opens a session. Records
//! are attempted concurrently with a staggered start; one record's failure
//! never affects another's. Only one sweep runs at a time: a sweep requested
//! while one is in flight is dropped.

use crate::broadcast::{apply_remote, BroadcastMessage, BroadcastType, CrossTabBroadcaster, RemoteMerge};
use crate::config::ReconnectPolicy;
use crate::errors::{LinkError, Result};
use crate::metrics::{LinkEvent, LinkMetrics};
use crate::notifier::{Level, Notification, StatusKind, StatusNotifier};
use crate::record::{ConnectionRecord, ConnectionStatus, HandleId, TransportKind};
use crate::registry::{self, ConnectionRegistry};
use crate::retry::ProgressiveBuilder;
use crate::store::PersistenceStore;
use crate::transport::{match_device, AuthorizedDevices, DiscoveredDevice, TransportAdapter, TransportEvent};
use backon::Retryable;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was in flight, or the initial sweep already ran.
    Skipped,
    Completed { attempted: usize, connected: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Connected,
    Unreachable,
    Unmatched,
    Frozen,
    Failed,
    Skipped,
}

/// Everything the controller shares with the rest of the link.
pub struct LinkServices {
    pub registry: Arc<ConnectionRegistry>,
    pub adapters: Vec<Arc<dyn TransportAdapter>>,
    pub store: Arc<PersistenceStore>,
    pub notifier: Arc<StatusNotifier>,
    pub broadcaster: CrossTabBroadcaster,
    pub metrics: Arc<LinkMetrics>,
    pub policy: ReconnectPolicy,
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    adapters: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
    store: Arc<PersistenceStore>,
    notifier: Arc<StatusNotifier>,
    broadcaster: CrossTabBroadcaster,
    metrics: Arc<LinkMetrics>,
    policy: ReconnectPolicy,

    sweeping: AtomicBool,
    /// Gates were reset while a sweep was in flight; that sweep runs one more pass.
    rerun: AtomicBool,
    /// Set by the first sweep of this process life; gates the initial reconnect.
    attempted: AtomicBool,
    sweeps_started: AtomicU64,

    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the sweep flag when the sweep that set it finishes or is dropped.
struct SweepGate<'a> {
    sweeping: &'a AtomicBool,
}

impl Drop for SweepGate<'_> {
    fn drop(&mut self) {
        self.sweeping.store(false, Ordering::SeqCst);
    }
}

/// Puts a record left in CONNECTING back to DISCONNECTED when its attempt is dropped before settling.
struct AttemptGuard {
    registry: Arc<ConnectionRegistry>,
    id: String,
    epoch: u64,
    settled: bool,
}

impl AttemptGuard {
    fn settle(&mut self) {
        self.settled = true;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.settled || self.registry.abandon_attempt(&self.id, self.epoch) {
            return;
        }
        let registry = self.registry.clone();
        let id = std::mem::take(&mut self.id);
        let epoch = self.epoch;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.finish_attempt(&id, epoch, ConnectionStatus::Disconnected).await;
                });
            }
            Err(_) => warn!("Connection attempt for {} dropped outside the runtime", id),
        }
    }
}

#[derive(Clone)]
pub struct ReconnectionController {
    inner: Arc<Inner>,
}

impl ReconnectionController {
    pub fn new(services: LinkServices) -> Self {
        let adapters = services
            .adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();

        Self {
            inner: Arc::new(Inner {
                registry: services.registry,
                adapters,
                store: services.store,
                notifier: services.notifier,
                broadcaster: services.broadcaster,
                metrics: services.metrics,
                policy: services.policy,
                sweeping: AtomicBool::new(false),
                rerun: AtomicBool::new(false),
                attempted: AtomicBool::new(false),
                sweeps_started: AtomicU64::new(0),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    pub fn adapter(&self, kind: TransportKind) -> Result<Arc<dyn TransportAdapter>> {
        self.inner
            .adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| LinkError::TransportUnavailable(format!("{} transport is not enabled", kind)))
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner.sweeping.load(Ordering::SeqCst)
    }

    /// Number of sweeps that actually ran (skipped requests excluded).
    pub fn sweeps_started(&self) -> u64 {
        self.inner.sweeps_started.load(Ordering::SeqCst)
    }

    /// Re-arm the "already attempted" gate. A sweep in flight keeps running and makes one more pass.
    pub fn reset_gates(&self) {
        debug!("Resetting reconnection gates");
        self.inner.attempted.store(false, Ordering::SeqCst);
        if self.is_sweeping() {
            self.inner.rerun.store(true, Ordering::SeqCst);
        }
    }

    /// Reconnect every DISCONNECTED or FAILED record. Only one sweep runs at a time.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> SweepOutcome {
        let inner = &*self.inner;
        if inner
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Reconnection sweep already in progress, skipping");
            return SweepOutcome::Skipped;
        }
        let _gate = SweepGate {
            sweeping: &inner.sweeping,
        };
        inner.rerun.store(false, Ordering::SeqCst);
        inner.attempted.store(true, Ordering::SeqCst);
        inner.sweeps_started.fetch_add(1, Ordering::SeqCst);

        let (mut attempted, mut connected) = (0, 0);
        loop {
            let (tried, restored) = self.sweep_pass().await;
            attempted += tried;
            connected += restored;
            if !inner.rerun.swap(false, Ordering::SeqCst) || inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            debug!("Gates were reset during the sweep, running another pass");
        }
        SweepOutcome::Completed { attempted, connected }
    }

    /// One pass over the records; returns `(attempted, connected)`.
    async fn sweep_pass(&self) -> (usize, usize) {
        let inner = &*self.inner;
        let candidates: Vec<ConnectionRecord> = inner
            .registry
            .list()
            .await
            .into_iter()
            .filter(|r| matches!(r.status, ConnectionStatus::Disconnected | ConnectionStatus::Failed))
            .collect();

        if candidates.is_empty() {
            return (0, 0);
        }
        info!("Reconnection sweep: {} printers to restore", candidates.len());

        let mut listings: HashMap<TransportKind, Option<AuthorizedDevices>> = HashMap::new();
        for record in &candidates {
            let kind = record.transport_kind;
            if listings.contains_key(&kind) {
                continue;
            }
            let listing = match self.adapter(kind) {
                Ok(adapter) => match adapter.authorized_devices().await {
                    Ok(listing) => Some(listing),
                    Err(e) => {
                        warn!("Could not list {} devices: {}", kind, e);
                        None
                    }
                },
                Err(e) => {
                    debug!("Skipping {} records: {}", kind, e);
                    None
                }
            };
            listings.insert(kind, listing);
        }

        let stagger = inner.policy.stagger();
        let attempts = candidates.iter().enumerate().map(|(index, record)| {
            let listing = listings.get(&record.transport_kind).cloned().flatten();
            async move {
                if index > 0 && !stagger.is_zero() {
                    tokio::time::sleep(stagger * index as u32).await;
                }
                self.restore_record(record, listing.as_ref()).await
            }
        });
        let outcomes = join_all(attempts).await;

        let connected = outcomes.iter().filter(|o| **o == RecordOutcome::Connected).count();
        info!(
            "Reconnection sweep finished: {}/{} restored",
            connected,
            candidates.len()
        );
        (candidates.len(), connected)
    }

    async fn restore_record(&self, record: &ConnectionRecord, listing: Option<&AuthorizedDevices>) -> RecordOutcome {
        if self.inner.registry.check_frozen(&record.id).await {
            debug!("{} is cooling down after repeated failures", record.display_name);
            return RecordOutcome::Frozen;
        }

        let device = match listing {
            None => return RecordOutcome::Unreachable,
            Some(AuthorizedDevices::Unsupported) => DiscoveredDevice::from_record(record),
            Some(AuthorizedDevices::Devices(devices)) => match match_device(record, devices) {
                Some(device) => device.clone(),
                None => {
                    warn!(
                        "No {} device matched stored printer {} ({}), leaving it disconnected",
                        record.transport_kind, record.display_name, record.transport_address
                    );
                    self.emit(
                        StatusKind::Unmatched,
                        record,
                        Some(Notification::new(
                            Level::Warning,
                            format!("Could not find {}. Check if it's powered on and in range.", record.display_name),
                        )),
                    )
                    .await;
                    return RecordOutcome::Unmatched;
                }
            },
        };

        match self.connect_device(&record.id, &device).await {
            Ok(_) => RecordOutcome::Connected,
            Err(LinkError::Superseded(_)) | Err(LinkError::InvalidTransition(_)) => RecordOutcome::Skipped,
            Err(LinkError::RetryCeiling(_)) => RecordOutcome::Frozen,
            Err(e) if e.is_retryable() => RecordOutcome::Unreachable,
            Err(_) => RecordOutcome::Failed,
        }
    }

    /// Probe, then open with bounded retries, then commit. The record is CONNECTED only on success.
    #[instrument(skip(self, device), fields(kind = %device.kind, address = %device.address))]
    pub async fn connect_device(&self, id: &str, device: &DiscoveredDevice) -> Result<ConnectionRecord> {
        let inner = &*self.inner;
        let registry = &inner.registry;
        let adapter = self.adapter(device.kind)?;
        let record = registry
            .get(id)
            .await
            .ok_or_else(|| LinkError::PrinterNotFound(id.to_string()))?;
        if record.is_connected() {
            return Ok(record);
        }

        match timeout(inner.policy.probe_timeout(), adapter.probe(device)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                debug!("{} did not answer the liveness probe", record.display_name);
                return Err(LinkError::OutOfRange(format!("{} is not reachable", record.display_name)));
            }
            Ok(Err(e)) => {
                debug!("Liveness probe for {} failed: {}", record.display_name, e);
                if e.requires_user_action() {
                    self.emit(StatusKind::Failed, &record, Some(Notification::new(Level::Error, e.user_message())))
                        .await;
                }
                return Err(e);
            }
            Err(elapsed) => return Err(elapsed.into()),
        }

        let epoch = registry.begin_attempt(id).await?;
        let mut guard = AttemptGuard {
            registry: registry.clone(),
            id: id.to_string(),
            epoch,
            settled: false,
        };
        self.emit_for(id, StatusKind::Connecting, None).await;

        let started = Instant::now();
        let adapter = &adapter;
        let name = record.display_name.as_str();
        let ceiling = inner.policy.retry_ceiling;
        let cooldown = inner.policy.cooldown();
        let open_timeout = inner.policy.open_timeout(device.kind);

        let attempt = move || async move {
            if registry.check_frozen(id).await {
                return Err(LinkError::RetryCeiling(name.to_string()));
            }
            let opened = match timeout(open_timeout, adapter.open(device)).await {
                Ok(opened) => opened,
                Err(elapsed) => Err(elapsed.into()),
            };
            match opened {
                Err(e) if e.is_retryable() => {
                    let count = registry.record_retry(id).await;
                    if count >= ceiling {
                        warn!("{} failed {} times, pausing attempts for {:?}", name, count, cooldown);
                        registry.freeze(id, cooldown).await;
                        Err(LinkError::RetryCeiling(name.to_string()))
                    } else {
                        Err(e)
                    }
                }
                other => other,
            }
        };

        let opened = attempt
            .retry(ProgressiveBuilder::from_policy(&inner.policy))
            .when(|e: &LinkError| e.is_retryable())
            .notify(|e: &LinkError, delay: Duration| {
                debug!("Opening {} failed ({}), retrying in {:?}", name, e, delay);
            })
            .await;

        match opened {
            Ok(session) => match registry.commit_connected(id, epoch, &device.address, session).await {
                Ok(_) => {
                    guard.settle();
                    if let Some(reported) = device.name.as_ref().filter(|n| **n != record.display_name) {
                        registry.merge_metadata(id, Some(reported.clone()), None, None).await;
                    }
                    let connected = registry
                        .get(id)
                        .await
                        .ok_or_else(|| LinkError::PrinterNotFound(id.to_string()))?;

                    inner
                        .metrics
                        .record(LinkEvent::ConnectionEstablished {
                            printer_id: id.to_string(),
                            kind: device.kind,
                            duration_ms: started.elapsed().as_millis() as u64,
                        })
                        .await;

                    let (event, status, message) = if record.connected_at.is_some() {
                        (
                            BroadcastType::Reconnected,
                            StatusKind::Reconnected,
                            format!("{} reconnected successfully", connected.display_name),
                        )
                    } else {
                        (
                            BroadcastType::Connected,
                            StatusKind::Connected,
                            format!("Connected to {}", connected.display_name),
                        )
                    };
                    info!("{}", message);
                    inner.broadcaster.publish(event, &connected);
                    self.emit(status, &connected, Some(Notification::new(Level::Success, message))).await;
                    self.persist().await;
                    Ok(connected)
                }
                Err(session) => {
                    guard.settle();
                    if let Err(e) = session.close().await {
                        debug!("Closing discarded session for {} failed: {}", id, e);
                    }
                    Err(LinkError::Superseded(id.to_string()))
                }
            },
            Err(e) => {
                let status = match &e {
                    e if e.is_retryable() => ConnectionStatus::Disconnected,
                    LinkError::RetryCeiling(_) | LinkError::UserCancelled => ConnectionStatus::Disconnected,
                    _ => ConnectionStatus::Failed,
                };
                let finished = registry.finish_attempt(id, epoch, status).await;
                guard.settle();
                if !finished {
                    return Err(LinkError::Superseded(id.to_string()));
                }
                self.report_failure(id, &e, status).await;
                Err(e)
            }
        }
    }

    async fn report_failure(&self, id: &str, error: &LinkError, status: ConnectionStatus) {
        let Some(record) = self.inner.registry.get(id).await else {
            return;
        };

        if matches!(error, LinkError::UserCancelled) {
            info!("Connection to {} cancelled by user", record.display_name);
            self.emit(StatusKind::Disconnected, &record, None).await;
            return;
        }

        self.inner
            .metrics
            .record(LinkEvent::ConnectionFailed {
                printer_id: id.to_string(),
                kind: record.transport_kind,
                error: error.code().to_string(),
            })
            .await;

        let (kind, notification) = match error {
            LinkError::RetryCeiling(_) => (
                StatusKind::Frozen,
                Notification::new(
                    Level::Warning,
                    format!(
                        "Could not reconnect to {} after {} attempts. Retrying in {} minutes.",
                        record.display_name,
                        record.retry_count,
                        self.inner.policy.cooldown().as_secs() / 60
                    ),
                ),
            ),
            _ if status == ConnectionStatus::Failed => {
                (StatusKind::Failed, Notification::new(Level::Error, error.user_message()))
            }
            _ => (
                StatusKind::Disconnected,
                Notification::new(
                    Level::Warning,
                    format!(
                        "Could not reconnect to {}. Check if it's powered on and in range.",
                        record.display_name
                    ),
                ),
            ),
        };
        self.emit(kind, &record, Some(notification)).await;
    }

    /// Transition a CONNECTED record to DISCONNECTED and release its handle, without sweeping.
    ///
    /// With `handle`, only acts if the record still holds that handle.
    async fn mark_lost(&self, id: &str, handle: Option<HandleId>) -> bool {
        let registry = &self.inner.registry;
        let released = match handle {
            Some(handle) => registry.mark_disconnected_if(id, handle).await,
            None => registry.mark_disconnected(id).await,
        };
        let Some(released) = released else {
            return false;
        };
        registry::release(released).await;

        if let Some(record) = registry.get(id).await {
            self.inner
                .metrics
                .record(LinkEvent::ConnectionLost {
                    printer_id: id.to_string(),
                    kind: record.transport_kind,
                })
                .await;
            self.inner.broadcaster.publish(BroadcastType::Disconnected, &record);
            let message = format!("{} disconnected. Attempting to reconnect...", record.display_name);
            self.emit(StatusKind::Disconnected, &record, Some(Notification::new(Level::Warning, message)))
                .await;
        }
        true
    }

    /// Observed loss of liveness. Repeated reports for a record that is no longer CONNECTED do nothing.
    pub async fn connection_lost(&self, id: &str, handle: Option<HandleId>) -> bool {
        let lost = self.mark_lost(id, handle).await;
        if lost {
            self.request_sweep();
        }
        lost
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Disconnected { kind, address } => {
                match self.inner.registry.session_at(kind, &address).await {
                    Some((id, handle)) => {
                        self.connection_lost(&id, Some(handle)).await;
                    }
                    None => debug!("Disconnect reported for {} device {} with no live session", kind, address),
                }
            }
        }
    }

    /// Start a sweep in the background unless one is already running.
    pub fn request_sweep(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) || self.is_sweeping() {
            return;
        }
        let controller = self.clone();
        self.track(tokio::spawn(async move {
            controller.sweep().await;
        }));
    }

    /// Probe every CONNECTED session; returns how many were found dead.
    pub async fn check_liveness(&self) -> usize {
        let lost = self.mark_dead_sessions().await;
        if lost > 0 {
            self.request_sweep();
        }
        lost
    }

    async fn mark_dead_sessions(&self) -> usize {
        let probe_timeout = self.inner.policy.probe_timeout();
        let mut lost = 0;
        for (record, handle) in self.inner.registry.connected_handles().await {
            let alive = timeout(probe_timeout, handle.session().is_alive())
                .await
                .unwrap_or(false);
            if !alive {
                debug!("Liveness check failed for {}", record.display_name);
                if self.mark_lost(&record.id, Some(handle.id())).await {
                    lost += 1;
                }
            }
        }
        lost
    }

    /// First sweep after start. Runs at most once per process life unless the gates are reset.
    pub async fn initial_reconnect(&self) -> SweepOutcome {
        if self.inner.attempted.load(Ordering::SeqCst) {
            return SweepOutcome::Skipped;
        }
        tokio::time::sleep(self.inner.policy.initial_sweep_delay()).await;
        self.sweep().await
    }

    /// The host came back to the foreground: re-arm, re-verify, and sweep.
    pub async fn on_foreground(&self) -> SweepOutcome {
        info!("Back in foreground, re-verifying printers");
        self.reset_gates();
        tokio::time::sleep(self.inner.policy.foreground_sweep_delay()).await;
        self.mark_dead_sessions().await;
        self.sweep().await
    }

    /// Remove records unreachable for longer than `threshold`, after one final probe each.
    pub async fn prune_unreachable(&self, threshold: Duration) -> Vec<ConnectionRecord> {
        let registry = &self.inner.registry;
        let now = registry.clock().now();
        let Some(cutoff) = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
        else {
            return Vec::new();
        };

        let candidates: Vec<ConnectionRecord> = registry
            .list()
            .await
            .into_iter()
            .filter(|r| matches!(r.status, ConnectionStatus::Disconnected | ConnectionStatus::Failed))
            .filter(|r| r.last_seen().map(|seen| seen <= cutoff).unwrap_or(false))
            .collect();

        let mut removed = Vec::new();
        for record in candidates {
            let Ok(adapter) = self.adapter(record.transport_kind) else {
                continue;
            };
            let device = DiscoveredDevice::from_record(&record);
            let reachable = matches!(
                timeout(self.inner.policy.probe_timeout(), adapter.probe(&device)).await,
                Ok(Ok(true))
            );
            if reachable {
                info!("{} answered the final probe, keeping it", record.display_name);
                if let Err(e) = self.connect_device(&record.id, &device).await {
                    debug!("Reconnect after final probe failed for {}: {}", record.display_name, e);
                }
                continue;
            }

            let id = record.id.clone();
            let pruned = registry
                .remove_where(|r| {
                    r.id == id && matches!(r.status, ConnectionStatus::Disconnected | ConnectionStatus::Failed)
                })
                .await;
            for gone in pruned {
                info!(
                    "Removed unreachable printer {} (last seen {:?})",
                    gone.display_name,
                    gone.last_seen()
                );
                self.emit(StatusKind::Removed, &gone, None).await;
                removed.push(gone);
            }
        }

        if !removed.is_empty() {
            self.persist().await;
        }
        removed
    }

    async fn apply_remote_notice(&self, kind: TransportKind, message: BroadcastMessage) {
        match apply_remote(&self.inner.registry, kind, message).await {
            RemoteMerge::Ignored => {}
            RemoteMerge::MetadataUpdated(record) => {
                debug!("Merged remote notice for {} (still needs local verification)", record.display_name);
            }
            RemoteMerge::AlignedDisconnected(record, handle) => {
                registry::release(handle).await;
                let message = format!("{} was disconnected in another window", record.display_name);
                self.emit(StatusKind::Disconnected, &record, Some(Notification::new(Level::Info, message)))
                    .await;
            }
        }
    }

    pub async fn persist(&self) {
        let records = self.inner.registry.list().await;
        if let Err(e) = self.inner.store.save(&records).await {
            warn!("Failed to persist printer list: {}", e);
        }
    }

    async fn has_pending(&self) -> bool {
        self.inner
            .registry
            .list()
            .await
            .iter()
            .any(|r| matches!(r.status, ConnectionStatus::Disconnected | ConnectionStatus::Failed))
    }

    async fn emit(&self, kind: StatusKind, record: &ConnectionRecord, notification: Option<Notification>) {
        let aggregate = self.inner.registry.aggregate().await;
        self.inner.notifier.emit(kind, record, aggregate, notification);
    }

    async fn emit_for(&self, id: &str, kind: StatusKind, notification: Option<Notification>) {
        if let Some(record) = self.inner.registry.get(id).await {
            self.emit(kind, &record, notification).await;
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Spawn the periodic loops and listeners. Calling it again while running does nothing.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        let policy = &self.inner.policy;

        for adapter in self.inner.adapters.values() {
            if let Some(mut events) = adapter.subscribe() {
                let controller = self.clone();
                self.track(tokio::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => controller.handle_transport_event(event).await,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Missed {} transport events", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }));
            }
        }

        for kind in self.inner.adapters.keys().copied() {
            if let Some(mut notices) = self.inner.broadcaster.subscribe(kind) {
                let controller = self.clone();
                self.track(tokio::spawn(async move {
                    while let Some(message) = notices.recv().await {
                        controller.apply_remote_notice(kind, message).await;
                    }
                }));
            }
        }

        let controller = self.clone();
        let every = policy.sweep_interval();
        self.track(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if controller.has_pending().await {
                    controller.sweep().await;
                }
            }
        }));

        let controller = self.clone();
        let every = policy.liveness_interval();
        self.track(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                controller.check_liveness().await;
            }
        }));

        let controller = self.clone();
        self.track(tokio::spawn(async move {
            controller.initial_reconnect().await;
        }));

        info!(
            "Reconnection controller started (sweep every {:?}, liveness every {:?})",
            policy.sweep_interval(),
            policy.liveness_interval()
        );
    }

    /// Abort every loop and in-flight background sweep.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        debug!("Reconnection controller stopped");
    }
}
