// Common test utilities and fixtures

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use printer_link::broadcast::BroadcastHub;
use printer_link::clock::ManualClock;
use printer_link::config::{LinkConfig, ReconnectPolicy};
use printer_link::errors::{LinkError, Result};
use printer_link::link::{LinkParts, PrinterLink};
use printer_link::notifier::{ChannelSink, StatusEvent};
use printer_link::record::TransportKind;
use printer_link::store::PersistenceStore;
use printer_link::transport::{
    AuthorizedDevices, ChunkPolicy, DiscoveredDevice, TransportAdapter, TransportEvent, TransportSession,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// How a mock session reacts to writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum WriteMode {
    Ok,
    /// The device went away mid-job.
    Disconnected,
    /// The write never completes.
    Hang,
}

/// Mock session recording every write
#[allow(dead_code)]
pub struct MockSession {
    pub address: String,
    pub writes: RwLock<Vec<Vec<u8>>>,
    pub labels: RwLock<Vec<Option<String>>>,
    pub alive: AtomicBool,
    pub closed: AtomicUsize,
    pub mode: RwLock<WriteMode>,
    pub max_chunk: Option<usize>,
}

#[allow(dead_code)]
impl MockSession {
    fn new(address: &str, max_chunk: Option<usize>) -> Self {
        Self {
            address: address.to_string(),
            writes: RwLock::new(Vec::new()),
            labels: RwLock::new(Vec::new()),
            alive: AtomicBool::new(true),
            closed: AtomicUsize::new(0),
            mode: RwLock::new(WriteMode::Ok),
            max_chunk,
        }
    }

    pub async fn set_mode(&self, mode: WriteMode) {
        *self.mode.write().await = mode;
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub async fn written(&self) -> Vec<u8> {
        self.writes.read().await.concat()
    }

    pub async fn write_count(&self) -> usize {
        self.writes.read().await.len()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for MockSession {
    async fn write(&self, chunk: &[u8]) -> Result<()> {
        self.write_labeled(chunk, None).await
    }

    async fn write_labeled(&self, chunk: &[u8], label: Option<&str>) -> Result<()> {
        match *self.mode.read().await {
            WriteMode::Ok => {}
            WriteMode::Disconnected => {
                return Err(LinkError::Disconnected(format!("{} went away", self.address)));
            }
            WriteMode::Hang => std::future::pending::<()>().await,
        }
        self.writes.write().await.push(chunk.to_vec());
        self.labels.write().await.push(label.map(str::to_string));
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && self.closed.load(Ordering::SeqCst) == 0
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn max_chunk(&self) -> Option<usize> {
        self.max_chunk
    }
}

/// Scripted transport for driving the lifecycle without hardware
#[allow(dead_code)]
pub struct MockAdapter {
    pub kind: TransportKind,
    /// `None` reports the transport as unable to list devices.
    pub authorized: RwLock<Option<Vec<DiscoveredDevice>>>,
    pub scan_results: RwLock<Vec<DiscoveredDevice>>,
    pub reachable: AtomicBool,
    /// Per-attempt open results, consumed front first; empty means success.
    pub open_script: RwLock<VecDeque<fn() -> LinkError>>,
    /// Failure returned by every open once the script is exhausted.
    pub open_failure: RwLock<Option<fn() -> LinkError>>,
    pub open_delay: RwLock<Duration>,
    pub chunking: ChunkPolicy,
    pub session_chunk: Option<usize>,
    pub probes: AtomicUsize,
    pub opens: AtomicUsize,
    pub listings: AtomicUsize,
    pub sessions: RwLock<Vec<Arc<MockSession>>>,
    events: broadcast::Sender<TransportEvent>,
}

#[allow(dead_code)]
impl MockAdapter {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self::build(kind))
    }

    pub fn with_chunking(kind: TransportKind, chunking: ChunkPolicy, session_chunk: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            chunking,
            session_chunk,
            ..Self::build(kind)
        })
    }

    fn build(kind: TransportKind) -> Self {
        let authorized = match kind {
            TransportKind::Network => None,
            _ => Some(Vec::new()),
        };
        Self {
            kind,
            authorized: RwLock::new(authorized),
            scan_results: RwLock::new(Vec::new()),
            reachable: AtomicBool::new(true),
            open_script: RwLock::new(VecDeque::new()),
            open_failure: RwLock::new(None),
            open_delay: RwLock::new(Duration::ZERO),
            chunking: ChunkPolicy::unchunked(),
            session_chunk: None,
            probes: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
            sessions: RwLock::new(Vec::new()),
            events: broadcast::channel(16).0,
        }
    }

    pub async fn authorize(&self, device: DiscoveredDevice) {
        if let Some(devices) = self.authorized.write().await.as_mut() {
            devices.push(device);
        }
    }

    pub async fn set_scan_results(&self, devices: Vec<DiscoveredDevice>) {
        *self.scan_results.write().await = devices;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `times` opens with `failure`.
    pub async fn script_open_failures(&self, failure: fn() -> LinkError, times: usize) {
        let mut script = self.open_script.write().await;
        for _ in 0..times {
            script.push_back(failure);
        }
    }

    pub async fn fail_opens_with(&self, failure: fn() -> LinkError) {
        *self.open_failure.write().await = Some(failure);
    }

    pub async fn clear_open_failure(&self) {
        *self.open_failure.write().await = None;
    }

    pub async fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.write().await = delay;
    }

    /// Simulate the transport reporting a disconnect.
    pub fn emit_disconnect(&self, address: &str) {
        let _ = self.events.send(TransportEvent::Disconnected {
            kind: self.kind,
            address: address.to_string(),
        });
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn listing_count(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    pub async fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.read().await.last().cloned()
    }

    pub async fn session_for(&self, address: &str) -> Option<Arc<MockSession>> {
        self.sessions
            .read()
            .await
            .iter()
            .rev()
            .find(|s| s.address == address)
            .cloned()
    }
}

#[async_trait]
impl TransportAdapter for MockAdapter {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn chunking(&self) -> ChunkPolicy {
        self.chunking
    }

    async fn authorized_devices(&self) -> Result<AuthorizedDevices> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Ok(match self.authorized.read().await.clone() {
            None => AuthorizedDevices::Unsupported,
            Some(devices) => AuthorizedDevices::Devices(devices),
        })
    }

    async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.scan_results.read().await.clone())
    }

    async fn probe(&self, _device: &DiscoveredDevice) -> Result<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(self.reachable.load(Ordering::SeqCst))
    }

    async fn open(&self, device: &DiscoveredDevice) -> Result<Arc<dyn TransportSession>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(failure) = self.open_script.write().await.pop_front() {
            return Err(failure());
        }
        if let Some(failure) = *self.open_failure.read().await {
            return Err(failure());
        }

        let session = Arc::new(MockSession::new(&device.address, self.session_chunk));
        self.sessions.write().await.push(session.clone());
        Ok(session)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<TransportEvent>> {
        Some(self.events.subscribe())
    }
}

#[allow(dead_code)]
pub fn timeout_error() -> LinkError {
    LinkError::TransportTimeout("open timed out".to_string())
}

#[allow(dead_code)]
pub fn permission_error() -> LinkError {
    LinkError::PermissionDenied("access denied".to_string())
}

#[allow(dead_code)]
pub fn cancelled_error() -> LinkError {
    LinkError::UserCancelled
}

/// A running link plus the handles tests poke at
#[allow(dead_code)]
pub struct TestLink {
    pub link: PrinterLink,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<ChannelSink>,
    pub events: broadcast::Receiver<StatusEvent>,
    pub store: Arc<PersistenceStore>,
    pub hub: Arc<BroadcastHub>,
}

/// Test link builder
pub struct TestLinkBuilder {
    policy: ReconnectPolicy,
    adapters: Vec<Arc<MockAdapter>>,
    store: Option<Arc<PersistenceStore>>,
    hub: Option<Arc<BroadcastHub>>,
}

#[allow(dead_code)]
impl TestLinkBuilder {
    pub fn new() -> Self {
        Self {
            policy: ReconnectPolicy::immediate(),
            adapters: Vec::new(),
            store: None,
            hub: None,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<MockAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_store(mut self, store: Arc<PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_hub(mut self, hub: Arc<BroadcastHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub async fn build(self) -> TestLink {
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(PersistenceStore::open_in_memory().await.unwrap()),
        };
        let hub = self.hub.unwrap_or_else(BroadcastHub::new);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let sink = Arc::new(ChannelSink::new(256));
        let events = sink.subscribe();

        let config = LinkConfig {
            policy: self.policy,
            ..LinkConfig::default()
        };
        let link = PrinterLink::new(LinkParts {
            config,
            adapters: self
                .adapters
                .into_iter()
                .map(|a| a as Arc<dyn TransportAdapter>)
                .collect(),
            store: store.clone(),
            hub: hub.clone(),
            sink: sink.clone(),
            clock: clock.clone(),
        })
        .await
        .unwrap();

        TestLink {
            link,
            clock,
            sink,
            events,
            store,
            hub,
        }
    }
}

#[allow(dead_code)]
impl TestLink {
    /// Every status event emitted so far.
    pub fn drain_events(&mut self) -> Vec<StatusEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Check that no record holds a handle unless it is CONNECTED, and vice versa.
    pub async fn assert_handle_invariant(&self) {
        for record in self.link.registry().list().await {
            assert_eq!(
                record.live_handle.is_some(),
                record.is_connected(),
                "handle/status invariant broken for {:?}",
                record
            );
        }
    }
}

#[allow(dead_code)]
pub fn ble_device(address: &str, name: &str) -> DiscoveredDevice {
    DiscoveredDevice::new(TransportKind::Ble, address, Some(name.to_string()))
}

#[allow(dead_code)]
pub fn usb_device(address: &str, name: &str) -> DiscoveredDevice {
    DiscoveredDevice::new(TransportKind::Usb, address, Some(name.to_string()))
}
