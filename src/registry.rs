//! In-memory source of truth for what is believed to be connected.
//!
//! Every mutation of status and handle goes through one lock-guarded method,
//! so no other component can observe a record whose `live_handle` disagrees
//! with its `status`.

use crate::clock::{self, Clock};
use crate::errors::{LinkError, Result};
use crate::record::{ConnectionRecord, ConnectionStatus, HandleId, PersistedRecord, TransportKind};
use crate::transport::{LiveHandle, TransportSession};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mergeable attributes for [`ConnectionRegistry::upsert`].
#[derive(Debug, Clone, Default)]
pub struct RecordAttrs {
    pub display_name: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl RecordAttrs {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            display_name: Some(name.into()),
            ..Self::default()
        }
    }
}

struct Entry {
    record: ConnectionRecord,
    handle: Option<LiveHandle>,
    /// Address the live session was opened at. Differs from the stored address after a name-fallback match.
    session_address: Option<String>,
    /// Bumped on every status change; stale attempts compare against it.
    epoch: u64,
}

impl Entry {
    fn matches(&self, kind: TransportKind, address: &str) -> bool {
        self.record.transport_kind == kind && self.record.transport_address == address
    }

    /// The single place status and handle change together.
    fn transition(&mut self, status: ConnectionStatus, handle: Option<LiveHandle>, epoch: u64, now: DateTime<Utc>) -> Option<LiveHandle> {
        let was_connected = self.record.status == ConnectionStatus::Connected;
        let displaced = self.handle.take();

        self.record.live_handle = handle.as_ref().map(LiveHandle::id);
        if handle.is_none() {
            self.session_address = None;
        }
        self.handle = handle;
        self.record.status = status;
        self.epoch = epoch;

        if status == ConnectionStatus::Connected {
            self.record.retry_count = 0;
            self.record.frozen_until = None;
            self.record.disconnected_since = None;
            self.record.connected_at = Some(now);
            self.record.last_used_at = Some(now);
        } else if was_connected {
            self.record.disconnected_since = Some(now);
        }

        displaced
    }
}

pub struct ConnectionRegistry {
    entries: Mutex<Vec<Entry>>,
    next_epoch: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl ConnectionRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_epoch: AtomicU64::new(1),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn bump(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::SeqCst)
    }

    fn generate_id(kind: TransportKind) -> String {
        format!("{}_{}", kind.id_prefix(), Uuid::new_v4().simple())
    }

    /// Find by `(kind, address)` and merge, or create a new DISCONNECTED record.
    pub async fn upsert(&self, kind: TransportKind, address: &str, attrs: RecordAttrs) -> String {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.iter_mut().find(|e| e.matches(kind, address)) {
            if let Some(name) = attrs.display_name.filter(|n| !n.trim().is_empty()) {
                if entry.record.display_name != name {
                    debug!("Renaming printer {}: {} -> {}", entry.record.id, entry.record.display_name, name);
                    entry.record.display_name = name;
                }
            }
            if attrs.connected_at.is_some() {
                entry.record.connected_at = attrs.connected_at;
            }
            if attrs.last_used_at.is_some() {
                entry.record.last_used_at = attrs.last_used_at;
            }
            return entry.record.id.clone();
        }

        let id = Self::generate_id(kind);
        let name = attrs
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{} printer {}", kind, address));
        let mut record = ConnectionRecord::new(id.clone(), kind, address.to_string(), name);
        record.connected_at = attrs.connected_at;
        record.last_used_at = attrs.last_used_at.or_else(|| Some(self.clock.now()));

        info!("Registered new {} printer {} ({}) at {}", kind, record.display_name, id, address);
        entries.push(Entry {
            record,
            handle: None,
            session_address: None,
            epoch: self.bump(),
        });
        id
    }

    /// Load persisted records. Duplicates by `(kind, address)` merge into the first one seen.
    pub async fn restore(&self, persisted: Vec<PersistedRecord>) -> usize {
        let mut entries = self.entries.lock().await;
        let mut restored = 0;

        for stored in persisted {
            if let Some(existing) = entries.iter_mut().find(|e| e.matches(stored.transport_kind, &stored.address)) {
                debug!("Merging duplicate stored printer {} into {}", stored.id, existing.record.id);
                if existing.record.last_used_at < stored.last_used {
                    existing.record.last_used_at = stored.last_used;
                }
                continue;
            }

            let mut record = ConnectionRecord::from_persisted(stored);
            if record.id.is_empty() || entries.iter().any(|e| e.record.id == record.id) {
                record.id = Self::generate_id(record.transport_kind);
            }
            entries.push(Entry {
                record,
                handle: None,
                session_address: None,
                epoch: self.bump(),
            });
            restored += 1;
        }

        restored
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionRecord> {
        let entries = self.entries.lock().await;
        entries.iter().find(|e| e.record.id == id).map(|e| e.record.clone())
    }

    pub async fn find_by_address(&self, kind: TransportKind, address: &str) -> Option<ConnectionRecord> {
        let entries = self.entries.lock().await;
        entries.iter().find(|e| e.matches(kind, address)).map(|e| e.record.clone())
    }

    pub async fn list(&self) -> Vec<ConnectionRecord> {
        let entries = self.entries.lock().await;
        entries.iter().map(|e| e.record.clone()).collect()
    }

    pub async fn list_by_status(&self, status: ConnectionStatus) -> Vec<ConnectionRecord> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|e| e.record.status == status)
            .map(|e| e.record.clone())
            .collect()
    }

    /// `(connected, total)`.
    pub async fn aggregate(&self) -> (usize, usize) {
        let entries = self.entries.lock().await;
        let connected = entries.iter().filter(|e| e.record.is_connected()).count();
        (connected, entries.len())
    }

    /// Set status (and handle) as one update. CONNECTED requires a session; any other status forbids one.
    ///
    /// Returns the displaced handle, which the caller must release.
    pub async fn set_status(
        &self,
        id: &str,
        status: ConnectionStatus,
        session: Option<Arc<dyn TransportSession>>,
    ) -> Result<Option<LiveHandle>> {
        match (status, session.is_some()) {
            (ConnectionStatus::Connected, false) => {
                return Err(LinkError::InvalidTransition(format!("{} cannot be CONNECTED without a handle", id)))
            }
            (s, true) if s != ConnectionStatus::Connected => {
                return Err(LinkError::InvalidTransition(format!("{} cannot hold a handle while {:?}", id, s)))
            }
            _ => {}
        }

        let now = self.clock.now();
        let epoch = self.bump();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.record.id == id)
            .ok_or_else(|| LinkError::PrinterNotFound(id.to_string()))?;

        let handle = session.map(|s| LiveHandle::new(HandleId(epoch), s));
        let displaced = entry.transition(status, handle, epoch, now);
        if entry.handle.is_some() {
            entry.session_address = Some(entry.record.transport_address.clone());
        }
        Ok(displaced)
    }

    /// Move a record to CONNECTING for an attempt and return the attempt's epoch.
    pub async fn begin_attempt(&self, id: &str) -> Result<u64> {
        let now = self.clock.now();
        let epoch = self.bump();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.record.id == id)
            .ok_or_else(|| LinkError::PrinterNotFound(id.to_string()))?;

        if entry.record.status == ConnectionStatus::Connected {
            return Err(LinkError::InvalidTransition(format!("{} is already connected", id)));
        }
        if entry.record.status == ConnectionStatus::Connecting {
            return Err(LinkError::InvalidTransition(format!("{} already has an attempt in flight", id)));
        }
        entry.transition(ConnectionStatus::Connecting, None, epoch, now);
        Ok(epoch)
    }

    /// Finish an attempt successfully with a session opened at `address`.
    ///
    /// A stale epoch hands the session back so the caller can close it.
    pub async fn commit_connected(
        &self,
        id: &str,
        epoch: u64,
        address: &str,
        session: Arc<dyn TransportSession>,
    ) -> std::result::Result<LiveHandle, Arc<dyn TransportSession>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) else {
            return Err(session);
        };
        if entry.epoch != epoch || entry.record.status != ConnectionStatus::Connecting {
            warn!("Discarding late connection for {} (epoch {} is stale)", id, epoch);
            return Err(session);
        }

        let new_epoch = self.bump();
        let handle = LiveHandle::new(HandleId(new_epoch), session);
        entry.transition(ConnectionStatus::Connected, Some(handle.clone()), new_epoch, now);
        entry.session_address = Some(address.to_string());
        Ok(handle)
    }

    /// Finish an attempt without a connection. Ignored when the attempt is stale.
    pub async fn finish_attempt(&self, id: &str, epoch: u64, status: ConnectionStatus) -> bool {
        debug_assert!(status != ConnectionStatus::Connected);
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.record.id == id) {
            Some(entry) if entry.epoch == epoch => {
                let new_epoch = self.bump();
                entry.transition(status, None, new_epoch, now);
                true
            }
            _ => false,
        }
    }

    /// Non-blocking [`finish_attempt`](Self::finish_attempt) to DISCONNECTED for use in `Drop`.
    ///
    /// Returns `false` only when the lock is contended and nothing was checked.
    pub fn abandon_attempt(&self, id: &str, epoch: u64) -> bool {
        let Ok(mut entries) = self.entries.try_lock() else {
            return false;
        };
        if let Some(entry) = entries.iter_mut().find(|e| e.record.id == id && e.epoch == epoch) {
            debug!("Connection attempt for {} was dropped, marking it disconnected", entry.record.display_name);
            let new_epoch = self.bump();
            entry.transition(ConnectionStatus::Disconnected, None, new_epoch, self.clock.now());
        }
        true
    }

    /// Observed loss of liveness. Returns the released handle only if the record was CONNECTED.
    pub async fn mark_disconnected(&self, id: &str) -> Option<LiveHandle> {
        self.disconnect_where(id, |_| true).await
    }

    /// Only disconnects if the record still holds the given handle.
    pub async fn mark_disconnected_if(&self, id: &str, handle: HandleId) -> Option<LiveHandle> {
        self.disconnect_where(id, |entry| entry.record.live_handle == Some(handle)).await
    }

    async fn disconnect_where<F>(&self, id: &str, check: F) -> Option<LiveHandle>
    where
        F: FnOnce(&Entry) -> bool,
    {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let entry = entries.iter_mut().find(|e| e.record.id == id)?;
        if entry.record.status != ConnectionStatus::Connected || !check(&*entry) {
            return None;
        }
        let epoch = self.bump();
        entry.transition(ConnectionStatus::Disconnected, None, epoch, now)
    }

    /// The CONNECTED record whose live session was opened at `(kind, address)`, with that session's handle id.
    pub async fn session_at(&self, kind: TransportKind, address: &str) -> Option<(String, HandleId)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|e| e.record.transport_kind == kind)
            .find(|e| e.session_address.as_deref() == Some(address))
            .and_then(|e| e.handle.as_ref().map(|h| (e.record.id.clone(), h.id())))
    }

    /// Count one failed open attempt; returns the new count.
    pub async fn record_retry(&self, id: &str) -> u32 {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| e.record.id == id) {
            Some(entry) => {
                entry.record.retry_count += 1;
                entry.record.retry_count
            }
            None => 0,
        }
    }

    pub async fn freeze(&self, id: &str, cooldown: Duration) {
        let until = clock::add(self.clock.now(), cooldown);
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) {
            entry.record.frozen_until = Some(until);
        }
    }

    /// Whether attempts for this record are currently frozen. An elapsed cooldown resets the retry count.
    pub async fn check_frozen(&self, id: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) else {
            return false;
        };
        match entry.record.frozen_until {
            Some(until) if now < until => true,
            Some(_) => {
                info!("Cooldown elapsed for {}, resetting retry count", entry.record.display_name);
                entry.record.frozen_until = None;
                entry.record.retry_count = 0;
                false
            }
            None => false,
        }
    }

    pub async fn touch(&self, id: &str) {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) {
            entry.record.last_used_at = Some(now);
        }
    }

    /// Metadata-only merge; never changes status or handle.
    pub async fn merge_metadata(&self, id: &str, name: Option<String>, connected_at: Option<DateTime<Utc>>, last_used: Option<DateTime<Utc>>) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) {
            if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
                entry.record.display_name = name;
            }
            if connected_at.is_some() {
                entry.record.connected_at = connected_at;
            }
            if last_used.is_some() {
                entry.record.last_used_at = last_used;
            }
        }
    }

    /// Borrow the session of a CONNECTED record for a write.
    pub async fn lease(&self, id: &str) -> Result<(ConnectionRecord, LiveHandle)> {
        let entries = self.entries.lock().await;
        let entry = entries
            .iter()
            .find(|e| e.record.id == id)
            .ok_or_else(|| LinkError::PrinterNotFound(id.to_string()))?;
        match (&entry.record.status, &entry.handle) {
            (ConnectionStatus::Connected, Some(handle)) => Ok((entry.record.clone(), handle.clone())),
            _ => Err(LinkError::NotConnected(entry.record.display_name.clone())),
        }
    }

    /// Sessions of all CONNECTED records, for liveness checks.
    pub async fn connected_handles(&self) -> Vec<(ConnectionRecord, LiveHandle)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter_map(|e| e.handle.as_ref().map(|h| (e.record.clone(), h.clone())))
            .collect()
    }

    /// Release the handle (closing the transport), then delete.
    pub async fn remove(&self, id: &str) -> Result<ConnectionRecord> {
        let entry = {
            let mut entries = self.entries.lock().await;
            let index = entries
                .iter()
                .position(|e| e.record.id == id)
                .ok_or_else(|| LinkError::PrinterNotFound(id.to_string()))?;
            entries.remove(index)
        };

        if let Some(handle) = entry.handle {
            release(handle).await;
        }
        info!("Removed printer {} ({})", entry.record.display_name, entry.record.id);
        Ok(entry.record)
    }

    /// Remove every record matching the predicate. CONNECTED records are never removed.
    pub async fn remove_where<F>(&self, mut predicate: F) -> Vec<ConnectionRecord>
    where
        F: FnMut(&ConnectionRecord) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let mut removed = Vec::new();
        entries.retain(|e| {
            if !e.record.is_connected() && predicate(&e.record) {
                removed.push(e.record.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop every record, closing all live handles.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().await;
            entries.drain(..).collect()
        };
        let count = drained.len();
        for entry in drained {
            if let Some(handle) = entry.handle {
                release(handle).await;
            }
        }
        count
    }

    /// Close every live handle and mark the records DISCONNECTED, keeping them.
    pub async fn disconnect_all(&self) -> usize {
        let handles: Vec<LiveHandle> = {
            let now = self.clock.now();
            let mut entries = self.entries.lock().await;
            let mut handles = Vec::new();
            for entry in entries.iter_mut().filter(|e| e.record.is_connected()) {
                let epoch = self.bump();
                if let Some(handle) = entry.transition(ConnectionStatus::Disconnected, None, epoch, now) {
                    handles.push(handle);
                }
            }
            handles
        };
        let count = handles.len();
        for handle in handles {
            release(handle).await;
        }
        count
    }
}

/// Close a handle that left the registry. Close errors are logged, never propagated.
pub async fn release(handle: LiveHandle) {
    if let Err(e) = handle.session().close().await {
        debug!("Closing session {:?} failed (ignored): {}", handle.id(), e);
    }
}
