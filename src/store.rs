//! Durable printer lists, one JSON array per transport namespace.

use crate::errors::Result;
use crate::record::{ConnectionRecord, PersistedRecord, TransportKind};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info, warn};

pub struct PersistenceStore {
    conn: Connection,
}

impl PersistenceStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS printer_connections (
                    namespace TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
                )
                "#,
                [],
            )?;
            Ok(())
        })
        .await?;

        info!("Printer connection store initialized");
        Ok(Self { conn })
    }

    /// Every persisted record across all namespaces. Malformed or missing data yields nothing.
    pub async fn load(&self) -> Vec<PersistedRecord> {
        let mut records = Vec::new();
        for kind in TransportKind::ALL {
            match self.read_raw(kind.namespace()).await {
                Ok(Some(raw)) => records.extend(parse_namespace(kind, &raw)),
                Ok(None) => {}
                Err(e) => warn!("Could not read {}: {}", kind.namespace(), e),
            }
        }
        debug!("Loaded {} persisted printers", records.len());
        records
    }

    /// Replace every namespace with the persist-safe fields of `records`.
    pub async fn save(&self, records: &[ConnectionRecord]) -> Result<()> {
        let mut payloads = Vec::with_capacity(TransportKind::ALL.len());
        for kind in TransportKind::ALL {
            let persisted: Vec<PersistedRecord> = records
                .iter()
                .filter(|r| r.transport_kind == kind)
                .map(ConnectionRecord::to_persisted)
                .collect();
            payloads.push((kind.namespace(), serde_json::to_string(&persisted)?));
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for (namespace, value) in &payloads {
                    tx.execute(
                        r#"
                        INSERT INTO printer_connections (namespace, value, updated_at)
                        VALUES (?1, ?2, strftime('%s', 'now'))
                        ON CONFLICT(namespace) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
                        "#,
                        rusqlite::params![namespace, value],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        debug!("Saved {} printers", records.len());
        Ok(())
    }

    pub async fn read_raw(&self, namespace: &str) -> Result<Option<String>> {
        let namespace = namespace.to_string();
        let value = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM printer_connections WHERE namespace = ?1")?;
                let mut rows = stmt.query([namespace])?;
                let value = match rows.next()? {
                    Some(row) => Some(row.get::<_, String>(0)?),
                    None => None,
                };
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    /// Overwrite a namespace with an arbitrary string.
    pub async fn write_raw(&self, namespace: &str, value: &str) -> Result<()> {
        let namespace = namespace.to_string();
        let value = value.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO printer_connections (namespace, value) VALUES (?1, ?2)
                    ON CONFLICT(namespace) DO UPDATE SET value = excluded.value
                    "#,
                    rusqlite::params![namespace, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Parse one namespace's array entry by entry, so one bad entry does not discard its siblings.
fn parse_namespace(kind: TransportKind, raw: &str) -> Vec<PersistedRecord> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Discarding malformed {} data: {}", kind.namespace(), e);
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .filter_map(|mut entry| {
            if let Some(object) = entry.as_object_mut() {
                object
                    .entry("transportKind")
                    .or_insert_with(|| serde_json::json!(kind));
            }
            match serde_json::from_value::<PersistedRecord>(entry) {
                Ok(record) if record.transport_kind == kind => Some(record),
                Ok(record) => {
                    warn!("Skipping {} record {} stored under {}", record.transport_kind, record.id, kind.namespace());
                    None
                }
                Err(e) => {
                    warn!("Skipping malformed entry in {}: {}", kind.namespace(), e);
                    None
                }
            }
        })
        .collect()
}
