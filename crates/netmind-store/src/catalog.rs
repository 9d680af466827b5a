//! Device catalog: devices, services, content snapshots, change records.
//!
//! All methods take short exclusive locks on a single connection; writes
//! are short transactions. Conflict retries (SQLITE_BUSY) are handled
//! here so callers only see `ConcurrencyConflict` after retries are
//! exhausted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use netmind_core::types::{TargetKind, TargetRef};

use crate::db::with_retry;
use crate::error::{Result, StoreError};
use crate::types::*;

pub struct DeviceCatalog {
    conn: Mutex<Connection>,
    in_tx: AtomicBool,
}

impl DeviceCatalog {
    /// Wrap an already-open (and migrated) connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            in_tx: AtomicBool::new(false),
        }
    }

    // --- devices -----------------------------------------------------------

    /// Create the device on first discovery or refresh it on a repeat
    /// observation. New facts overwrite old ones; absent facts keep the
    /// stored value. Devices are never deleted automatically.
    pub fn upsert_device(&self, obs: &DeviceObservation) -> Result<Device> {
        with_retry(|| {
            let conn = self.conn.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM devices WHERE ip = ?1",
                    [&obs.ip],
                    |row| row.get(0),
                )
                .ok();

            let id = match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE devices SET
                            hostname  = COALESCE(?1, hostname),
                            mac       = COALESCE(?2, mac),
                            vendor    = COALESCE(?3, vendor),
                            last_seen = ?4,
                            updated_at = ?4
                         WHERE id = ?5",
                        rusqlite::params![obs.hostname, obs.mac, obs.vendor, now, id],
                    )?;
                    id
                }
                None => {
                    let id = derive_device_id(&obs.ip, obs.mac.as_deref());
                    conn.execute(
                        "INSERT INTO devices
                            (id, ip, hostname, mac, vendor, first_seen, last_seen, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?6)",
                        rusqlite::params![id, obs.ip, obs.hostname, obs.mac, obs.vendor, now],
                    )?;
                    info!(device_id = %id, ip = %obs.ip, "device discovered");
                    id
                }
            };

            conn.query_row(
                "SELECT id, ip, hostname, mac, vendor, first_seen, last_seen, updated_at
                 FROM devices WHERE id = ?1",
                [&id],
                row_to_device,
            )
            .map_err(Into::into)
        })
    }

    pub fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        optional(conn.query_row(
            "SELECT id, ip, hostname, mac, vendor, first_seen, last_seen, updated_at
             FROM devices WHERE id = ?1",
            [id],
            row_to_device,
        ))
    }

    pub fn get_device_by_ip(&self, ip: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock().unwrap();
        optional(conn.query_row(
            "SELECT id, ip, hostname, mac, vendor, first_seen, last_seen, updated_at
             FROM devices WHERE ip = ?1",
            [ip],
            row_to_device,
        ))
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ip, hostname, mac, vendor, first_seen, last_seen, updated_at
             FROM devices ORDER BY ip",
        )?;
        let rows = stmt.query_map([], row_to_device)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Explicit user-driven removal. Cascades to services, snapshots and
    /// change records.
    pub fn remove_device(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM devices WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(StoreError::NotFound(format!("device {id}")));
        }
        info!(device_id = %id, "device removed");
        Ok(())
    }

    // --- services ----------------------------------------------------------

    /// Create the service on first probe, or refresh `path`/`metadata` and
    /// `last_checked` on a repeat probe. Keyed by (device, type, port).
    pub fn upsert_service(
        &self,
        device_id: &str,
        service_type: ServiceType,
        port: u16,
        path: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Service> {
        with_retry(|| {
            let conn = self.conn.lock().unwrap();
            let now = Utc::now().to_rfc3339();
            let type_str = service_type.as_str();
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM services
                     WHERE device_id = ?1 AND type = ?2 AND port = ?3",
                    rusqlite::params![device_id, type_str, port],
                    |row| row.get(0),
                )
                .ok();

            let id = match existing {
                Some(id) => {
                    conn.execute(
                        "UPDATE services SET
                            path = COALESCE(?1, path),
                            metadata = COALESCE(?2, metadata),
                            last_checked = ?3
                         WHERE id = ?4",
                        rusqlite::params![
                            path,
                            metadata.as_ref().map(|m| m.to_string()),
                            now,
                            id
                        ],
                    )?;
                    id
                }
                None => {
                    let id = format!("svc-{}", Uuid::new_v4());
                    conn.execute(
                        "INSERT INTO services
                            (id, device_id, type, port, path, status, last_checked, metadata)
                         VALUES (?1, ?2, ?3, ?4, ?5, 'unknown', ?6, ?7)",
                        rusqlite::params![
                            id,
                            device_id,
                            type_str,
                            port,
                            path,
                            now,
                            metadata
                                .as_ref()
                                .map(|m| m.to_string())
                                .unwrap_or_else(|| "{}".to_string())
                        ],
                    )?;
                    info!(service_id = %id, device_id = %device_id, service_type = type_str, port, "service discovered");
                    id
                }
            };

            conn.query_row(
                "SELECT id, device_id, type, port, path, status, last_checked, metadata
                 FROM services WHERE id = ?1",
                [&id],
                row_to_service,
            )
            .map_err(Into::into)
        })
    }

    pub fn get_service(&self, id: &str) -> Result<Option<Service>> {
        let conn = self.conn.lock().unwrap();
        optional(conn.query_row(
            "SELECT id, device_id, type, port, path, status, last_checked, metadata
             FROM services WHERE id = ?1",
            [id],
            row_to_service,
        ))
    }

    pub fn list_services(&self, device_id: &str) -> Result<Vec<Service>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, device_id, type, port, path, status, last_checked, metadata
             FROM services WHERE device_id = ?1 ORDER BY port",
        )?;
        let rows = stmt.query_map([device_id], row_to_service)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Record a status observation. Returns the previous status so callers
    /// can detect online ⇄ offline transitions.
    pub fn set_service_status(&self, id: &str, status: ServiceStatus) -> Result<ServiceStatus> {
        with_retry(|| {
            let conn = self.conn.lock().unwrap();
            let previous: String = conn
                .query_row("SELECT status FROM services WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .map_err(|_| StoreError::NotFound(format!("service {id}")))?;
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "UPDATE services SET status = ?1, last_checked = ?2 WHERE id = ?3",
                rusqlite::params![status.as_str(), now, id],
            )?;
            previous
                .parse()
                .map_err(|e: String| StoreError::IntegrityViolation(e))
        })
    }

    // --- snapshots ---------------------------------------------------------

    /// Persist one observation. The schema enforces at most one snapshot
    /// per (target, captured_at); violating that surfaces as
    /// `IntegrityViolation`.
    pub fn insert_snapshot(&self, new: NewSnapshot) -> Result<ContentSnapshot> {
        let (device_id, service_id) = split_target(&new.target);
        let id = format!("snap-{}", Uuid::new_v4());
        let size = new.content.len() as u64;
        let captured = new.captured_at.to_rfc3339();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO content_snapshots
                    (id, device_id, service_id, content, content_type, hash, size, captured_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id,
                    device_id,
                    service_id,
                    new.content,
                    new.content_type,
                    new.hash,
                    size,
                    captured
                ],
            )?;
        }
        debug!(snapshot_id = %id, target = %new.target, size, "snapshot stored");
        Ok(ContentSnapshot {
            id,
            device_id: device_id.map(String::from),
            service_id: service_id.map(String::from),
            content: new.content,
            content_type: new.content_type,
            hash: new.hash,
            size,
            captured_at: new.captured_at,
        })
    }

    pub fn latest_snapshot(&self, target: &TargetRef) -> Result<Option<ContentSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let (column, id) = target_column(target);
        optional(conn.query_row(
            &format!(
                "SELECT id, device_id, service_id, content, content_type, hash, size, captured_at
                 FROM content_snapshots WHERE {column} = ?1
                 ORDER BY captured_at DESC LIMIT 1"
            ),
            [id],
            row_to_snapshot,
        ))
    }

    /// Snapshots for a target, newest first.
    pub fn snapshots(&self, target: &TargetRef, limit: usize) -> Result<Vec<ContentSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let (column, id) = target_column(target);
        let mut stmt = conn.prepare(&format!(
            "SELECT id, device_id, service_id, content, content_type, hash, size, captured_at
             FROM content_snapshots WHERE {column} = ?1
             ORDER BY captured_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![id, limit as i64], row_to_snapshot)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Keep only the `keep` most recent snapshots for a target. Returns
    /// the number of rows removed.
    pub fn trim_snapshots(&self, target: &TargetRef, keep: usize) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let (column, id) = target_column(target);
        let n = conn.execute(
            &format!(
                "DELETE FROM content_snapshots
                 WHERE {column} = ?1 AND id NOT IN (
                     SELECT id FROM content_snapshots WHERE {column} = ?1
                     ORDER BY captured_at DESC LIMIT ?2
                 )"
            ),
            rusqlite::params![id, keep as i64],
        )?;
        Ok(n)
    }

    /// Periodic sweep: drop snapshots older than the retention horizon,
    /// always keeping the newest snapshot per target so change chains stay
    /// anchored.
    pub fn prune_snapshots_older_than(&self, days: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "DELETE FROM content_snapshots AS s
             WHERE s.captured_at < ?1
               AND s.captured_at < (
                   SELECT MAX(s2.captured_at) FROM content_snapshots s2
                   WHERE COALESCE(s2.service_id, '') = COALESCE(s.service_id, '')
                     AND COALESCE(s2.device_id, '')  = COALESCE(s.device_id, '')
               )",
            [&cutoff],
        )?;
        if n > 0 {
            info!(removed = n, "stale snapshots pruned");
        }
        Ok(n)
    }

    // --- change records ----------------------------------------------------

    pub fn insert_change(&self, new: NewChange) -> Result<ChangeRecord> {
        let (device_id, service_id) = split_target(&new.target);
        let id = format!("chg-{}", Uuid::new_v4());
        let detected_at = Utc::now();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO change_records
                    (id, device_id, service_id, previous_snapshot_id, current_snapshot_id,
                     change_type, change_score, detected_at, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id,
                    device_id,
                    service_id,
                    new.previous_snapshot_id,
                    new.current_snapshot_id,
                    new.change_type.as_str(),
                    new.change_score,
                    detected_at.to_rfc3339(),
                    new.summary
                ],
            )?;
        }
        debug!(change_id = %id, target = %new.target, score = new.change_score, "change recorded");
        Ok(ChangeRecord {
            id,
            device_id: device_id.map(String::from),
            service_id: service_id.map(String::from),
            previous_snapshot_id: new.previous_snapshot_id,
            current_snapshot_id: new.current_snapshot_id,
            change_type: new.change_type,
            change_score: new.change_score,
            detected_at,
            summary: new.summary,
        })
    }

    /// Change history for a target, newest first.
    pub fn changes_for_target(
        &self,
        target: &TargetRef,
        limit: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let conn = self.conn.lock().unwrap();
        let (column, id) = target_column(target);
        let mut stmt = conn.prepare(&format!(
            "SELECT id, device_id, service_id, previous_snapshot_id, current_snapshot_id,
                    change_type, change_score, detected_at, summary
             FROM change_records WHERE {column} = ?1
             ORDER BY detected_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(rusqlite::params![id, limit as i64], row_to_change)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // --- transactions ------------------------------------------------------

    /// Run `f` inside an exclusive transaction: commit on Ok, rollback on
    /// Err. Nested calls are a programming error and panic.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        if self.in_tx.swap(true, Ordering::SeqCst) {
            panic!("nested DeviceCatalog transaction");
        }
        let result = (|| {
            let mut conn = self.conn.lock().unwrap();
            let tx = conn.transaction()?;
            match f(&tx) {
                Ok(v) => {
                    tx.commit()?;
                    Ok(v)
                }
                Err(e) => {
                    let _ = tx.rollback();
                    Err(e)
                }
            }
        })();
        self.in_tx.store(false, Ordering::SeqCst);
        result
    }
}

fn split_target(target: &TargetRef) -> (Option<&str>, Option<&str>) {
    match target.kind {
        TargetKind::Device => (Some(target.id.as_str()), None),
        TargetKind::Service => (None, Some(target.id.as_str())),
    }
}

fn target_column(target: &TargetRef) -> (&'static str, &str) {
    match target.kind {
        TargetKind::Device => ("device_id", target.id.as_str()),
        TargetKind::Service => ("service_id", target.id.as_str()),
    }
}

fn optional<T>(res: rusqlite::Result<T>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn ts(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: row.get(0)?,
        ip: row.get(1)?,
        hostname: row.get(2)?,
        mac: row.get(3)?,
        vendor: row.get(4)?,
        first_seen: ts(row.get(5)?)?,
        last_seen: ts(row.get(6)?)?,
        updated_at: ts(row.get(7)?)?,
    })
}

fn row_to_service(row: &rusqlite::Row<'_>) -> rusqlite::Result<Service> {
    let type_str: String = row.get(2)?;
    let status_str: String = row.get(5)?;
    let metadata_str: String = row.get(7)?;
    let last_checked: Option<String> = row.get(6)?;
    Ok(Service {
        id: row.get(0)?,
        device_id: row.get(1)?,
        service_type: type_str.parse().unwrap_or(ServiceType::Http),
        port: row.get::<_, i64>(3)? as u16,
        path: row.get(4)?,
        status: status_str.parse().unwrap_or(ServiceStatus::Unknown),
        last_checked: last_checked.map(ts).transpose()?,
        metadata: serde_json::from_str(&metadata_str)
            .unwrap_or(serde_json::Value::Object(Default::default())),
    })
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentSnapshot> {
    Ok(ContentSnapshot {
        id: row.get(0)?,
        device_id: row.get(1)?,
        service_id: row.get(2)?,
        content: row.get(3)?,
        content_type: row.get(4)?,
        hash: row.get(5)?,
        size: row.get::<_, i64>(6)? as u64,
        captured_at: ts(row.get(7)?)?,
    })
}

fn row_to_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeRecord> {
    let type_str: String = row.get(5)?;
    Ok(ChangeRecord {
        id: row.get(0)?,
        device_id: row.get(1)?,
        service_id: row.get(2)?,
        previous_snapshot_id: row.get(3)?,
        current_snapshot_id: row.get(4)?,
        change_type: type_str.parse().unwrap_or(ChangeType::Content),
        change_score: row.get(6)?,
        detected_at: ts(row.get(7)?)?,
        summary: row.get(8)?,
    })
}
