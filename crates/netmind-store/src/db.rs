//! Connection setup and ordered schema migrations.

use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{Result, StoreError};

/// One schema migration. Each entry is idempotent within its version
/// record: it runs exactly once, inside its own transaction.
struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: "
        CREATE TABLE devices (
            id          TEXT    NOT NULL PRIMARY KEY,
            ip          TEXT    NOT NULL UNIQUE,
            hostname    TEXT,
            mac         TEXT,
            vendor      TEXT,
            first_seen  TEXT    NOT NULL,
            last_seen   TEXT    NOT NULL,
            updated_at  TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE services (
            id           TEXT    NOT NULL PRIMARY KEY,
            device_id    TEXT    NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            type         TEXT    NOT NULL CHECK (type IN
                             ('http','https','rtsp','mqtt','ssh','api','onvif')),
            port         INTEGER NOT NULL,
            path         TEXT,
            status       TEXT    NOT NULL DEFAULT 'unknown' CHECK (status IN
                             ('online','offline','unknown')),
            last_checked TEXT,
            metadata     TEXT    NOT NULL DEFAULT '{}',
            UNIQUE (device_id, type, port)
        ) STRICT;
        CREATE INDEX idx_services_device ON services (device_id);

        CREATE TABLE content_snapshots (
            id           TEXT    NOT NULL PRIMARY KEY,
            device_id    TEXT    REFERENCES devices(id)  ON DELETE CASCADE,
            service_id   TEXT    REFERENCES services(id) ON DELETE CASCADE,
            content      BLOB    NOT NULL,
            content_type TEXT    NOT NULL,
            hash         TEXT    NOT NULL,
            size         INTEGER NOT NULL,
            captured_at  TEXT    NOT NULL,
            CHECK (device_id IS NOT NULL OR service_id IS NOT NULL)
        ) STRICT;
        -- at most one snapshot per (target, captured_at)
        CREATE UNIQUE INDEX idx_snap_service_time
            ON content_snapshots (service_id, captured_at) WHERE service_id IS NOT NULL;
        CREATE UNIQUE INDEX idx_snap_device_time
            ON content_snapshots (device_id, captured_at) WHERE device_id IS NOT NULL;

        CREATE TABLE change_records (
            id                   TEXT NOT NULL PRIMARY KEY,
            device_id            TEXT REFERENCES devices(id)  ON DELETE CASCADE,
            service_id           TEXT REFERENCES services(id) ON DELETE CASCADE,
            previous_snapshot_id TEXT REFERENCES content_snapshots(id) ON DELETE SET NULL,
            current_snapshot_id  TEXT NOT NULL REFERENCES content_snapshots(id) ON DELETE CASCADE,
            change_type          TEXT NOT NULL CHECK (change_type IN
                                     ('content','status','metadata')),
            change_score         REAL NOT NULL,
            detected_at          TEXT NOT NULL,
            summary              TEXT NOT NULL DEFAULT ''
        ) STRICT;
        CREATE INDEX idx_changes_service ON change_records (service_id, detected_at);
        CREATE INDEX idx_changes_device  ON change_records (device_id, detected_at);
        ",
    },
    Migration {
        version: 2,
        sql: "
        CREATE TABLE conversations (
            id               TEXT NOT NULL PRIMARY KEY,
            started_at       TEXT NOT NULL,
            last_activity_at TEXT NOT NULL,
            metadata         TEXT NOT NULL DEFAULT '{}'
        ) STRICT;

        CREATE TABLE messages (
            id              TEXT NOT NULL PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role            TEXT NOT NULL CHECK (role IN ('user','assistant','system')),
            text            TEXT NOT NULL,
            timestamp       TEXT NOT NULL,
            blocks          TEXT NOT NULL DEFAULT '[]',
            metadata        TEXT NOT NULL DEFAULT '{}'
        ) STRICT;
        CREATE INDEX idx_messages_conv ON messages (conversation_id, timestamp);

        CREATE TABLE watch_rules (
            id               TEXT    NOT NULL PRIMARY KEY,
            conversation_id  TEXT    NOT NULL REFERENCES conversations(id),
            target_id        TEXT    NOT NULL,
            target_type      TEXT    NOT NULL CHECK (target_type IN ('device','service')),
            intent           TEXT    NOT NULL,
            started_at       TEXT    NOT NULL,
            expires_at       TEXT    NOT NULL,
            poll_interval_ms INTEGER NOT NULL,
            change_threshold REAL    NOT NULL,
            active           INTEGER NOT NULL DEFAULT 1,
            last_polled      TEXT,
            last_change      TEXT
        ) STRICT;
        -- efficient 'active rules' scan for the watch engine
        CREATE INDEX idx_rules_active ON watch_rules (active, expires_at);
        ",
    },
];

/// Open (or create) the database at `path` with WAL concurrency and
/// foreign keys enforced, then bring the schema up to date.
pub fn open(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

/// Open a second connection to an already-migrated database (readers,
/// writer task). Applies pragmas only.
pub fn open_existing(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path.as_ref())?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 2000;",
    )?;
    Ok(())
}

/// Execute pending migrations in order, each in its own transaction,
/// recording every applied version.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER NOT NULL PRIMARY KEY,
            applied_at TEXT    NOT NULL
        ) STRICT;",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    let supported = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
    if current > supported {
        return Err(StoreError::SchemaMismatch {
            found: current,
            supported,
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let applied = conn.execute_batch(migration.sql).and_then(|_| {
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![migration.version, now],
            )
            .map(|_| ())
        });
        match applied {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                info!(version = migration.version, "schema migration applied");
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                tracing::error!(version = migration.version, "migration failed: {e}");
                return Err(StoreError::SchemaMismatch {
                    found: current,
                    supported: migration.version,
                });
            }
        }
    }

    debug!(version = supported, "schema up to date");
    Ok(())
}

/// Jitter for conflict retries, derived from sub-second nanos so the
/// crate stays free of a rand dependency.
pub(crate) fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as u64) % max_ms
}

/// Run `op` up to 3 times, sleeping a short jittered delay between
/// conflict retries. Non-retryable errors surface immediately.
pub(crate) fn with_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    const ATTEMPTS: u32 = 3;
    let mut last = None;
    for attempt in 1..=ATTEMPTS {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < ATTEMPTS => {
                let delay = 5 + jitter_ms(25);
                tracing::warn!(attempt, delay_ms = delay, "store conflict, retrying: {e}");
                std::thread::sleep(std::time::Duration::from_millis(delay));
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| StoreError::ConcurrencyConflict("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let conn = open(&path).unwrap();
        // run again on the same connection and on a fresh one
        migrate(&conn).unwrap();
        let conn2 = open(&path).unwrap();
        let version: i64 = conn2
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn future_schema_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let conn = open(&path).unwrap();
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (99, '2030-01-01')",
                [],
            )
            .unwrap();
        }
        let err = open(&path).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch { found: 99, .. }));
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open(dir.path().join("test.db")).unwrap();
        let err = conn.execute(
            "INSERT INTO services (id, device_id, type, port) VALUES ('s1', 'missing', 'http', 80)",
            [],
        );
        assert!(err.is_err());
    }
}
