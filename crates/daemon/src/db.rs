use crate::error::{PortError, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tunnelport_common::{Allocation, AllocationStatus, Credentials, Metadata, PortRange};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    port INTEGER NOT NULL CHECK (port BETWEEN 1 AND 65535),
    owner_id TEXT NOT NULL,
    credentials TEXT,
    allocated_at TEXT NOT NULL,
    last_heartbeat TEXT NOT NULL,
    last_verification TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    metadata TEXT NOT NULL DEFAULT '{}'
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_allocations_active_port
    ON allocations(port) WHERE status = 'active';
CREATE UNIQUE INDEX IF NOT EXISTS idx_allocations_active_owner
    ON allocations(owner_id) WHERE status = 'active';
CREATE INDEX IF NOT EXISTS idx_allocations_status_verification
    ON allocations(status, last_verification);
"#;

const COLUMNS: &str =
    "port, owner_id, credentials, allocated_at, last_heartbeat, last_verification, status, metadata";

/// Initialize the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| PortError::Internal(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let conn = Connection::open(path)?;
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!(path = %path.display(), journal_mode = %mode, "opened allocation store");
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Get the default database path (~/.tunnelport/allocations.db)
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tunnelport")
        .join("allocations.db")
}

/// Fixed-width UTC text so that string order in SQL equals time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_allocation(row: &Row<'_>) -> rusqlite::Result<Allocation> {
    let credentials: Option<String> = row.get(2)?;
    let status: String = row.get(6)?;
    let metadata: String = row.get(7)?;

    Ok(Allocation {
        port: row.get(0)?,
        owner_id: row.get(1)?,
        credentials: credentials.as_deref().map(|raw| parse_json(2, raw)).transpose()?,
        allocated_at: parse_ts(3, &row.get::<_, String>(3)?)?,
        last_heartbeat: parse_ts(4, &row.get::<_, String>(4)?)?,
        last_verification: parse_ts(5, &row.get::<_, String>(5)?)?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
        })?,
        metadata: parse_json(7, &metadata)?,
    })
}

fn encode_credentials(credentials: Option<&Credentials>) -> Result<Option<String>> {
    Ok(credentials.map(serde_json::to_string).transpose()?)
}

/// Insert a fresh active allocation. Fails with a unique-constraint violation when the
/// port or the owner already has an active row.
pub fn insert_active(
    conn: &Connection,
    port: u16,
    owner_id: &str,
    credentials: Option<&Credentials>,
    metadata: &Metadata,
    now: DateTime<Utc>,
) -> Result<Allocation> {
    // Stored text keeps microseconds; return exactly what a later read sees.
    let now = now.trunc_subsecs(6);
    let ts = format_ts(now);
    conn.execute(
        "INSERT INTO allocations (port, owner_id, credentials, allocated_at, last_heartbeat, last_verification, status, metadata)
         VALUES (?1, ?2, ?3, ?4, ?4, ?4, 'active', ?5)",
        params![
            port,
            owner_id,
            encode_credentials(credentials)?,
            ts,
            serde_json::to_string(metadata)?,
        ],
    )?;

    Ok(Allocation {
        port,
        owner_id: owner_id.to_string(),
        credentials: credentials.cloned(),
        allocated_at: now,
        last_heartbeat: now,
        last_verification: now,
        status: AllocationStatus::Active,
        metadata: metadata.clone(),
    })
}

pub fn active_for_owner(conn: &Connection, owner_id: &str) -> Result<Option<Allocation>> {
    let sql = format!("SELECT {} FROM allocations WHERE owner_id = ?1 AND status = 'active'", COLUMNS);
    Ok(conn.query_row(&sql, params![owner_id], row_to_allocation).optional()?)
}

pub fn active_at_port(conn: &Connection, port: u16) -> Result<Option<Allocation>> {
    let sql = format!("SELECT {} FROM allocations WHERE port = ?1 AND status = 'active'", COLUMNS);
    Ok(conn.query_row(&sql, params![port], row_to_allocation).optional()?)
}

/// Most recent row for a port regardless of status.
pub fn latest_for_port(conn: &Connection, port: u16) -> Result<Option<Allocation>> {
    let sql = format!(
        "SELECT {} FROM allocations WHERE port = ?1 ORDER BY id DESC LIMIT 1",
        COLUMNS
    );
    Ok(conn.query_row(&sql, params![port], row_to_allocation).optional()?)
}

/// Ports inside `range` that currently have an active allocation.
pub fn active_ports(conn: &Connection, range: PortRange) -> Result<BTreeSet<u16>> {
    let mut stmt = conn.prepare(
        "SELECT port FROM allocations WHERE status = 'active' AND port BETWEEN ?1 AND ?2",
    )?;
    let ports = stmt
        .query_map(params![range.min, range.max], |row| row.get::<_, u16>(0))?
        .collect::<rusqlite::Result<BTreeSet<u16>>>()?;
    Ok(ports)
}

pub fn list_active(conn: &Connection) -> Result<Vec<Allocation>> {
    let sql = format!("SELECT {} FROM allocations WHERE status = 'active' ORDER BY port", COLUMNS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], row_to_allocation)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Mark the active row for `(port, owner_id)` as released.
pub fn release(conn: &Connection, port: u16, owner_id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE allocations SET status = 'released' WHERE port = ?1 AND owner_id = ?2 AND status = 'active'",
        params![port, owner_id],
    )?;
    Ok(rows > 0)
}

pub fn update_credentials(conn: &Connection, port: u16, credentials: &Credentials) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE allocations SET credentials = ?1 WHERE port = ?2 AND status = 'active'",
        params![serde_json::to_string(credentials)?, port],
    )?;
    Ok(rows > 0)
}

/// Refresh `last_heartbeat` (and optionally `last_verification`) on the active row matching
/// `port` and, when given, `owner_id`.
pub fn touch_heartbeat(
    conn: &Connection,
    port: u16,
    owner_id: Option<&str>,
    refresh_verification: bool,
    now: DateTime<Utc>,
) -> Result<bool> {
    let ts = format_ts(now);
    let verification = if refresh_verification {
        "MAX(last_verification, ?1)"
    } else {
        "last_verification"
    };
    let rows = match owner_id {
        Some(owner_id) => conn.execute(
            &format!(
                "UPDATE allocations SET last_heartbeat = ?1, last_verification = {} \
                 WHERE port = ?2 AND owner_id = ?3 AND status = 'active'",
                verification
            ),
            params![ts, port, owner_id],
        )?,
        None => conn.execute(
            &format!(
                "UPDATE allocations SET last_heartbeat = ?1, last_verification = {} \
                 WHERE port = ?2 AND status = 'active'",
                verification
            ),
            params![ts, port],
        )?,
    };
    Ok(rows > 0)
}

/// Record a confirmed ownership check. Returns the stored verification time, which never
/// moves backwards.
pub fn touch_verification(
    conn: &Connection,
    port: u16,
    owner_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let rows = conn.execute(
        "UPDATE allocations SET last_verification = MAX(last_verification, ?1) \
         WHERE port = ?2 AND owner_id = ?3 AND status = 'active'",
        params![format_ts(now), port, owner_id],
    )?;
    if rows == 0 {
        return Ok(None);
    }
    Ok(active_at_port(conn, port)?.map(|a| a.last_verification))
}

/// Expire every active row whose last verification is older than `cutoff`, returning the
/// rows as they were before the transition. `on_candidate` sees each row, in port order,
/// inside the transaction and before any row changes status.
pub fn expire_stale<F>(
    conn: &mut Connection,
    cutoff: DateTime<Utc>,
    mut on_candidate: F,
) -> Result<Vec<Allocation>>
where
    F: FnMut(&Allocation),
{
    let cutoff = format_ts(cutoff);
    let tx = conn.transaction()?;

    let stale = {
        let sql = format!(
            "SELECT {} FROM allocations WHERE status = 'active' AND last_verification < ?1 ORDER BY port",
            COLUMNS
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![cutoff], row_to_allocation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    for allocation in &stale {
        on_candidate(allocation);
    }

    if !stale.is_empty() {
        tx.execute(
            "UPDATE allocations SET status = 'expired' WHERE status = 'active' AND last_verification < ?1",
            params![cutoff],
        )?;
    }
    tx.commit()?;
    Ok(stale)
}

/// Row counts per status: (active inside range, released, expired).
pub fn status_counts(conn: &Connection, range: PortRange) -> Result<(u32, u32, u32)> {
    Ok(conn.query_row(
        "SELECT \
            COALESCE(SUM(CASE WHEN status = 'active' AND port BETWEEN ?1 AND ?2 THEN 1 ELSE 0 END), 0), \
            COALESCE(SUM(CASE WHEN status = 'released' THEN 1 ELSE 0 END), 0), \
            COALESCE(SUM(CASE WHEN status = 'expired' THEN 1 ELSE 0 END), 0) \
         FROM allocations",
        params![range.min, range.max],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?)
}

/// Shared handle to the allocation table. Every call runs on the blocking pool and takes
/// the connection lock for the duration of that single call only.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_connection(init_db(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| PortError::Internal("allocation store lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PortError::Internal(format!("store task failed: {}", e)))?
    }
}
