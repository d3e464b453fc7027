use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, Row};
use serde::{Deserialize, Serialize};

use crate::capsule::{ProofCapsule, Provenance};
use crate::signals::EntropySignal;

/// Structured column of a capsule row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsulePayload {
    pub signal: EntropySignal,
    pub statement: String,
    pub provenance: Provenance,
    pub inputs_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapsuleRecord {
    pub id: i64,
    pub symbol: String,
    pub signal_hash: String,
    pub schema_version: String,
    pub timestamp_ns: i64,
    pub payload: CapsulePayload,
}

/// Append-only SQLite store for proof capsules.
///
/// The connection sits behind a mutex so symbol tasks can insert
/// concurrently; SQLite enforces `signal_hash` uniqueness.
pub struct CapsuleStore {
    conn: Mutex<Connection>,
}

impl CapsuleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS capsules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                signal_hash TEXT NOT NULL,
                schema_version TEXT NOT NULL,
                timestamp_ns INTEGER NOT NULL,
                payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS ix_capsules_symbol_ts ON capsules (symbol, timestamp_ns);
            CREATE UNIQUE INDEX IF NOT EXISTS ux_capsules_signal_hash ON capsules (signal_hash);
            COMMIT;",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("capsule store mutex poisoned"))
    }

    /// Insert a capsule; returns the assigned row id.
    pub fn store(&self, symbol: &str, capsule: &ProofCapsule) -> Result<i64> {
        let payload = CapsulePayload {
            signal: capsule.signal,
            statement: capsule.statement.clone(),
            provenance: capsule.provenance.clone(),
            inputs_fingerprint: capsule.inputs_fingerprint.clone(),
        };
        let payload = serde_json::to_string(&payload)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO capsules (symbol, signal_hash, schema_version, timestamp_ns, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                symbol,
                capsule.signal_hash,
                capsule.schema_version,
                capsule.timestamp_ns,
                payload
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Capsules for `symbol` whose drift lies in `[lo, hi]`, oldest first.
    /// Undefined drift is stored as JSON null and never matches.
    pub fn query(&self, symbol: &str, lo: f64, hi: f64) -> Result<Vec<CapsuleRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, signal_hash, schema_version, timestamp_ns, payload
             FROM capsules
             WHERE symbol = ?1
               AND json_extract(payload, '$.signal.delta_phi') IS NOT NULL
               AND json_extract(payload, '$.signal.delta_phi') BETWEEN ?2 AND ?3
             ORDER BY timestamp_ns, id",
        )?;
        let rows = stmt.query_map(params![symbol, lo, hi], raw_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    /// Most recent capsules for `symbol`, newest first.
    pub fn latest(&self, symbol: &str, limit: usize) -> Result<Vec<CapsuleRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, symbol, signal_hash, schema_version, timestamp_ns, payload
             FROM capsules WHERE symbol = ?1
             ORDER BY timestamp_ns DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![symbol, limit as i64], raw_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.decode()?);
        }
        Ok(out)
    }

    pub fn count(&self, symbol: &str) -> Result<u64> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM capsules WHERE symbol = ?1",
            params![symbol],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }
}

struct RawRow {
    id: i64,
    symbol: String,
    signal_hash: String,
    schema_version: String,
    timestamp_ns: i64,
    payload: String,
}

impl RawRow {
    fn decode(self) -> Result<CapsuleRecord> {
        Ok(CapsuleRecord {
            id: self.id,
            symbol: self.symbol,
            signal_hash: self.signal_hash,
            schema_version: self.schema_version,
            timestamp_ns: self.timestamp_ns,
            payload: serde_json::from_str(&self.payload)?,
        })
    }
}

fn raw_row(r: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: r.get(0)?,
        symbol: r.get(1)?,
        signal_hash: r.get(2)?,
        schema_version: r.get(3)?,
        timestamp_ns: r.get(4)?,
        payload: r.get(5)?,
    })
}

/// True when `err` is a uniqueness violation on insert.
pub fn is_duplicate_hash(err: &anyhow::Error) -> bool {
    err.downcast_ref::<rusqlite::Error>()
        .and_then(|e| e.sqlite_error_code())
        .map_or(false, |code| code == ErrorCode::ConstraintViolation)
}
