//! SQLite-backed StateStore implementation.
//! Provides persistent lease, handoff and health storage across restarts.
//!
//! Enable with the `sqlite` feature flag:
//! ```toml
//! gpulease-core = { path = "../gpulease-core", features = ["sqlite"] }
//! ```

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::StoreError;
use crate::infrastructure::StateStore;
use crate::types::*;

/// A persistent state store backed by SQLite.
///
/// Uses WAL mode with `synchronous = FULL` so every committed write is on disk
/// before the call returns.
pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Throwaway database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gpu_lease (
                slot        INTEGER PRIMARY KEY CHECK (slot = 0),
                owner       TEXT NOT NULL,
                lease_id    TEXT NOT NULL,
                reason      TEXT NOT NULL,
                acquired_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS handoffs (
                id           TEXT PRIMARY KEY,
                kind         TEXT NOT NULL,
                phase        TEXT NOT NULL,
                started_at   INTEGER NOT NULL,
                completed_at INTEGER,
                error        TEXT,
                phase_log    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_handoffs_phase ON handoffs(phase);

            CREATE TABLE IF NOT EXISTS service_health (
                service_id           TEXT PRIMARY KEY,
                role                 TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL,
                last_checked_at      INTEGER,
                status               TEXT NOT NULL
            );",
        )?;

        Ok(Self { conn })
    }

    fn corrupt(what: &str, err: impl std::fmt::Display) -> StoreError {
        StoreError::Corrupt(format!("{what}: {err}"))
    }

    fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
        Uuid::parse_str(s).map_err(|e| Self::corrupt("uuid", e))
    }

    fn write_lease(conn: &Connection, lease: Option<&GpuLease>) -> Result<(), StoreError> {
        match lease {
            Some(lease) => {
                conn.execute(
                    "INSERT INTO gpu_lease (slot, owner, lease_id, reason, acquired_at)
                     VALUES (0, ?1, ?2, ?3, ?4)
                     ON CONFLICT(slot) DO UPDATE SET
                        owner = excluded.owner,
                        lease_id = excluded.lease_id,
                        reason = excluded.reason,
                        acquired_at = excluded.acquired_at",
                    params![
                        lease.owner.as_str(),
                        lease.lease_id.to_string(),
                        lease.reason,
                        lease.acquired_at,
                    ],
                )?;
            }
            None => {
                conn.execute("DELETE FROM gpu_lease WHERE slot = 0", [])?;
            }
        }
        Ok(())
    }

    fn write_handoff(conn: &Connection, record: &HandoffRecord) -> Result<(), StoreError> {
        let phase_log = serde_json::to_string(&record.phase_log)?;
        conn.execute(
            "INSERT INTO handoffs (id, kind, phase, started_at, completed_at, error, phase_log)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                phase = excluded.phase,
                completed_at = excluded.completed_at,
                error = excluded.error,
                phase_log = excluded.phase_log",
            params![
                record.handoff_id.to_string(),
                record.kind.to_string(),
                record.phase.to_string(),
                record.started_at,
                record.completed_at,
                record.error,
                phase_log,
            ],
        )?;
        Ok(())
    }

    fn row_to_handoff(row: &rusqlite::Row) -> rusqlite::Result<HandoffRow> {
        Ok(HandoffRow {
            id: row.get(0)?,
            kind: row.get(1)?,
            phase: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            error: row.get(5)?,
            phase_log: row.get(6)?,
        })
    }

    fn query_handoffs(&self, filter: Option<Uuid>) -> Result<Vec<HandoffRecord>, StoreError> {
        const COLUMNS: &str =
            "SELECT id, kind, phase, started_at, completed_at, error, phase_log FROM handoffs";

        let rows: Vec<HandoffRow> = match filter {
            Some(id) => {
                let mut stmt = self.conn.prepare(&format!("{COLUMNS} WHERE id = ?1"))?;
                let rows = stmt
                    .query_map(params![id.to_string()], Self::row_to_handoff)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = self.conn.prepare(&format!("{COLUMNS} ORDER BY rowid"))?;
                let rows = stmt
                    .query_map([], Self::row_to_handoff)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        rows.into_iter().map(HandoffRow::into_record).collect()
    }
}

/// Raw column values, decoded outside the rusqlite row callback so parse
/// failures surface as `StoreError::Corrupt`.
struct HandoffRow {
    id: String,
    kind: String,
    phase: String,
    started_at: u64,
    completed_at: Option<u64>,
    error: Option<String>,
    phase_log: String,
}

impl HandoffRow {
    fn into_record(self) -> Result<HandoffRecord, StoreError> {
        Ok(HandoffRecord {
            handoff_id: SqliteStateStore::parse_uuid(&self.id)?,
            kind: self
                .kind
                .parse()
                .map_err(|e| SqliteStateStore::corrupt("kind", e))?,
            phase: self
                .phase
                .parse()
                .map_err(|e| SqliteStateStore::corrupt("phase", e))?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error,
            phase_log: serde_json::from_str(&self.phase_log)?,
        })
    }
}

impl StateStore for SqliteStateStore {
    fn load_lease(&self) -> Result<Option<GpuLease>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT owner, lease_id, reason, acquired_at FROM gpu_lease WHERE slot = 0",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u64>(3)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(owner, lease_id, reason, acquired_at)| {
            Ok(GpuLease {
                owner: ServiceId::new(owner),
                lease_id: Self::parse_uuid(&lease_id)?,
                reason,
                acquired_at,
            })
        })
        .transpose()
    }

    fn save_lease(&mut self, lease: Option<&GpuLease>) -> Result<(), StoreError> {
        Self::write_lease(&self.conn, lease)
    }

    fn save_handoff(&mut self, record: &HandoffRecord) -> Result<(), StoreError> {
        Self::write_handoff(&self.conn, record)
    }

    fn commit_transfer(
        &mut self,
        lease: &GpuLease,
        record: &HandoffRecord,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        Self::write_lease(&tx, Some(lease))?;
        Self::write_handoff(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    fn load_handoff(&self, handoff_id: Uuid) -> Result<Option<HandoffRecord>, StoreError> {
        Ok(self.query_handoffs(Some(handoff_id))?.into_iter().next())
    }

    fn load_handoffs(&self) -> Result<Vec<HandoffRecord>, StoreError> {
        self.query_handoffs(None)
    }

    fn save_health(&mut self, health: &ServiceHealth) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO service_health (service_id, role, consecutive_failures, last_checked_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(service_id) DO UPDATE SET
                role = excluded.role,
                consecutive_failures = excluded.consecutive_failures,
                last_checked_at = excluded.last_checked_at,
                status = excluded.status",
            params![
                health.service_id.as_str(),
                health.role.to_string(),
                health.consecutive_failures,
                health.last_checked_at,
                health.status.to_string(),
            ],
        )?;
        Ok(())
    }

    fn load_health(&self) -> Result<Vec<ServiceHealth>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT service_id, role, consecutive_failures, last_checked_at, status
             FROM service_health ORDER BY service_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, Option<u64>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(service_id, role, failures, last_checked_at, status)| {
                Ok(ServiceHealth {
                    service_id: ServiceId::new(service_id),
                    role: role.parse().map_err(|e| Self::corrupt("role", e))?,
                    consecutive_failures: failures,
                    last_checked_at,
                    status: status.parse().map_err(|e| Self::corrupt("status", e))?,
                })
            })
            .collect()
    }
}
