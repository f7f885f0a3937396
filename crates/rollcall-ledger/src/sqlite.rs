//! SQLite-backed ledger.
//!
//! Uniqueness lives in the schema (`UNIQUE(context_id, identity, day)`), and
//! `record` is a single `INSERT … ON CONFLICT DO NOTHING`, so concurrent
//! writers (threads or processes sharing the file) cannot produce two rows.

use crate::types::{AttendanceMark, ContextId, LedgerError, RecordOutcome};
use crate::AttendanceLedger;
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const CURRENT_SCHEMA_VERSION: i32 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const DAY_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

pub struct SqliteLedger {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteLedger {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        if let Err(e) =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        {
            tracing::warn!(error = %e, "failed to enable WAL mode");
        }
        run_migrations(&mut conn)?;

        tracing::info!(path = %path.display(), "attendance ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn run_migrations(conn: &mut Connection) -> Result<(), LedgerError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(LedgerError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    if version < 1 {
        tx.execute_batch(include_str!("schemas/schema_v1.sql"))?;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    tracing::debug!(from = version, to = CURRENT_SCHEMA_VERSION, "ledger schema migrated");
    Ok(())
}

fn row_to_mark(row: &Row) -> Result<AttendanceMark, LedgerError> {
    let day: String = row.get("day")?;
    let time: String = row.get("time")?;

    Ok(AttendanceMark {
        context_id: row.get("context_id")?,
        identity: row.get("identity")?,
        day: NaiveDate::parse_from_str(&day, DAY_FORMAT)
            .map_err(|e| LedgerError::Corrupt(format!("day '{day}': {e}")))?,
        time: NaiveTime::parse_from_str(&time, TIME_FORMAT)
            .map_err(|e| LedgerError::Corrupt(format!("time '{time}': {e}")))?,
    })
}

impl AttendanceLedger for SqliteLedger {
    fn record(
        &self,
        context_id: ContextId,
        identity: &str,
        day: NaiveDate,
        time: NaiveTime,
    ) -> Result<RecordOutcome, LedgerError> {
        let changed = self.conn().execute(
            "INSERT INTO attendance (context_id, identity, day, time)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (context_id, identity, day) DO NOTHING",
            params![
                context_id,
                identity,
                day.format(DAY_FORMAT).to_string(),
                time.format(TIME_FORMAT).to_string(),
            ],
        )?;

        Ok(if changed == 0 {
            RecordOutcome::AlreadyExists
        } else {
            RecordOutcome::Created
        })
    }

    fn records_for(&self, context_id: ContextId) -> Result<Vec<AttendanceMark>, LedgerError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT context_id, identity, day, time
             FROM attendance
             WHERE context_id = ?1
             ORDER BY day DESC, time DESC, identity ASC",
        )?;

        let mut rows = stmt.query(params![context_id])?;
        let mut marks = Vec::new();
        while let Some(row) = rows.next()? {
            marks.push(row_to_mark(row)?);
        }
        Ok(marks)
    }

    fn remove(
        &self,
        context_id: ContextId,
        identity: &str,
        day: NaiveDate,
    ) -> Result<bool, LedgerError> {
        let deleted = self.conn().execute(
            "DELETE FROM attendance WHERE context_id = ?1 AND identity = ?2 AND day = ?3",
            params![context_id, identity, day.format(DAY_FORMAT).to_string()],
        )?;
        Ok(deleted > 0)
    }

    fn contexts(&self) -> Result<Vec<ContextId>, LedgerError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT context_id FROM attendance ORDER BY context_id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<ContextId>, _>>()?;
        Ok(ids)
    }
}
