//! rollcall-ledger — Durable attendance marks.
//!
//! The ledger is the only authority for "already marked today": every
//! implementation must turn a repeated `(context, identity, day)` into
//! [`RecordOutcome::AlreadyExists`] atomically, even under concurrent callers.

pub mod memory;
pub mod sqlite;
pub mod stats;
pub mod types;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;
pub use stats::{attendance_stats, percentage, AttendanceStat, ContextStats};
pub use types::{AttendanceMark, ContextId, LedgerError, RecordOutcome};

use chrono::{NaiveDate, NaiveTime};

/// Storage for attendance marks.
pub trait AttendanceLedger: Send + Sync {
    /// Insert a mark unless one exists for the same context, identity and day.
    ///
    /// Conflicts are reported as `Ok(AlreadyExists)`; `Err` is reserved for
    /// storage faults.
    fn record(
        &self,
        context_id: ContextId,
        identity: &str,
        day: NaiveDate,
        time: NaiveTime,
    ) -> Result<RecordOutcome, LedgerError>;

    /// All marks for a context, newest first.
    fn records_for(&self, context_id: ContextId) -> Result<Vec<AttendanceMark>, LedgerError>;

    /// Delete one mark. Returns whether a row was removed.
    fn remove(
        &self,
        context_id: ContextId,
        identity: &str,
        day: NaiveDate,
    ) -> Result<bool, LedgerError>;

    /// Contexts with at least one mark, ascending.
    fn contexts(&self) -> Result<Vec<ContextId>, LedgerError>;
}
