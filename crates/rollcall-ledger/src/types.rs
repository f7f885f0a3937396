use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Identifier of the tracked context (class, subject, meeting series).
pub type ContextId = i64;

/// One person present in one context on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceMark {
    pub context_id: ContextId,
    pub identity: String,
    pub day: NaiveDate,
    pub time: NaiveTime,
}

impl AttendanceMark {
    /// Newest first; identity breaks ties so listings are stable.
    pub(crate) fn newest_first(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.day
            .cmp(&a.day)
            .then(b.time.cmp(&a.time))
            .then(a.identity.cmp(&b.identity))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("database schema version {found} is newer than supported ({supported})")]
    SchemaTooNew { found: i32, supported: i32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mark(identity: &str, day: &str, time: &str) -> AttendanceMark {
        AttendanceMark {
            context_id: 1,
            identity: identity.into(),
            day: day.parse().unwrap(),
            time: time.parse().unwrap(),
        }
    }

    #[test]
    fn test_newest_first_ordering() {
        let mut marks = vec![
            mark("bob", "2024-03-01", "09:00:00"),
            mark("amy", "2024-03-02", "08:00:00"),
            mark("cat", "2024-03-02", "10:00:00"),
            mark("abe", "2024-03-02", "10:00:00"),
        ];
        marks.sort_by(AttendanceMark::newest_first);
        let names: Vec<&str> = marks.iter().map(|m| m.identity.as_str()).collect();
        assert_eq!(names, ["abe", "cat", "amy", "bob"]);
    }

    #[test]
    fn test_mark_serializes_plain_dates() {
        let json = serde_json::to_value(mark("amy", "2024-03-02", "08:15:00")).unwrap();
        assert_eq!(json["day"], "2024-03-02");
        assert_eq!(json["time"], "08:15:00");
    }
}
