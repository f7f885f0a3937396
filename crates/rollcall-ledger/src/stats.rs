//! Attendance percentages, computed fresh from the ledger on every call.

use crate::types::{ContextId, LedgerError};
use crate::AttendanceLedger;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceStat {
    pub identity: String,
    pub attended: u32,
    pub total: u32,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextStats {
    pub context_id: ContextId,
    /// Distinct days with at least one mark.
    pub total_days: u32,
    /// Sorted by identity.
    pub people: Vec<AttendanceStat>,
}

/// `attended / total * 100` to one decimal place; 0 when nothing was held.
pub fn percentage(attended: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (attended as f64 / total as f64 * 1000.0).round() / 10.0
}

/// Per-person attendance for a context.
///
/// Everyone in `roster` is listed even with no marks; identities that were
/// marked but have since left the roster are listed too.
pub fn attendance_stats<L, I, S>(
    ledger: &L,
    context_id: ContextId,
    roster: I,
) -> Result<ContextStats, LedgerError>
where
    L: AttendanceLedger + ?Sized,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let marks = ledger.records_for(context_id)?;

    let days: BTreeSet<_> = marks.iter().map(|m| m.day).collect();
    let total_days = days.len() as u32;

    let mut attended: BTreeMap<String, u32> = roster
        .into_iter()
        .map(|name| (name.as_ref().to_string(), 0))
        .collect();
    for mark in &marks {
        *attended.entry(mark.identity.clone()).or_insert(0) += 1;
    }

    let people = attended
        .into_iter()
        .map(|(identity, attended)| AttendanceStat {
            identity,
            attended,
            total: total_days,
            percentage: percentage(attended, total_days),
        })
        .collect();

    Ok(ContextStats {
        context_id,
        total_days,
        people,
    })
}
