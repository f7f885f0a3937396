//! In-process ledger for tests and runs without a database path.

use crate::types::{AttendanceMark, ContextId, LedgerError, RecordOutcome};
use crate::AttendanceLedger;
use chrono::{NaiveDate, NaiveTime};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

type MarkKey = (ContextId, String, NaiveDate);

#[derive(Default)]
pub struct MemoryLedger {
    marks: Mutex<BTreeMap<MarkKey, NaiveTime>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn marks(&self) -> MutexGuard<'_, BTreeMap<MarkKey, NaiveTime>> {
        match self.marks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AttendanceLedger for MemoryLedger {
    fn record(
        &self,
        context_id: ContextId,
        identity: &str,
        day: NaiveDate,
        time: NaiveTime,
    ) -> Result<RecordOutcome, LedgerError> {
        match self.marks().entry((context_id, identity.to_string(), day)) {
            Entry::Occupied(_) => Ok(RecordOutcome::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(time);
                Ok(RecordOutcome::Created)
            }
        }
    }

    fn records_for(&self, context_id: ContextId) -> Result<Vec<AttendanceMark>, LedgerError> {
        let mut marks: Vec<AttendanceMark> = self
            .marks()
            .iter()
            .filter(|((ctx, _, _), _)| *ctx == context_id)
            .map(|((ctx, identity, day), time)| AttendanceMark {
                context_id: *ctx,
                identity: identity.clone(),
                day: *day,
                time: *time,
            })
            .collect();
        marks.sort_by(AttendanceMark::newest_first);
        Ok(marks)
    }

    fn remove(
        &self,
        context_id: ContextId,
        identity: &str,
        day: NaiveDate,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .marks()
            .remove(&(context_id, identity.to_string(), day))
            .is_some())
    }

    fn contexts(&self) -> Result<Vec<ContextId>, LedgerError> {
        let mut ids: Vec<ContextId> = self.marks().keys().map(|(ctx, _, _)| *ctx).collect();
        ids.dedup();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_duplicate_is_already_exists() {
        let ledger = MemoryLedger::new();
        let t = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert_eq!(
            ledger.record(1, "ada", day("2024-05-06"), t).unwrap(),
            RecordOutcome::Created
        );
        assert_eq!(
            ledger.record(1, "ada", day("2024-05-06"), t).unwrap(),
            RecordOutcome::AlreadyExists
        );
        assert_eq!(ledger.records_for(1).unwrap().len(), 1);
    }

    #[test]
    fn test_records_newest_first_and_scoped() {
        let ledger = MemoryLedger::new();
        let early = NaiveTime::from_hms_opt(8, 0, 0).unwrap();
        let late = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        ledger.record(1, "ada", day("2024-05-06"), late).unwrap();
        ledger.record(1, "bo", day("2024-05-07"), early).unwrap();
        ledger.record(1, "cy", day("2024-05-07"), late).unwrap();
        ledger.record(2, "dee", day("2024-05-09"), late).unwrap();

        let names: Vec<String> = ledger
            .records_for(1)
            .unwrap()
            .into_iter()
            .map(|m| m.identity)
            .collect();
        assert_eq!(names, ["cy", "bo", "ada"]);
        assert_eq!(ledger.contexts().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_remove() {
        let ledger = MemoryLedger::new();
        let t = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        ledger.record(1, "ada", day("2024-05-06"), t).unwrap();
        assert!(ledger.remove(1, "ada", day("2024-05-06")).unwrap());
        assert!(!ledger.remove(1, "ada", day("2024-05-06")).unwrap());
        assert!(ledger.contexts().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_record_single_winner() {
        let ledger = Arc::new(MemoryLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let t = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
                    ledger.record(5, "ada", day("2024-05-06"), t).unwrap()
                })
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == RecordOutcome::Created)
            .count();
        assert_eq!(created, 1);
    }
}
