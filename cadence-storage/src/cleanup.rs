//! Bulk interval cleanup.
//!
//! Forced recomputation removes intervals explicitly. Each operation is its
//! own transaction through the commit path, so cascades and hooks behave
//! exactly as for any other write.

use crate::session::Registry;
use crate::RegistryStore;
use cadence_core::{CadenceResult, IntervalRecord, Owner, Timestamp};
use chrono::NaiveDate;

/// Intervals touching the inclusive date range `[start, finish]`, optionally
/// restricted to one owner.
pub fn intervals_in_dates(
    store: &dyn RegistryStore,
    start: NaiveDate,
    finish: NaiveDate,
    owner: Option<&Owner>,
) -> CadenceResult<Vec<IntervalRecord>> {
    store.intervals_overlapping(start, finish, owner)
}

impl Registry {
    /// Delete every interval of every schedule and owner, and the facts
    /// computed into them. Returns the number of intervals removed.
    pub fn delete_all_intervals(&self) -> CadenceResult<usize> {
        tracing::warn!("Deleting all intervals");
        let intervals = self.store().all_intervals()?;
        self.delete_intervals(intervals)
    }

    /// Delete intervals touching `[start, finish]`. Returns the number removed.
    pub fn clean_dates(
        &self,
        start: NaiveDate,
        finish: NaiveDate,
        owner: Option<&Owner>,
    ) -> CadenceResult<usize> {
        let intervals = intervals_in_dates(self.store(), start, finish, owner)?;
        tracing::debug!(
            start = %start,
            finish = %finish,
            owner = owner.map(|o| o.as_str()),
            count = intervals.len(),
            "Cleaning intervals by date"
        );
        self.delete_intervals(intervals)
    }

    /// Delete intervals touching the local dates of `[start, finish]`.
    pub fn clean_times(
        &self,
        start: Timestamp,
        finish: Timestamp,
        owner: Option<&Owner>,
    ) -> CadenceResult<usize> {
        let zone = self.zone();
        self.clean_dates(zone.to_local_date(start), zone.to_local_date(finish), owner)
    }

    fn delete_intervals(&self, intervals: Vec<IntervalRecord>) -> CadenceResult<usize> {
        if intervals.is_empty() {
            return Ok(0);
        }
        let mut txn = self.begin();
        for record in &intervals {
            txn.delete_source(record.source_id);
        }
        let report = txn.commit()?;
        Ok(report.intervals_deleted)
    }
}

#[cfg(test)]
mod tests {
    use crate::{InMemoryStore, Registry, RegistryStore};
    use cadence_core::{
        Fact, FactValue, LocalZone, Owner, RepeatingSchedule, Timestamp,
    };
    use chrono::{FixedOffset, NaiveDate};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn seeded(zone: LocalZone) -> Registry {
        let registry = Registry::with_interval_invalidation(InMemoryStore::new(), zone);
        let daily = RepeatingSchedule::daily();
        let weekly = RepeatingSchedule::weekly();
        let mut txn = registry.begin();
        for day in 1..=5 {
            txn.add_interval(&daily, Owner::new("a"), d(2024, 1, day)).unwrap();
            txn.add_interval(&daily, Owner::new("b"), d(2024, 1, day)).unwrap();
        }
        let week = txn.add_interval(&weekly, Owner::new("a"), d(2024, 1, 1)).unwrap();
        txn.add_fact(Fact::new(
            week,
            Owner::new("a"),
            "Total distance",
            Some("2024-01-01T00:00:00Z".parse().unwrap()),
            Some(FactValue::Float(42.0)),
        ));
        txn.commit().unwrap();
        registry
    }

    #[test]
    fn test_delete_all_intervals_cascades() {
        let registry = seeded(LocalZone::utc());
        assert_eq!(registry.store().fact_count().unwrap(), 1);

        let removed = registry.delete_all_intervals().unwrap();
        assert_eq!(removed, 11);
        assert_eq!(registry.store().interval_count().unwrap(), 0);
        assert_eq!(registry.store().fact_count().unwrap(), 0);

        assert_eq!(registry.delete_all_intervals().unwrap(), 0);
    }

    #[test]
    fn test_clean_dates_with_owner() {
        let registry = seeded(LocalZone::utc());
        // Daily a frames starting Jan 2 (ends on Jan 3) and Jan 3, plus weekly a.
        let removed = registry
            .clean_dates(d(2024, 1, 3), d(2024, 1, 3), Some(&Owner::new("a")))
            .unwrap();
        assert_eq!(removed, 3);
        assert_eq!(registry.store().interval_count().unwrap(), 8);
    }

    #[test]
    fn test_clean_times_uses_local_dates() {
        // 23:30 UTC on Jan 4 is already Jan 5 at UTC+2.
        let zone = LocalZone::new("UTC+2", FixedOffset::east_opt(2 * 3600).unwrap());
        let registry = seeded(zone);
        let t: Timestamp = "2024-01-04T23:30:00Z".parse().unwrap();

        let removed = registry.clean_times(t, t, Some(&Owner::new("b"))).unwrap();
        // Daily b frames starting Jan 4 and Jan 5 both touch Jan 5.
        assert_eq!(removed, 2);
        let remaining: Vec<NaiveDate> = registry
            .store()
            .all_intervals()
            .unwrap()
            .into_iter()
            .filter(|r| r.interval.owner == Owner::new("b"))
            .map(|r| r.interval.start)
            .collect();
        assert!(!remaining.contains(&d(2024, 1, 5)));
        assert!(!remaining.contains(&d(2024, 1, 4)));
        assert_eq!(remaining.len(), 3);
    }
}
