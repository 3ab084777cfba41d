//! CADENCE Test Utilities
//!
//! Shared test infrastructure for the CADENCE workspace:
//! - Proptest generators for owners, dates, schedules and facts
//! - Fixtures for common registry scenarios
//! - Custom assertions for registry invariants

// Re-export core and storage types for convenience
pub use cadence_core::{
    CadenceError, CadenceResult, EntityType, Fact, FactId, FactUpdate, FactValue, Frame, FrameUnit, Interval,
    LocalZone, Owner, RepeatingSchedule, Schedule, ScheduleKey, Source, SourceId, SourceKind,
    StorageError, Timestamp,
};
pub use cadence_storage::{InMemoryStore, Registry, RegistryStore};

use chrono::NaiveDate;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating CADENCE types.

    use super::*;
    use proptest::prelude::*;

    /// Generate an owner tag from a small pool, so collisions are common.
    pub fn arb_owner() -> impl Strategy<Value = Owner> {
        prop::sample::select(vec!["summary", "impulse", "activity", "monitor"])
            .prop_map(Owner::new)
    }

    /// Generate a date within 2020-2030.
    pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (0i64..3650).prop_map(|offset| {
            let base = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();
            base + chrono::Duration::days(offset)
        })
    }

    /// Generate a Timestamp (DateTime<Utc>) within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_default()
        })
    }

    /// Generate a repeating schedule of days, weeks or months.
    pub fn arb_schedule() -> impl Strategy<Value = RepeatingSchedule> {
        (
            1u32..4,
            prop_oneof![
                Just(FrameUnit::Day),
                Just(FrameUnit::Week),
                Just(FrameUnit::Month),
            ],
        )
            .prop_map(|(count, unit)| {
                RepeatingSchedule::new(count, unit).unwrap_or_else(|_| RepeatingSchedule::daily())
            })
    }

    /// Generate a fact value.
    pub fn arb_fact_value() -> impl Strategy<Value = FactValue> {
        prop_oneof![
            any::<i64>().prop_map(FactValue::Integer),
            (-1.0e6f64..1.0e6).prop_map(FactValue::Float),
            "[a-z ]{0,16}".prop_map(FactValue::Text),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built registries for common testing scenarios.

    use super::*;

    /// Date helper for fixtures and tests.
    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    /// Noon UTC on `date`.
    pub fn noon(date: NaiveDate) -> Timestamp {
        LocalZone::utc().local_date_to_time(date) + chrono::Duration::hours(12)
    }

    /// A valued reading owned by `source` at `time`.
    pub fn reading(source: SourceId, time: Timestamp) -> Fact {
        Fact::new(
            source,
            Owner::new("diary"),
            "Rest HR",
            Some(time),
            Some(FactValue::Integer(48)),
        )
    }

    /// A UTC registry with interval invalidation over an in-memory store.
    pub fn registry() -> Registry {
        Registry::with_interval_invalidation(InMemoryStore::new(), LocalZone::utc())
    }

    /// Days D1, D2 and D3 of the daily scenario.
    pub fn scenario_days() -> [NaiveDate; 3] {
        [date(2024, 3, 1), date(2024, 3, 2), date(2024, 3, 3)]
    }

    /// A registry with one plain source holding a reading at noon on each of
    /// D1, D2 and D3, plus a constant at the epoch. Returns the registry and
    /// the plain source's id.
    pub fn daily_scenario() -> (Registry, SourceId) {
        let registry = registry();
        let mut txn = registry.begin();
        let source = txn.add_source(Source::plain());
        for day in scenario_days() {
            txn.add_fact(reading(source, noon(day)));
        }
        let constants = txn.add_source(Source::new(SourceKind::Constant));
        txn.add_fact(Fact::new(
            constants,
            Owner::new("constants"),
            "FTHR",
            Some(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH),
            Some(FactValue::Integer(160)),
        ));
        if let Err(e) = txn.commit() {
            panic!("daily scenario setup failed: {e}");
        }
        (registry, source)
    }

    /// Persist an interval for every frame given.
    pub fn persist_frames(
        registry: &Registry,
        schedule: &dyn Schedule,
        owner: &Owner,
        frames: &[Frame],
    ) -> CadenceResult<()> {
        let mut txn = registry.begin();
        for frame in frames {
            txn.add_interval(schedule, owner.clone(), frame.start)?;
        }
        txn.commit().map(|_| ())
    }

    /// Collect every missing frame, panicking on error.
    pub fn missing(registry: &Registry, schedule: &dyn Schedule, owner: &Owner) -> Vec<Frame> {
        match registry
            .missing_frames(schedule, owner, None)
            .and_then(cadence_storage::collect_frames)
        {
            Ok(frames) => frames,
            Err(e) => panic!("gap detection failed: {e}"),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for registry invariants.

    use super::*;
    use std::collections::BTreeMap;

    /// Assert that a CadenceResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CadenceResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a CadenceResult is the NoFactsYet condition.
    #[track_caller]
    pub fn assert_no_facts_yet<T: std::fmt::Debug>(result: &CadenceResult<T>) {
        match result {
            Err(e) if e.is_no_facts_yet() => {}
            other => panic!("Expected NoFactsYet, got: {:?}", other),
        }
    }

    /// Assert that a CadenceResult is a NotFound storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CadenceResult<T>, entity_type: EntityType) {
        match result {
            Err(CadenceError::Storage(StorageError::NotFound { entity_type: et, .. })) => {
                assert_eq!(*et, entity_type, "Wrong entity type in NotFound error");
            }
            other => panic!("Expected NotFound error for {:?}, got: {:?}", entity_type, other),
        }
    }

    /// Assert that no two stored intervals of the same `(schedule, owner)`
    /// overlap.
    #[track_caller]
    pub fn assert_no_overlaps(store: &dyn RegistryStore) {
        let intervals = match store.all_intervals() {
            Ok(intervals) => intervals,
            Err(e) => panic!("Failed to list intervals: {e}"),
        };
        let mut chains: BTreeMap<(ScheduleKey, Owner), Vec<Interval>> = BTreeMap::new();
        for record in intervals {
            let interval = record.interval;
            chains
                .entry((interval.schedule.clone(), interval.owner.clone()))
                .or_default()
                .push(interval);
        }
        for ((schedule, owner), mut chain) in chains {
            chain.sort_by_key(|i| i.start);
            for pair in chain.windows(2) {
                assert!(
                    pair[0].finish <= pair[1].start,
                    "Overlapping intervals for {schedule}/{owner}: {} and {}",
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    /// Assert the interval starts stored for `(schedule, owner)`.
    #[track_caller]
    pub fn assert_interval_starts(
        store: &dyn RegistryStore,
        schedule: &dyn Schedule,
        owner: &Owner,
        expected: &[NaiveDate],
    ) {
        let starts: Vec<NaiveDate> = match store.intervals_for(&schedule.key(), owner) {
            Ok(records) => records.into_iter().map(|r| r.interval.start).collect(),
            Err(e) => panic!("Failed to list intervals: {e}"),
        };
        assert_eq!(starts, expected, "Unexpected interval starts for {owner}");
    }
}
