//! Source time ranges.
//!
//! Each source kind reports the span of time it is responsible for. The
//! invalidation hook reads this when a non-interval source is deleted.

use crate::RegistryStore;
use cadence_core::{CadenceResult, LocalZone, Source, SourceError, SourceKind, TimeRange};
use chrono::Days;

/// The `(earliest, latest)` instants a source owns, or an empty range.
///
/// Plain sources are measured from the facts they own as currently stored,
/// so the range must be taken before the deletion is applied.
pub fn time_range(
    source: &Source,
    store: &dyn RegistryStore,
    zone: &LocalZone,
) -> CadenceResult<TimeRange> {
    match &source.kind {
        SourceKind::Plain => {
            let mut range = TimeRange::EMPTY;
            for fact in store.facts_by_source(source.source_id)? {
                if let Some(time) = fact.counting_time() {
                    range.extend_point(time);
                }
            }
            Ok(range)
        }
        SourceKind::Activity { start, finish } | SourceKind::Monitor { start, finish } => {
            Ok(TimeRange::new(Some(*start), Some(*finish)))
        }
        SourceKind::Journal { date } => {
            let next = date.checked_add_days(Days::new(1)).unwrap_or(*date);
            Ok(TimeRange::new(
                Some(zone.local_date_to_time(*date)),
                Some(zone.local_date_to_time(next)),
            ))
        }
        SourceKind::Constant => Ok(TimeRange::EMPTY),
        SourceKind::Interval(interval) => Ok(TimeRange::new(
            Some(zone.local_date_to_time(interval.start)),
            Some(zone.local_date_to_time(interval.finish)),
        )),
        SourceKind::Opaque { kind } => Err(SourceError::TimeRangeUnsupported {
            source_id: source.source_id.as_uuid(),
            kind: kind.clone(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStore, PendingChanges};
    use cadence_core::{
        CadenceError, Fact, FactValue, Interval, Owner, RepeatingSchedule, Timestamp,
    };
    use chrono::{FixedOffset, NaiveDate};

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn fact_at(source: &Source, time: Option<&str>) -> Fact {
        Fact::new(
            source.source_id,
            Owner::new("diary"),
            "Weight",
            time.map(ts),
            Some(FactValue::Float(70.0)),
        )
    }

    #[test]
    fn test_plain_range_spans_counting_facts() {
        let store = InMemoryStore::new();
        let source = Source::plain();
        store
            .apply(&PendingChanges {
                new_sources: vec![source.clone()],
                new_facts: vec![
                    fact_at(&source, Some("2024-02-03T08:00:00Z")),
                    fact_at(&source, Some("2024-02-01T08:00:00Z")),
                    fact_at(&source, Some("1970-01-01T00:00:00Z")),
                    fact_at(&source, None),
                ],
                ..Default::default()
            })
            .unwrap();

        let range = time_range(&source, &store, &LocalZone::utc()).unwrap();
        assert_eq!(range.start, Some(ts("2024-02-01T08:00:00Z")));
        assert_eq!(range.finish, Some(ts("2024-02-03T08:00:00Z")));
    }

    #[test]
    fn test_plain_source_without_facts_is_empty() {
        let store = InMemoryStore::new();
        let range = time_range(&Source::plain(), &store, &LocalZone::utc()).unwrap();
        assert!(range.is_empty());
    }

    #[test]
    fn test_journal_covers_local_day() {
        let store = InMemoryStore::new();
        let zone = LocalZone::new("UTC-3", FixedOffset::west_opt(3 * 3600).unwrap());
        let date = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let source = Source::new(SourceKind::Journal { date });

        let range = time_range(&source, &store, &zone).unwrap();
        assert_eq!(range.start, Some(ts("2024-05-10T03:00:00Z")));
        assert_eq!(range.finish, Some(ts("2024-05-11T03:00:00Z")));
    }

    #[test]
    fn test_explicit_and_empty_kinds() {
        let store = InMemoryStore::new();
        let zone = LocalZone::utc();
        let start = ts("2024-05-10T06:00:00Z");
        let finish = ts("2024-05-10T07:15:00Z");

        let activity = Source::new(SourceKind::Activity { start, finish });
        assert_eq!(
            time_range(&activity, &store, &zone).unwrap(),
            TimeRange::new(Some(start), Some(finish))
        );

        let constant = Source::new(SourceKind::Constant);
        assert!(time_range(&constant, &store, &zone).unwrap().is_empty());

        let interval = Source::interval(Interval::for_frame(
            &RepeatingSchedule::weekly(),
            Owner::new("summary"),
            NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(),
        )
        .unwrap());
        assert_eq!(
            time_range(&interval, &store, &zone).unwrap(),
            TimeRange::new(
                Some(ts("2024-05-06T00:00:00Z")),
                Some(ts("2024-05-13T00:00:00Z"))
            )
        );
    }

    #[test]
    fn test_opaque_source_is_an_error() {
        let store = InMemoryStore::new();
        let source = Source::new(SourceKind::Opaque {
            kind: "segment".to_string(),
        });
        let err = time_range(&source, &store, &LocalZone::utc()).unwrap_err();
        assert!(matches!(
            err,
            CadenceError::Source(SourceError::TimeRangeUnsupported { .. })
        ));
    }
}
