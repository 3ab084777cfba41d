//! Gap detection.
//!
//! Finds the frames of a schedule, between the first and last counting
//! fact, that have no interval for an owner. Every call starts from current
//! committed state; nothing is cached between calls.
//!
//! The search starts from the open ends of existing interval chains (a
//! finish date with no interval starting there), plus the frame holding the
//! first fact when no chain covers it, and walks forward from each until it
//! meets an existing interval or passes the last fact.

use std::collections::{HashSet, VecDeque};

use crate::RegistryStore;
use cadence_core::{
    CadenceError, CadenceResult, Frame, GapError, LocalZone, Owner, Schedule, ScheduleError,
    ScheduleKey, Timestamp,
};
use chrono::NaiveDate;

/// Earliest and latest counting fact times, or [`GapError::NoFactsYet`].
pub fn raw_fact_range(
    store: &dyn RegistryStore,
    fact_owner: Option<&Owner>,
) -> CadenceResult<(Timestamp, Timestamp)> {
    let range = store.fact_time_range(fact_owner)?;
    match (range.start, range.finish) {
        (Some(start), Some(finish)) => Ok((start, finish)),
        _ => Err(GapError::NoFactsYet {
            fact_owner: fact_owner.cloned(),
        }
        .into()),
    }
}

/// Finish dates of `(schedule, owner)` intervals with no interval starting
/// on them, ascending.
pub fn open_chain_ends(
    store: &dyn RegistryStore,
    schedule: &ScheduleKey,
    owner: &Owner,
) -> CadenceResult<Vec<NaiveDate>> {
    let intervals = store.intervals_for(schedule, owner)?;
    let starts: HashSet<NaiveDate> = intervals.iter().map(|r| r.interval.start).collect();
    let mut ends: Vec<NaiveDate> = intervals
        .iter()
        .map(|r| r.interval.finish)
        .filter(|finish| !starts.contains(finish))
        .collect();
    ends.sort();
    ends.dedup();
    Ok(ends)
}

/// Chain starts to walk, and the local date of the latest fact.
fn missing_starts(
    store: &dyn RegistryStore,
    zone: &LocalZone,
    schedule: &dyn Schedule,
    owner: &Owner,
    fact_owner: Option<&Owner>,
) -> CadenceResult<(Vec<NaiveDate>, NaiveDate)> {
    let (first, last) = raw_fact_range(store, fact_owner)?;
    tracing::debug!(start = %first, finish = %last, "Facts exist");

    let key = schedule.key();
    let mut starts = open_chain_ends(store, &key, owner)?;
    let stats_start = schedule.start_of_frame(zone.to_local_date(first));
    let uncovered = starts.first().map_or(true, |s| *s > stats_start);
    if uncovered && store.interval_at(&key, owner, stats_start)?.is_none() {
        starts.insert(0, stats_start);
    }

    let finish = zone.to_local_date(last);
    tracing::debug!(
        schedule = %key,
        owner = %owner,
        blocks = starts.len(),
        finish = %finish,
        "Open blocks"
    );
    for (i, start) in starts.iter().enumerate() {
        tracing::trace!(block = i, start = %start, "Block start");
    }
    Ok((starts, finish))
}

/// Lazy, ascending sequence of missing frames.
///
/// Each step checks the store for an interval at the next start, so the
/// sequence reflects committed state as it is consumed. After an error the
/// iterator is exhausted.
pub struct MissingFrames<'a> {
    store: &'a dyn RegistryStore,
    schedule: &'a dyn Schedule,
    key: ScheduleKey,
    owner: Owner,
    finish: NaiveDate,
    starts: VecDeque<NaiveDate>,
    current: Option<NaiveDate>,
    // True once the walk has stepped onto `current` and must check it.
    stepped: bool,
    done: bool,
}

impl<'a> MissingFrames<'a> {
    /// Local date of the latest counting fact.
    pub fn finish(&self) -> NaiveDate {
        self.finish
    }

    fn step(&mut self) -> CadenceResult<Option<Frame>> {
        loop {
            let start = match self.current {
                Some(start) => start,
                None => match self.starts.pop_front() {
                    Some(start) => {
                        self.current = Some(start);
                        self.stepped = false;
                        start
                    }
                    None => return Ok(None),
                },
            };

            if self.stepped
                && self
                    .store
                    .interval_at(&self.key, &self.owner, start)?
                    .is_some()
            {
                self.current = None;
                continue;
            }
            if start > self.finish {
                self.current = None;
                continue;
            }

            let next = self.schedule.next_frame(start);
            if next <= start {
                return Err(ScheduleError::NotAdvancing {
                    schedule: self.key.clone(),
                    date: start,
                }
                .into());
            }
            self.current = Some(next);
            self.stepped = true;
            tracing::debug!(start = %start, finish = %next, "Missing interval");
            return Ok(Some(Frame::new(start, next)));
        }
    }
}

impl Iterator for MissingFrames<'_> {
    type Item = CadenceResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for MissingFrames<'_> {}

/// Frames of `schedule` with no interval for `owner`, over the span of
/// counting facts (optionally only those produced by `fact_owner`).
///
/// Fails with [`GapError::NoFactsYet`] when there are no counting facts,
/// which means "not ready", never "fully covered".
pub fn missing_frames<'a>(
    store: &'a dyn RegistryStore,
    zone: &LocalZone,
    schedule: &'a dyn Schedule,
    owner: &Owner,
    fact_owner: Option<&Owner>,
) -> CadenceResult<MissingFrames<'a>> {
    let (starts, finish) = missing_starts(store, zone, schedule, owner, fact_owner)?;
    Ok(MissingFrames {
        store,
        schedule,
        key: schedule.key(),
        owner: owner.clone(),
        finish,
        starts: starts.into(),
        current: None,
        stepped: false,
        done: false,
    })
}

/// The first open start and the local date of the latest fact, for callers
/// that only ever recompute forwards. `None` when nothing is open.
pub fn first_missing_date(
    store: &dyn RegistryStore,
    zone: &LocalZone,
    schedule: &dyn Schedule,
    owner: &Owner,
    fact_owner: Option<&Owner>,
) -> CadenceResult<Option<(NaiveDate, NaiveDate)>> {
    let (starts, finish) = missing_starts(store, zone, schedule, owner, fact_owner)?;
    Ok(starts.first().map(|start| (*start, finish)))
}

/// Collect a missing-frame sequence, stopping at the first error.
pub fn collect_frames(frames: MissingFrames<'_>) -> CadenceResult<Vec<Frame>> {
    frames.collect::<Result<Vec<_>, CadenceError>>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStore, PendingChanges};
    use cadence_core::{
        Fact, FactValue, FrameUnit, Interval, RepeatingSchedule, Source,
    };

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn store_with_facts(times: &[&str]) -> InMemoryStore {
        let store = InMemoryStore::new();
        let source = Source::plain();
        let facts = times
            .iter()
            .map(|t| {
                Fact::new(
                    source.source_id,
                    Owner::new("diary"),
                    "Rest HR",
                    Some(t.parse().unwrap()),
                    Some(FactValue::Integer(50)),
                )
            })
            .collect();
        store
            .apply(&PendingChanges {
                new_sources: vec![source],
                new_facts: facts,
                ..Default::default()
            })
            .unwrap();
        store
    }

    fn add_intervals(store: &InMemoryStore, schedule: &dyn Schedule, owner: &str, starts: &[NaiveDate]) {
        let sources = starts
            .iter()
            .map(|s| Source::interval(Interval::for_frame(schedule, Owner::new(owner), *s).unwrap()))
            .collect();
        store
            .apply(&PendingChanges {
                new_sources: sources,
                ..Default::default()
            })
            .unwrap();
    }

    fn frames(store: &InMemoryStore, schedule: &dyn Schedule, owner: &str) -> Vec<Frame> {
        collect_frames(
            missing_frames(store, &LocalZone::utc(), schedule, &Owner::new(owner), None).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_no_facts_yet() {
        let store = InMemoryStore::new();
        let daily = RepeatingSchedule::daily();
        let err = missing_frames(&store, &LocalZone::utc(), &daily, &Owner::new("o"), None)
            .err()
            .unwrap();
        assert!(err.is_no_facts_yet());
    }

    #[test]
    fn test_open_chain_ends() {
        let store = InMemoryStore::new();
        let daily = RepeatingSchedule::daily();
        add_intervals(
            &store,
            &daily,
            "o",
            &[d(2024, 1, 1), d(2024, 1, 2), d(2024, 1, 5), d(2024, 1, 9)],
        );
        add_intervals(&store, &daily, "other", &[d(2024, 1, 3)]);

        let ends = open_chain_ends(&store, &daily.key(), &Owner::new("o")).unwrap();
        assert_eq!(ends, vec![d(2024, 1, 3), d(2024, 1, 6), d(2024, 1, 10)]);
    }

    #[test]
    fn test_fills_holes_between_chains() {
        let store = store_with_facts(&["2024-01-01T10:00:00Z", "2024-01-08T10:00:00Z"]);
        let daily = RepeatingSchedule::daily();
        add_intervals(
            &store,
            &daily,
            "o",
            &[d(2024, 1, 1), d(2024, 1, 2), d(2024, 1, 5)],
        );

        let starts: Vec<NaiveDate> = frames(&store, &daily, "o").iter().map(|f| f.start).collect();
        assert_eq!(
            starts,
            vec![d(2024, 1, 3), d(2024, 1, 4), d(2024, 1, 6), d(2024, 1, 7), d(2024, 1, 8)]
        );
    }

    #[test]
    fn test_seeds_first_frame_before_existing_chain() {
        let store = store_with_facts(&["2024-01-01T10:00:00Z", "2024-01-03T10:00:00Z"]);
        let daily = RepeatingSchedule::daily();
        add_intervals(&store, &daily, "o", &[d(2024, 1, 2)]);

        assert_eq!(
            frames(&store, &daily, "o"),
            vec![
                Frame::new(d(2024, 1, 1), d(2024, 1, 2)),
                Frame::new(d(2024, 1, 3), d(2024, 1, 4)),
            ]
        );
    }

    #[test]
    fn test_weekly_frames_align_to_monday() {
        // 2024-01-03 is a Wednesday.
        let store = store_with_facts(&["2024-01-03T10:00:00Z", "2024-01-10T10:00:00Z"]);
        let weekly = RepeatingSchedule::weekly();

        assert_eq!(
            frames(&store, &weekly, "o"),
            vec![
                Frame::new(d(2024, 1, 1), d(2024, 1, 8)),
                Frame::new(d(2024, 1, 8), d(2024, 1, 15)),
            ]
        );
    }

    #[test]
    fn test_first_missing_date() {
        let store = store_with_facts(&["2024-01-01T10:00:00Z", "2024-01-04T10:00:00Z"]);
        let daily = RepeatingSchedule::daily();
        let owner = Owner::new("o");
        let zone = LocalZone::utc();

        assert_eq!(
            first_missing_date(&store, &zone, &daily, &owner, None).unwrap(),
            Some((d(2024, 1, 1), d(2024, 1, 4)))
        );

        add_intervals(&store, &daily, "o", &[d(2024, 1, 1), d(2024, 1, 2)]);
        assert_eq!(
            first_missing_date(&store, &zone, &daily, &owner, None).unwrap(),
            Some((d(2024, 1, 3), d(2024, 1, 4)))
        );
    }

    #[test]
    fn test_fact_owner_filter_narrows_range() {
        let store = store_with_facts(&["2024-01-01T10:00:00Z", "2024-01-02T10:00:00Z"]);
        let daily = RepeatingSchedule::daily();
        let err = missing_frames(
            &store,
            &LocalZone::utc(),
            &daily,
            &Owner::new("o"),
            Some(&Owner::new("importer")),
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            CadenceError::Gap(GapError::NoFactsYet {
                fact_owner: Some(Owner::new("importer"))
            })
        );
    }

    #[derive(Debug)]
    struct Stuck;

    impl Schedule for Stuck {
        fn key(&self) -> ScheduleKey {
            ScheduleKey::new("stuck")
        }

        fn start_of_frame(&self, date: NaiveDate) -> NaiveDate {
            date
        }

        fn next_frame(&self, date: NaiveDate) -> NaiveDate {
            date
        }
    }

    #[test]
    fn test_stalled_schedule_errors_once() {
        let store = store_with_facts(&["2024-01-01T10:00:00Z"]);
        let mut frames =
            missing_frames(&store, &LocalZone::utc(), &Stuck, &Owner::new("o"), None).unwrap();

        assert!(matches!(
            frames.next(),
            Some(Err(CadenceError::Schedule(ScheduleError::NotAdvancing { .. })))
        ));
        assert!(frames.next().is_none());
    }

    #[test]
    fn test_multi_day_schedule() {
        let store = store_with_facts(&["2024-01-02T10:00:00Z", "2024-01-05T10:00:00Z"]);
        let two_day = RepeatingSchedule::new(2, FrameUnit::Day).unwrap();
        let found = frames(&store, &two_day, "o");
        assert!(!found.is_empty());
        assert!(found[0].start <= d(2024, 1, 2));
        assert!(found.last().unwrap().finish > d(2024, 1, 5));
        for pair in found.windows(2) {
            assert_eq!(pair[0].finish, pair[1].start);
        }
    }
}
