//! Local calendar dates, the reserved first day, and time brackets.
//!
//! Facts carry UTC instants while intervals are cut on local calendar dates.
//! Every conversion between the two goes through a [`LocalZone`].

use crate::Timestamp;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Seconds in the reserved first day.
pub const RESERVED_DAY_SECONDS: i64 = 24 * 60 * 60;

/// End of the reserved first day (exclusive lower bound for counting facts).
///
/// Facts at or before this instant are placeholders: their local date is
/// ambiguous across timezones, so they never take part in range computations.
pub fn reserved_day_end() -> Timestamp {
    DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(RESERVED_DAY_SECONDS)
}

/// True if `time` falls inside the reserved first day.
pub fn is_reserved(time: Timestamp) -> bool {
    time <= reserved_day_end()
}

/// The local timezone used to map instants onto calendar dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalZone {
    name: String,
    offset: FixedOffset,
}

impl LocalZone {
    pub fn new(name: impl Into<String>, offset: FixedOffset) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }

    /// UTC, the zone used when nothing else is configured.
    pub fn utc() -> Self {
        Self::new("UTC", Utc.fix())
    }

    /// Build from an offset in seconds east of UTC.
    pub fn from_offset_seconds(name: impl Into<String>, seconds: i32) -> Option<Self> {
        FixedOffset::east_opt(seconds).map(|offset| Self::new(name, offset))
    }

    /// Label persisted for timezone-change detection.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// The local calendar date containing `time`.
    pub fn to_local_date(&self, time: Timestamp) -> NaiveDate {
        time.with_timezone(&self.offset).date_naive()
    }

    /// Local midnight at the start of `date`, as a UTC instant.
    pub fn local_date_to_time(&self, date: NaiveDate) -> Timestamp {
        let midnight = date.and_time(NaiveTime::MIN);
        // A fixed offset has no gaps or folds, so the mapping is always single.
        self.offset
            .from_local_datetime(&midnight)
            .single()
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
    }
}

impl Default for LocalZone {
    fn default() -> Self {
        Self::utc()
    }
}

/// A bracket of instants, possibly empty.
///
/// Each end is independent; an empty bracket has both ends `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<Timestamp>,
    pub finish: Option<Timestamp>,
}

impl TimeRange {
    pub const EMPTY: TimeRange = TimeRange {
        start: None,
        finish: None,
    };

    pub fn new(start: Option<Timestamp>, finish: Option<Timestamp>) -> Self {
        Self { start, finish }
    }

    /// A bracket holding a single instant.
    pub fn point(time: Timestamp) -> Self {
        Self::new(Some(time), Some(time))
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.finish.is_none()
    }

    /// Widen to include `time`.
    pub fn extend_point(&mut self, time: Timestamp) {
        self.extend(TimeRange::point(time));
    }

    /// Widen to include another bracket. Missing ends are ignored.
    pub fn extend(&mut self, other: TimeRange) {
        self.start = min_time(self.start, other.start);
        self.finish = max_time(self.finish, other.finish);
    }

    /// Both ends, if the bracket is closed. A half-open bracket is closed on
    /// its known end.
    pub fn bounds(&self) -> Option<(Timestamp, Timestamp)> {
        match (self.start, self.finish) {
            (Some(s), Some(f)) => Some((s, f)),
            (Some(s), None) => Some((s, s)),
            (None, Some(f)) => Some((f, f)),
            (None, None) => None,
        }
    }

    /// Local calendar dates of both ends.
    pub fn to_dates(&self, zone: &LocalZone) -> Option<(NaiveDate, NaiveDate)> {
        self.bounds()
            .map(|(s, f)| (zone.to_local_date(s), zone.to_local_date(f)))
    }
}

fn min_time(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_time(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
