//! Sources and intervals.
//!
//! A [`Source`] is a row in the shared `source` table: common fields plus a
//! [`SourceKind`] payload. Intervals are one kind of source, marking a frame
//! of a schedule as already summarized for an owner.

use crate::{Schedule, ScheduleError, ScheduleKey, SourceId, Timestamp};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag identifying the computation that produced an interval or a fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Owner(String);

impl Owner {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Owner {
    fn from(owner: &str) -> Self {
        Self::new(owner)
    }
}

/// "The frame `[start, finish)` of `schedule` has been summarized by `owner`."
///
/// `(schedule, owner, start)` is unique across the store. `finish` is
/// redundant with `schedule.next_frame(start)` but stored for range queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub schedule: ScheduleKey,
    pub owner: Owner,
    pub start: NaiveDate,
    pub finish: NaiveDate,
}

impl Interval {
    /// The interval covering the frame that starts at `start`.
    ///
    /// `start` must be a frame boundary of `schedule`; a mid-frame start
    /// would cover a partial frame and overlap its neighbours.
    pub fn for_frame(
        schedule: &dyn Schedule,
        owner: Owner,
        start: NaiveDate,
    ) -> Result<Self, ScheduleError> {
        let frame_start = schedule.start_of_frame(start);
        if frame_start != start {
            return Err(ScheduleError::Misaligned {
                schedule: schedule.key(),
                start,
                frame_start,
            });
        }
        Ok(Self {
            schedule: schedule.key(),
            owner,
            start,
            finish: schedule.next_frame(start),
        })
    }

    /// Overlap with the inclusive date bracket `[start, finish]`.
    ///
    /// Both interval ends count as touching: a change dated on a frame
    /// boundary clears the frame ending there and the frame starting there.
    pub fn overlaps(&self, start: NaiveDate, finish: NaiveDate) -> bool {
        self.start <= finish && self.finish >= start
    }

    /// True if this interval belongs to the given `(schedule, owner)` pair.
    pub fn is_for(&self, schedule: &ScheduleKey, owner: &Owner) -> bool {
        &self.schedule == schedule && &self.owner == owner
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Interval \"{} from {}\" (owner {})",
            self.schedule, self.start, self.owner
        )
    }
}

/// Flat discriminator persisted in the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    Plain,
    Interval,
    Activity,
    Journal,
    Constant,
    Monitor,
    Opaque,
}

/// Variant payload of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Owns raw facts; its time range is the span of those facts.
    Plain,
    /// An imported activity covering an explicit span.
    Activity { start: Timestamp, finish: Timestamp },
    /// A diary entry for one local calendar date.
    Journal { date: NaiveDate },
    /// Owns constants, which carry no time.
    Constant,
    /// A monitoring import covering an explicit span.
    Monitor { start: Timestamp, finish: Timestamp },
    Interval(Interval),
    /// Registered by an external component that supplies no time range.
    Opaque { kind: String },
}

impl SourceKind {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceKind::Plain => SourceType::Plain,
            SourceKind::Activity { .. } => SourceType::Activity,
            SourceKind::Journal { .. } => SourceType::Journal,
            SourceKind::Constant => SourceType::Constant,
            SourceKind::Monitor { .. } => SourceType::Monitor,
            SourceKind::Interval(_) => SourceType::Interval,
            SourceKind::Opaque { .. } => SourceType::Opaque,
        }
    }
}

/// A row of the `source` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: SourceId,
    pub kind: SourceKind,
    pub created_at: Timestamp,
}

impl Source {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            source_id: SourceId::now_v7(),
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn plain() -> Self {
        Self::new(SourceKind::Plain)
    }

    pub fn interval(interval: Interval) -> Self {
        Self::new(SourceKind::Interval(interval))
    }

    pub fn source_type(&self) -> SourceType {
        self.kind.source_type()
    }

    pub fn is_interval(&self) -> bool {
        matches!(self.kind, SourceKind::Interval(_))
    }

    pub fn as_interval(&self) -> Option<&Interval> {
        match &self.kind {
            SourceKind::Interval(interval) => Some(interval),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SourceKind::Interval(interval) => interval.fmt(f),
            SourceKind::Journal { date } => write!(f, "Journal from {date}"),
            SourceKind::Opaque { kind } => write!(f, "Source {} ({kind})", self.source_id),
            other => write!(f, "Source {} ({:?})", self.source_id, other.source_type()),
        }
    }
}

/// A persisted interval together with its source row fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalRecord {
    pub source_id: SourceId,
    pub interval: Interval,
    pub created_at: Timestamp,
}

impl IntervalRecord {
    /// Extract the interval view of a source row, if it is one.
    pub fn from_source(source: &Source) -> Option<Self> {
        source.as_interval().map(|interval| Self {
            source_id: source.source_id,
            interval: interval.clone(),
            created_at: source.created_at,
        })
    }
}

impl From<IntervalRecord> for Source {
    fn from(record: IntervalRecord) -> Self {
        Source {
            source_id: record.source_id,
            kind: SourceKind::Interval(record.interval),
            created_at: record.created_at,
        }
    }
}
