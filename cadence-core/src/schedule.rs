//! Schedules: how calendar time is cut into frames.
//!
//! The registry only needs two deterministic, monotonic boundary functions
//! from a schedule. [`RepeatingSchedule`] covers the common "every N days /
//! weeks / months / years" cases; anything else can implement [`Schedule`].

use crate::ScheduleError;
use chrono::{Datelike, Days, Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Value-comparable identity of a schedule, stored on every interval.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleKey(String);

impl ScheduleKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Frame boundary contract.
///
/// Implementations must be deterministic, `start_of_frame` must be idempotent,
/// and `next_frame(d) > d` must hold for every date.
pub trait Schedule: fmt::Debug + Send + Sync {
    /// Identity used to match persisted intervals.
    fn key(&self) -> ScheduleKey;

    /// Start date of the frame containing `date`.
    fn start_of_frame(&self, date: NaiveDate) -> NaiveDate;

    /// Start date of the frame following the one containing `date`.
    fn next_frame(&self, date: NaiveDate) -> NaiveDate;
}

/// Calendar unit of a repeating schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameUnit {
    Day,
    Week,
    Month,
    Year,
}

impl FrameUnit {
    fn code(self) -> char {
        match self {
            FrameUnit::Day => 'd',
            FrameUnit::Week => 'w',
            FrameUnit::Month => 'm',
            FrameUnit::Year => 'y',
        }
    }
}

const ORIGIN_YEAR: i32 = 1970;

fn day_origin() -> NaiveDate {
    NaiveDate::from_ymd_opt(ORIGIN_YEAR, 1, 1).unwrap_or(NaiveDate::MIN)
}

// First Monday of 1970; weeks start on Monday.
fn week_origin() -> NaiveDate {
    NaiveDate::from_ymd_opt(ORIGIN_YEAR, 1, 5).unwrap_or(NaiveDate::MIN)
}

// Largest frame span in months; month arithmetic runs in i32.
const MAX_SPAN_MONTHS: u32 = i32::MAX as u32;

static SCHEDULE_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d*)\s*([dwmy])\s*$").expect("schedule regex is valid"));

/// Every `count` days, weeks, months or years, aligned to fixed origins in
/// 1970 so that frame boundaries never depend on when the schedule was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepeatingSchedule {
    count: u32,
    unit: FrameUnit,
}

impl RepeatingSchedule {
    pub fn new(count: u32, unit: FrameUnit) -> Result<Self, ScheduleError> {
        if count == 0 {
            return Err(ScheduleError::Parse {
                spec: format!("0{}", unit.code()),
                reason: "frame count must be at least 1".to_string(),
            });
        }
        let schedule = Self { count, unit };
        let span_fits = match unit {
            FrameUnit::Day | FrameUnit::Week => true,
            FrameUnit::Month | FrameUnit::Year => schedule
                .months_checked()
                .is_some_and(|months| months <= MAX_SPAN_MONTHS),
        };
        if !span_fits {
            return Err(ScheduleError::Parse {
                spec: schedule.to_string(),
                reason: format!("frame span must not exceed {MAX_SPAN_MONTHS} months"),
            });
        }
        Ok(schedule)
    }

    pub fn daily() -> Self {
        Self {
            count: 1,
            unit: FrameUnit::Day,
        }
    }

    pub fn weekly() -> Self {
        Self {
            count: 1,
            unit: FrameUnit::Week,
        }
    }

    pub fn monthly() -> Self {
        Self {
            count: 1,
            unit: FrameUnit::Month,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn unit(&self) -> FrameUnit {
        self.unit
    }

    fn months_checked(&self) -> Option<u32> {
        match self.unit {
            FrameUnit::Month => Some(self.count),
            FrameUnit::Year => self.count.checked_mul(12),
            FrameUnit::Day | FrameUnit::Week => None,
        }
    }

    // Saturates for schedules that bypassed `new`, e.g. via serde.
    fn span_months(&self) -> u32 {
        self.months_checked()
            .unwrap_or(MAX_SPAN_MONTHS)
            .min(MAX_SPAN_MONTHS)
    }

    fn start_in_days(&self, date: NaiveDate, origin: NaiveDate, span: i64) -> NaiveDate {
        let offset = (date - origin).num_days().div_euclid(span) * span;
        if offset >= 0 {
            origin.checked_add_days(Days::new(offset as u64))
        } else {
            origin.checked_sub_days(Days::new(offset.unsigned_abs()))
        }
        .unwrap_or(date)
    }

    fn start_in_months(&self, date: NaiveDate, span: u32) -> NaiveDate {
        let span = i64::from(span);
        let index = i64::from(date.year() - ORIGIN_YEAR) * 12 + i64::from(date.month0());
        let aligned = index.div_euclid(span) * span;
        let Ok(year) = i32::try_from(i64::from(ORIGIN_YEAR) + aligned.div_euclid(12)) else {
            return date;
        };
        let month = aligned.rem_euclid(12) as u32 + 1;
        NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
    }
}

impl Schedule for RepeatingSchedule {
    fn key(&self) -> ScheduleKey {
        ScheduleKey::new(self.to_string())
    }

    fn start_of_frame(&self, date: NaiveDate) -> NaiveDate {
        let count = self.count as i64;
        match self.unit {
            FrameUnit::Day => self.start_in_days(date, day_origin(), count),
            FrameUnit::Week => self.start_in_days(date, week_origin(), 7 * count),
            FrameUnit::Month | FrameUnit::Year => self.start_in_months(date, self.span_months()),
        }
    }

    fn next_frame(&self, date: NaiveDate) -> NaiveDate {
        let start = self.start_of_frame(date);
        let next = match self.unit {
            FrameUnit::Day => start.checked_add_days(Days::new(u64::from(self.count))),
            FrameUnit::Week => start.checked_add_days(Days::new(7 * u64::from(self.count))),
            FrameUnit::Month | FrameUnit::Year => {
                start.checked_add_months(Months::new(self.span_months()))
            }
        };
        // Overflow saturates; callers detect the stalled frame.
        next.unwrap_or(NaiveDate::MAX)
    }
}

impl fmt::Display for RepeatingSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.code())
    }
}

impl FromStr for RepeatingSchedule {
    type Err = ScheduleError;

    /// Parse `"d"`, `"2d"`, `"w"`, `"m"`, `"3m"`, `"y"`. A missing count means 1.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let caps = SCHEDULE_SPEC.captures(spec).ok_or_else(|| ScheduleError::Parse {
            spec: spec.to_string(),
            reason: "expected an optional count followed by one of d, w, m, y".to_string(),
        })?;
        let count = match caps.get(1).map(|m| m.as_str()).unwrap_or("") {
            "" => 1,
            digits => digits.parse::<u32>().map_err(|e| ScheduleError::Parse {
                spec: spec.to_string(),
                reason: e.to_string(),
            })?,
        };
        let unit = match caps.get(2).map(|m| m.as_str()) {
            Some("d") => FrameUnit::Day,
            Some("w") => FrameUnit::Week,
            Some("m") => FrameUnit::Month,
            _ => FrameUnit::Year,
        };
        RepeatingSchedule::new(count, unit).map_err(|e| match e {
            ScheduleError::Parse { reason, .. } => ScheduleError::Parse {
                spec: spec.to_string(),
                reason,
            },
            other => other,
        })
    }
}

/// One frame `[start, finish)` reported missing by gap detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Frame {
    pub start: NaiveDate,
    pub finish: NaiveDate,
}

impl Frame {
    pub fn new(start: NaiveDate, finish: NaiveDate) -> Self {
        Self { start, finish }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.start, self.finish)
    }
}
