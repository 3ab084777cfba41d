//! Interval invalidation on the commit path.
//!
//! Each transaction touches a bracket of time. Intervals overlapping that
//! bracket summarize stale data, so they are deleted along with the facts
//! computed into them, and gap detection picks the frames up again.
//!
//! The bracket is one span, not a set of instants. A transaction touching
//! disjoint regions also clears the intervals between them.

use crate::changes::PendingChanges;
use crate::cleanup::intervals_in_dates;
use crate::range::time_range;
use crate::session::CommitHook;
use crate::RegistryStore;
use cadence_core::{CadenceResult, Fact, LocalZone, Owner, Source, TimeRange};

/// The time bracket touched by a change set.
///
/// Contributions:
/// - deleted sources other than intervals, by their time range;
/// - modified facts, at their new time and (if it moved) their old time;
/// - deleted facts not owned by an interval;
/// - new facts with a value, not owned by an interval.
///
/// Times inside the reserved first day never contribute.
pub fn touched_bracket(
    store: &dyn RegistryStore,
    zone: &LocalZone,
    pending: &PendingChanges,
) -> CadenceResult<TimeRange> {
    let mut bracket = TimeRange::EMPTY;

    for source in &pending.deleted_sources {
        if !source.is_interval() {
            bracket.extend(time_range(source, store, zone)?);
        }
    }

    for change in &pending.modified_facts {
        if let Some(time) = change.after.counting_time() {
            bracket.extend_point(time);
        }
        if change.time_changed() {
            if let Some(time) = change.before.counting_time() {
                bracket.extend_point(time);
            }
        }
    }

    for fact in &pending.deleted_facts {
        if !owned_by_interval(store, pending, fact)? {
            if let Some(time) = fact.counting_time() {
                bracket.extend_point(time);
            }
        }
    }

    for fact in &pending.new_facts {
        // Placeholders (no value) must not trigger recomputation.
        if !fact.has_value() {
            continue;
        }
        if let Some(time) = fact.counting_time() {
            if !owned_by_interval(store, pending, fact)? {
                bracket.extend_point(time);
            }
        }
    }

    Ok(bracket)
}

fn owned_by_interval(
    store: &dyn RegistryStore,
    pending: &PendingChanges,
    fact: &Fact,
) -> CadenceResult<bool> {
    if let Some(source) = pending.new_source(fact.source_id) {
        return Ok(source.is_interval());
    }
    Ok(store
        .source_get(fact.source_id)?
        .is_some_and(|s| s.is_interval()))
}

/// Commit hook deleting every interval that overlaps the touched bracket.
///
/// With `owner` set, only that owner's intervals are cleared.
#[derive(Debug, Clone, Default)]
pub struct IntervalInvalidator {
    pub owner: Option<Owner>,
}

impl IntervalInvalidator {
    pub fn for_owner(owner: Owner) -> Self {
        Self { owner: Some(owner) }
    }
}

impl CommitHook for IntervalInvalidator {
    fn name(&self) -> &str {
        "interval_invalidator"
    }

    fn before_commit(
        &self,
        store: &dyn RegistryStore,
        zone: &LocalZone,
        pending: &mut PendingChanges,
    ) -> CadenceResult<()> {
        let bracket = touched_bracket(store, zone, pending)?;
        let Some((start, finish)) = bracket.to_dates(zone) else {
            return Ok(());
        };

        let mut invalidated = 0usize;
        for record in intervals_in_dates(store, start, finish, self.owner.as_ref())? {
            tracing::trace!(interval = %record.interval, "Invalidating");
            if pending.delete_source(Source::from(record)) {
                invalidated += 1;
            }
        }

        tracing::debug!(
            start = %start,
            finish = %finish,
            invalidated,
            "Cleaned intervals touched by transaction"
        );
        Ok(())
    }
}
