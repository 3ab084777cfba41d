//! Per-transaction change sets and the shared apply routine.
//!
//! A [`PendingChanges`] is what commit hooks inspect and extend. Backends
//! apply it through [`apply_changes`], which enforces the `source`/`interval`
//! constraints and cascades in one place.

use std::collections::HashSet;

use cadence_core::{
    CadenceResult, EntityType, Fact, FactId, Interval, Owner, ScheduleKey, Source, SourceId,
    StorageError,
};
use chrono::NaiveDate;

/// A persisted fact before and after modification.
#[derive(Debug, Clone, PartialEq)]
pub struct FactChange {
    pub before: Fact,
    pub after: Fact,
}

impl FactChange {
    pub fn time_changed(&self) -> bool {
        self.before.time != self.after.time
    }
}

/// The pending object sets of one write transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChanges {
    pub new_sources: Vec<Source>,
    pub new_facts: Vec<Fact>,
    pub modified_facts: Vec<FactChange>,
    pub deleted_sources: Vec<Source>,
    pub deleted_facts: Vec<Fact>,
    pub constants: Vec<(String, String)>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.new_sources.is_empty()
            && self.new_facts.is_empty()
            && self.modified_facts.is_empty()
            && self.deleted_sources.is_empty()
            && self.deleted_facts.is_empty()
            && self.constants.is_empty()
    }

    pub fn is_deleting(&self, source_id: SourceId) -> bool {
        self.deleted_sources.iter().any(|s| s.source_id == source_id)
    }

    /// Queue a source for deletion unless it already is.
    pub fn delete_source(&mut self, source: Source) -> bool {
        if self.is_deleting(source.source_id) {
            return false;
        }
        self.deleted_sources.push(source);
        true
    }

    /// A source added in this transaction.
    pub fn new_source(&self, source_id: SourceId) -> Option<&Source> {
        self.new_sources.iter().find(|s| s.source_id == source_id)
    }

    /// Number of intervals queued for deletion.
    pub fn deleted_interval_count(&self) -> usize {
        self.deleted_sources.iter().filter(|s| s.is_interval()).count()
    }
}

/// Table-level operations a backend exposes to [`apply_changes`].
///
/// Implementations operate on a private working copy or an open write
/// transaction; nothing is visible to readers until the caller commits.
pub(crate) trait ApplyTarget {
    fn get_source(&mut self, id: SourceId) -> CadenceResult<Option<Source>>;
    /// Insert or replace a source row, maintaining the interval index.
    fn put_source(&mut self, source: &Source) -> CadenceResult<()>;
    /// Remove a source row and its interval index entry.
    fn remove_source(&mut self, source: &Source) -> CadenceResult<()>;
    fn interval_id_at(
        &mut self,
        schedule: &ScheduleKey,
        owner: &Owner,
        start: NaiveDate,
    ) -> CadenceResult<Option<SourceId>>;

    fn get_fact(&mut self, id: FactId) -> CadenceResult<Option<Fact>>;
    /// Insert or replace a fact row.
    fn put_fact(&mut self, previous: Option<&Fact>, fact: &Fact) -> CadenceResult<()>;
    fn remove_fact(&mut self, fact: &Fact) -> CadenceResult<()>;
    fn fact_ids_by_source(&mut self, source_id: SourceId) -> CadenceResult<Vec<FactId>>;

    fn put_constant(&mut self, key: &str, value: &str) -> CadenceResult<()>;
}

/// Apply a change set in schema order.
///
/// Deletes run first (each source cascades to its facts, and an interval's
/// index row goes with it), then fact updates, then inserts, then constants.
/// The first failure is returned and the caller must discard the target.
pub(crate) fn apply_changes<T: ApplyTarget>(
    target: &mut T,
    changes: &PendingChanges,
) -> CadenceResult<()> {
    let mut removed_facts: HashSet<FactId> = HashSet::new();

    for deleted in &changes.deleted_sources {
        let Some(source) = target.get_source(deleted.source_id)? else {
            continue;
        };
        for fact_id in target.fact_ids_by_source(source.source_id)? {
            if let Some(fact) = target.get_fact(fact_id)? {
                target.remove_fact(&fact)?;
                removed_facts.insert(fact_id);
            }
        }
        target.remove_source(&source)?;
    }

    for deleted in &changes.deleted_facts {
        if let Some(fact) = target.get_fact(deleted.fact_id)? {
            target.remove_fact(&fact)?;
            removed_facts.insert(fact.fact_id);
        }
    }

    for change in &changes.modified_facts {
        let fact_id = change.after.fact_id;
        if removed_facts.contains(&fact_id) {
            continue;
        }
        let current = target.get_fact(fact_id)?.ok_or(StorageError::NotFound {
            entity_type: EntityType::Fact,
            id: fact_id.as_uuid(),
        })?;
        ensure_source(target, &change.after)?;
        target.put_fact(Some(&current), &change.after)?;
    }

    for source in &changes.new_sources {
        if target.get_source(source.source_id)?.is_some() {
            return Err(StorageError::DuplicateId {
                entity_type: EntityType::Source,
                id: source.source_id.as_uuid(),
            }
            .into());
        }
        if let Some(Interval {
            schedule,
            owner,
            start,
            ..
        }) = source.as_interval()
        {
            if target.interval_id_at(schedule, owner, *start)?.is_some() {
                return Err(StorageError::UniqueViolation {
                    schedule: schedule.clone(),
                    owner: owner.clone(),
                    start: *start,
                }
                .into());
            }
        }
        target.put_source(source)?;
    }

    for fact in &changes.new_facts {
        if target.get_fact(fact.fact_id)?.is_some() {
            return Err(StorageError::DuplicateId {
                entity_type: EntityType::Fact,
                id: fact.fact_id.as_uuid(),
            }
            .into());
        }
        ensure_source(target, fact)?;
        target.put_fact(None, fact)?;
    }

    for (key, value) in &changes.constants {
        target.put_constant(key, value)?;
    }

    Ok(())
}

fn ensure_source<T: ApplyTarget>(target: &mut T, fact: &Fact) -> CadenceResult<()> {
    if target.get_source(fact.source_id)?.is_none() {
        return Err(StorageError::ForeignKey {
            fact_id: fact.fact_id.as_uuid(),
            source_id: fact.source_id.as_uuid(),
        }
        .into());
    }
    Ok(())
}
