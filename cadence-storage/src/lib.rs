//! CADENCE Storage - Source/Interval Registry
//!
//! Defines the registry store abstraction, an in-memory store and an LMDB
//! store, the explicit commit path with its hooks, interval invalidation,
//! bulk cleanup and gap detection.

pub mod changes;
pub mod cleanup;
pub mod gaps;
pub mod invalidate;
pub mod lmdb;
pub mod range;
pub mod session;
pub mod timezone;

pub use changes::{FactChange, PendingChanges};
pub use cleanup::intervals_in_dates;
pub use gaps::{
    collect_frames, first_missing_date, missing_frames, open_chain_ends, raw_fact_range,
    MissingFrames,
};
pub use invalidate::{touched_bracket, IntervalInvalidator};
pub use lmdb::{LmdbStore, LmdbStoreError};
pub use range::time_range;
pub use session::{CommitHook, CommitReport, Registry, Transaction};
pub use timezone::TIMEZONE_CONSTANT;

use cadence_core::{
    CadenceResult, Fact, FactId, IntervalRecord, Owner, ScheduleKey, Source, SourceId,
    SourceType, StorageError, TimeRange,
};
use changes::{apply_changes, ApplyTarget};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

// ============================================================================
// REGISTRY STORE TRAIT
// ============================================================================

/// Persisted catalogue of sources, intervals and the facts they own.
///
/// Reads see only committed state. The single write entry point, [`apply`],
/// is atomic: either every change lands or none does.
///
/// [`apply`]: RegistryStore::apply
pub trait RegistryStore: Send + Sync {
    // === Source Operations ===

    /// Get a source by ID.
    fn source_get(&self, id: SourceId) -> CadenceResult<Option<Source>>;

    /// List sources of one kind.
    fn sources_by_type(&self, source_type: SourceType) -> CadenceResult<Vec<Source>>;

    // === Interval Operations ===

    /// Intervals for a `(schedule, owner)` pair, ordered by start.
    fn intervals_for(
        &self,
        schedule: &ScheduleKey,
        owner: &Owner,
    ) -> CadenceResult<Vec<IntervalRecord>>;

    /// The interval for `(schedule, owner)` starting exactly at `start`.
    fn interval_at(
        &self,
        schedule: &ScheduleKey,
        owner: &Owner,
        start: NaiveDate,
    ) -> CadenceResult<Option<IntervalRecord>>;

    /// Intervals of any schedule touching the inclusive date bracket,
    /// optionally restricted to one owner.
    fn intervals_overlapping(
        &self,
        start: NaiveDate,
        finish: NaiveDate,
        owner: Option<&Owner>,
    ) -> CadenceResult<Vec<IntervalRecord>>;

    /// Every interval in the store.
    fn all_intervals(&self) -> CadenceResult<Vec<IntervalRecord>>;

    /// Number of stored intervals.
    fn interval_count(&self) -> CadenceResult<usize>;

    // === Fact Operations ===

    /// Get a fact by ID.
    fn fact_get(&self, id: FactId) -> CadenceResult<Option<Fact>>;

    /// Facts owned by a source.
    fn facts_by_source(&self, source_id: SourceId) -> CadenceResult<Vec<Fact>>;

    /// Earliest and latest fact time after the reserved first day,
    /// optionally restricted to facts produced by `owner`.
    fn fact_time_range(&self, owner: Option<&Owner>) -> CadenceResult<TimeRange>;

    /// Number of stored facts.
    fn fact_count(&self) -> CadenceResult<usize>;

    // === Constants ===

    /// Read a system constant.
    fn constant_get(&self, key: &str) -> CadenceResult<Option<String>>;

    // === Write ===

    /// Atomically apply a transaction's changes.
    fn apply(&self, changes: &PendingChanges) -> CadenceResult<()>;
}

fn overlapping(
    records: impl IntoIterator<Item = IntervalRecord>,
    start: NaiveDate,
    finish: NaiveDate,
    owner: Option<&Owner>,
) -> Vec<IntervalRecord> {
    let mut found: Vec<IntervalRecord> = records
        .into_iter()
        .filter(|r| r.interval.overlaps(start, finish))
        .filter(|r| owner.map_or(true, |o| &r.interval.owner == o))
        .collect();
    found.sort_by(|a, b| a.interval.start.cmp(&b.interval.start));
    found
}

fn extend_with_fact(range: &mut TimeRange, fact: &Fact, owner: Option<&Owner>) {
    if owner.is_some_and(|o| &fact.owner != o) {
        return;
    }
    if let Some(time) = fact.counting_time() {
        range.extend_point(time);
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

type IntervalKey = (ScheduleKey, Owner, NaiveDate);

#[derive(Debug, Clone, Default)]
struct Tables {
    sources: HashMap<SourceId, Source>,
    facts: HashMap<FactId, Fact>,
    interval_index: BTreeMap<IntervalKey, SourceId>,
    constants: HashMap<String, String>,
}

impl ApplyTarget for Tables {
    fn get_source(&mut self, id: SourceId) -> CadenceResult<Option<Source>> {
        Ok(self.sources.get(&id).cloned())
    }

    fn put_source(&mut self, source: &Source) -> CadenceResult<()> {
        if let Some(interval) = source.as_interval() {
            self.interval_index.insert(
                (interval.schedule.clone(), interval.owner.clone(), interval.start),
                source.source_id,
            );
        }
        self.sources.insert(source.source_id, source.clone());
        Ok(())
    }

    fn remove_source(&mut self, source: &Source) -> CadenceResult<()> {
        if let Some(interval) = source.as_interval() {
            self.interval_index.remove(&(
                interval.schedule.clone(),
                interval.owner.clone(),
                interval.start,
            ));
        }
        self.sources.remove(&source.source_id);
        Ok(())
    }

    fn interval_id_at(
        &mut self,
        schedule: &ScheduleKey,
        owner: &Owner,
        start: NaiveDate,
    ) -> CadenceResult<Option<SourceId>> {
        Ok(self
            .interval_index
            .get(&(schedule.clone(), owner.clone(), start))
            .copied())
    }

    fn get_fact(&mut self, id: FactId) -> CadenceResult<Option<Fact>> {
        Ok(self.facts.get(&id).cloned())
    }

    fn put_fact(&mut self, _previous: Option<&Fact>, fact: &Fact) -> CadenceResult<()> {
        self.facts.insert(fact.fact_id, fact.clone());
        Ok(())
    }

    fn remove_fact(&mut self, fact: &Fact) -> CadenceResult<()> {
        self.facts.remove(&fact.fact_id);
        Ok(())
    }

    fn fact_ids_by_source(&mut self, source_id: SourceId) -> CadenceResult<Vec<FactId>> {
        Ok(self
            .facts
            .values()
            .filter(|f| f.source_id == source_id)
            .map(|f| f.fact_id)
            .collect())
    }

    fn put_constant(&mut self, key: &str, value: &str) -> CadenceResult<()> {
        self.constants.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl Tables {
    fn interval_record(&self, id: &SourceId) -> Option<IntervalRecord> {
        self.sources.get(id).and_then(IntervalRecord::from_source)
    }
}

/// In-memory registry store.
///
/// Each `apply` works on a copy of the tables and swaps it in on success,
/// so a failed transaction leaves no trace.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all stored data.
    pub fn clear(&self) -> CadenceResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        *tables = Tables::default();
        Ok(())
    }

    /// Get count of stored sources (intervals included).
    pub fn source_count(&self) -> CadenceResult<usize> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.sources.len())
    }
}

impl RegistryStore for InMemoryStore {
    // === Source Operations ===

    fn source_get(&self, id: SourceId) -> CadenceResult<Option<Source>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.sources.get(&id).cloned())
    }

    fn sources_by_type(&self, source_type: SourceType) -> CadenceResult<Vec<Source>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut sources: Vec<Source> = tables
            .sources
            .values()
            .filter(|s| s.source_type() == source_type)
            .cloned()
            .collect();
        sources.sort_by_key(|s| s.source_id);
        Ok(sources)
    }

    // === Interval Operations ===

    fn intervals_for(
        &self,
        schedule: &ScheduleKey,
        owner: &Owner,
    ) -> CadenceResult<Vec<IntervalRecord>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        // BTreeMap order within one (schedule, owner) prefix is start order.
        Ok(tables
            .interval_index
            .iter()
            .filter(|((s, o, _), _)| s == schedule && o == owner)
            .filter_map(|(_, id)| tables.interval_record(id))
            .collect())
    }

    fn interval_at(
        &self,
        schedule: &ScheduleKey,
        owner: &Owner,
        start: NaiveDate,
    ) -> CadenceResult<Option<IntervalRecord>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables
            .interval_index
            .get(&(schedule.clone(), owner.clone(), start))
            .and_then(|id| tables.interval_record(id)))
    }

    fn intervals_overlapping(
        &self,
        start: NaiveDate,
        finish: NaiveDate,
        owner: Option<&Owner>,
    ) -> CadenceResult<Vec<IntervalRecord>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let records = tables
            .interval_index
            .values()
            .filter_map(|id| tables.interval_record(id));
        Ok(overlapping(records, start, finish, owner))
    }

    fn all_intervals(&self) -> CadenceResult<Vec<IntervalRecord>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables
            .interval_index
            .values()
            .filter_map(|id| tables.interval_record(id))
            .collect())
    }

    fn interval_count(&self) -> CadenceResult<usize> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.interval_index.len())
    }

    // === Fact Operations ===

    fn fact_get(&self, id: FactId) -> CadenceResult<Option<Fact>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.facts.get(&id).cloned())
    }

    fn facts_by_source(&self, source_id: SourceId) -> CadenceResult<Vec<Fact>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut facts: Vec<Fact> = tables
            .facts
            .values()
            .filter(|f| f.source_id == source_id)
            .cloned()
            .collect();
        facts.sort_by_key(|f| f.fact_id);
        Ok(facts)
    }

    fn fact_time_range(&self, owner: Option<&Owner>) -> CadenceResult<TimeRange> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut range = TimeRange::EMPTY;
        for fact in tables.facts.values() {
            extend_with_fact(&mut range, fact, owner);
        }
        Ok(range)
    }

    fn fact_count(&self) -> CadenceResult<usize> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.facts.len())
    }

    // === Constants ===

    fn constant_get(&self, key: &str) -> CadenceResult<Option<String>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.constants.get(key).cloned())
    }

    // === Write ===

    fn apply(&self, changes: &PendingChanges) -> CadenceResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let mut working = tables.clone();
        apply_changes(&mut working, changes)?;
        *tables = working;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
