//! Transactions, commit hooks and the registry handle.
//!
//! Every write goes through [`Transaction::commit`]: the recorded intent is
//! resolved against committed state into a [`PendingChanges`], each installed
//! [`CommitHook`] runs once over it, and the store applies the result
//! atomically.

use std::path::PathBuf;
use std::sync::Mutex;

use crate::changes::{FactChange, PendingChanges};
use crate::gaps::{self, MissingFrames};
use crate::invalidate::IntervalInvalidator;
use crate::lmdb::LmdbStore;
use crate::{InMemoryStore, RegistryStore};
use cadence_core::{
    CadenceConfig, CadenceResult, EntityType, Fact, FactId, FactUpdate, Interval, LocalZone,
    Owner, Schedule, Source, SourceId, StorageBackend, StorageError,
};
use chrono::NaiveDate;

// ============================================================================
// COMMIT HOOKS
// ============================================================================

/// Logic injected into the commit path.
///
/// Runs exactly once per transaction, after the change set is resolved and
/// before it is applied. Hooks may add to the change set; an error aborts the
/// transaction with nothing written.
pub trait CommitHook: Send + Sync {
    fn name(&self) -> &str;

    fn before_commit(
        &self,
        store: &dyn RegistryStore,
        zone: &LocalZone,
        pending: &mut PendingChanges,
    ) -> CadenceResult<()>;
}

/// What a committed transaction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub sources_added: usize,
    pub facts_added: usize,
    pub facts_modified: usize,
    pub sources_deleted: usize,
    pub facts_deleted: usize,
    /// Every interval removed, whether requested or added by a hook.
    pub intervals_deleted: usize,
    /// Intervals removed by hooks only.
    pub intervals_invalidated: usize,
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// A unit of work against a [`Registry`].
///
/// Operations only record intent; nothing touches the store until
/// [`commit`](Transaction::commit). Dropping a transaction discards it.
pub struct Transaction<'r> {
    registry: &'r Registry,
    new_sources: Vec<Source>,
    new_facts: Vec<Fact>,
    updates: Vec<(FactId, FactUpdate)>,
    deleted_sources: Vec<SourceId>,
    deleted_facts: Vec<FactId>,
    constants: Vec<(String, String)>,
}

impl<'r> Transaction<'r> {
    fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            new_sources: Vec::new(),
            new_facts: Vec::new(),
            updates: Vec::new(),
            deleted_sources: Vec::new(),
            deleted_facts: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn add_source(&mut self, source: Source) -> SourceId {
        let id = source.source_id;
        self.new_sources.push(source);
        id
    }

    /// Record that a frame has been summarized.
    ///
    /// Fails without recording anything if `start` is not a frame start.
    pub fn add_interval(
        &mut self,
        schedule: &dyn Schedule,
        owner: Owner,
        start: NaiveDate,
    ) -> CadenceResult<SourceId> {
        let interval = Interval::for_frame(schedule, owner, start)?;
        Ok(self.add_source(Source::interval(interval)))
    }

    pub fn add_fact(&mut self, fact: Fact) -> FactId {
        let id = fact.fact_id;
        self.new_facts.push(fact);
        id
    }

    /// Modify a fact. A fact added earlier in this transaction is updated in
    /// place and counts as new.
    pub fn update_fact(&mut self, fact_id: FactId, update: FactUpdate) {
        if update.is_empty() {
            return;
        }
        if let Some(fact) = self.new_facts.iter_mut().find(|f| f.fact_id == fact_id) {
            *fact = update.applied_to(fact);
            return;
        }
        self.updates.push((fact_id, update));
    }

    pub fn delete_source(&mut self, source_id: SourceId) {
        if !self.deleted_sources.contains(&source_id) {
            self.deleted_sources.push(source_id);
        }
    }

    /// Delete a fact. A fact added earlier in this transaction is dropped.
    pub fn delete_fact(&mut self, fact_id: FactId) {
        let before = self.new_facts.len();
        self.new_facts.retain(|f| f.fact_id != fact_id);
        if self.new_facts.len() == before && !self.deleted_facts.contains(&fact_id) {
            self.deleted_facts.push(fact_id);
        }
    }

    pub fn set_constant(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.constants.push((key.into(), value.into()));
    }

    /// Resolve, run hooks and apply atomically.
    pub fn commit(self) -> CadenceResult<CommitReport> {
        let registry = self.registry;
        let _writer = registry
            .commit_lock
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let store = registry.store();

        let mut pending = self.resolve(store)?;
        let requested = pending.deleted_interval_count();

        for hook in &registry.hooks {
            tracing::trace!(hook = hook.name(), "Running commit hook");
            hook.before_commit(store, &registry.zone, &mut pending)?;
        }

        if pending.is_empty() {
            return Ok(CommitReport::default());
        }
        store.apply(&pending)?;

        let intervals_deleted = pending.deleted_interval_count();
        Ok(CommitReport {
            sources_added: pending.new_sources.len(),
            facts_added: pending.new_facts.len(),
            facts_modified: pending.modified_facts.len(),
            sources_deleted: pending.deleted_sources.len(),
            facts_deleted: pending.deleted_facts.len(),
            intervals_deleted,
            intervals_invalidated: intervals_deleted.saturating_sub(requested),
        })
    }

    fn resolve(self, store: &dyn RegistryStore) -> CadenceResult<PendingChanges> {
        let mut pending = PendingChanges {
            new_sources: self.new_sources,
            new_facts: self.new_facts,
            constants: self.constants,
            ..Default::default()
        };

        for source_id in self.deleted_sources {
            let source = store.source_get(source_id)?.ok_or(StorageError::NotFound {
                entity_type: EntityType::Source,
                id: source_id.as_uuid(),
            })?;
            pending.delete_source(source);
        }

        for fact_id in self.deleted_facts {
            let fact = store.fact_get(fact_id)?.ok_or(StorageError::NotFound {
                entity_type: EntityType::Fact,
                id: fact_id.as_uuid(),
            })?;
            pending.deleted_facts.push(fact);
        }

        for (fact_id, update) in self.updates {
            let existing = pending
                .modified_facts
                .iter_mut()
                .find(|c| c.after.fact_id == fact_id);
            if let Some(change) = existing {
                change.after = update.applied_to(&change.after);
                continue;
            }
            let before = store.fact_get(fact_id)?.ok_or(StorageError::NotFound {
                entity_type: EntityType::Fact,
                id: fact_id.as_uuid(),
            })?;
            let after = update.applied_to(&before);
            pending.modified_facts.push(FactChange { before, after });
        }

        Ok(pending)
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// The source/interval registry: a store, the local zone and the hooks
/// installed on its commit path.
///
/// Single writer: commits are serialized on an internal lock. Reads go
/// straight to the store and see committed state only.
pub struct Registry {
    store: Box<dyn RegistryStore>,
    zone: LocalZone,
    hooks: Vec<Box<dyn CommitHook>>,
    commit_lock: Mutex<()>,
}

impl Registry {
    /// A registry with no hooks installed.
    pub fn new(store: impl RegistryStore + 'static, zone: LocalZone) -> Self {
        Self {
            store: Box::new(store),
            zone,
            hooks: Vec::new(),
            commit_lock: Mutex::new(()),
        }
    }

    /// Install a hook on the commit path. Hooks run in installation order.
    pub fn with_hook(mut self, hook: impl CommitHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// A registry whose commits invalidate intervals for every owner.
    pub fn with_interval_invalidation(store: impl RegistryStore + 'static, zone: LocalZone) -> Self {
        Self::new(store, zone).with_hook(IntervalInvalidator::default())
    }

    /// Open the configured backend with interval invalidation installed.
    pub fn open(config: &CadenceConfig) -> CadenceResult<Self> {
        config.validate()?;
        let zone = config.local_zone()?;
        let registry = match config.storage.backend {
            StorageBackend::Memory => Self::with_interval_invalidation(InMemoryStore::new(), zone),
            StorageBackend::Lmdb => {
                let path = config.storage.path.clone().unwrap_or_else(PathBuf::new);
                let store = LmdbStore::open(&path, config.storage.map_size_mb)?;
                Self::with_interval_invalidation(store, zone)
            }
        };
        tracing::info!(
            backend = ?config.storage.backend,
            timezone = registry.zone.name(),
            "Opened registry"
        );
        Ok(registry)
    }

    pub fn store(&self) -> &dyn RegistryStore {
        self.store.as_ref()
    }

    pub fn zone(&self) -> &LocalZone {
        &self.zone
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    // === Gap Detection ===

    /// Frames of `schedule` with no interval for `owner`; see [`gaps::missing_frames`].
    pub fn missing_frames<'a>(
        &'a self,
        schedule: &'a dyn Schedule,
        owner: &Owner,
        fact_owner: Option<&Owner>,
    ) -> CadenceResult<MissingFrames<'a>> {
        gaps::missing_frames(self.store(), &self.zone, schedule, owner, fact_owner)
    }

    /// Where forward recomputation resumes; see [`gaps::first_missing_date`].
    pub fn first_missing_date(
        &self,
        schedule: &dyn Schedule,
        owner: &Owner,
        fact_owner: Option<&Owner>,
    ) -> CadenceResult<Option<(NaiveDate, NaiveDate)>> {
        gaps::first_missing_date(self.store(), &self.zone, schedule, owner, fact_owner)
    }

    /// Finish dates of interval chains with no successor.
    pub fn open_chain_ends(
        &self,
        schedule: &dyn Schedule,
        owner: &Owner,
    ) -> CadenceResult<Vec<NaiveDate>> {
        gaps::open_chain_ends(self.store(), &schedule.key(), owner)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("zone", &self.zone)
            .field(
                "hooks",
                &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{CadenceError, FactValue, RepeatingSchedule, ScheduleError, Timestamp};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn reading(source: SourceId, time: &str) -> Fact {
        Fact::new(
            source,
            Owner::new("diary"),
            "Rest HR",
            Some(ts(time)),
            Some(FactValue::Integer(50)),
        )
    }

    struct CountingHook(Arc<AtomicUsize>);

    impl CommitHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        fn before_commit(
            &self,
            _store: &dyn RegistryStore,
            _zone: &LocalZone,
            _pending: &mut PendingChanges,
        ) -> CadenceResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHook;

    impl CommitHook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        fn before_commit(
            &self,
            _store: &dyn RegistryStore,
            _zone: &LocalZone,
            _pending: &mut PendingChanges,
        ) -> CadenceResult<()> {
            Err(StorageError::TransactionFailed {
                reason: "rejected".to_string(),
            }
            .into())
        }
    }

    #[test]
    fn test_hook_runs_once_per_commit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Registry::new(InMemoryStore::new(), LocalZone::utc())
            .with_hook(CountingHook(calls.clone()));

        let mut txn = registry.begin();
        let source = txn.add_source(Source::plain());
        txn.add_fact(reading(source, "2024-01-01T08:00:00Z"));
        txn.add_fact(reading(source, "2024-01-02T08:00:00Z"));
        let report = txn.commit().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.sources_added, 1);
        assert_eq!(report.facts_added, 2);
    }

    #[test]
    fn test_hook_error_aborts_commit() {
        let registry =
            Registry::new(InMemoryStore::new(), LocalZone::utc()).with_hook(FailingHook);

        let mut txn = registry.begin();
        let source = txn.add_source(Source::plain());
        let result = txn.commit();

        assert!(matches!(
            result,
            Err(CadenceError::Storage(StorageError::TransactionFailed { .. }))
        ));
        assert_eq!(registry.store().source_get(source).unwrap(), None);
    }

    #[test]
    fn test_update_resolves_before_image() {
        let registry = Registry::new(InMemoryStore::new(), LocalZone::utc());
        let mut txn = registry.begin();
        let source = txn.add_source(Source::plain());
        let fact_id = txn.add_fact(reading(source, "2024-01-01T08:00:00Z"));
        txn.commit().unwrap();

        let mut txn = registry.begin();
        txn.update_fact(
            fact_id,
            FactUpdate {
                time: Some(Some(ts("2024-01-05T08:00:00Z"))),
                ..Default::default()
            },
        );
        let report = txn.commit().unwrap();
        assert_eq!(report.facts_modified, 1);

        let stored = registry.store().fact_get(fact_id).unwrap().unwrap();
        assert_eq!(stored.time, Some(ts("2024-01-05T08:00:00Z")));
    }

    #[test]
    fn test_missing_targets_are_not_found() {
        let registry = Registry::new(InMemoryStore::new(), LocalZone::utc());

        let mut txn = registry.begin();
        txn.delete_source(SourceId::now_v7());
        assert!(matches!(
            txn.commit(),
            Err(CadenceError::Storage(StorageError::NotFound {
                entity_type: EntityType::Source,
                ..
            }))
        ));

        let mut txn = registry.begin();
        txn.update_fact(
            FactId::now_v7(),
            FactUpdate {
                value: Some(None),
                ..Default::default()
            },
        );
        assert!(matches!(
            txn.commit(),
            Err(CadenceError::Storage(StorageError::NotFound {
                entity_type: EntityType::Fact,
                ..
            }))
        ));
    }

    #[test]
    fn test_fact_added_and_deleted_in_one_transaction_vanishes() {
        let registry = Registry::new(InMemoryStore::new(), LocalZone::utc());
        let mut txn = registry.begin();
        let source = txn.add_source(Source::plain());
        let fact_id = txn.add_fact(reading(source, "2024-01-01T08:00:00Z"));
        txn.delete_fact(fact_id);
        let report = txn.commit().unwrap();

        assert_eq!(report.facts_added, 0);
        assert_eq!(report.facts_deleted, 0);
        assert_eq!(registry.store().fact_count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_interval_aborts_whole_transaction() {
        let registry = Registry::new(InMemoryStore::new(), LocalZone::utc());
        let daily = RepeatingSchedule::daily();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let mut txn = registry.begin();
        txn.add_interval(&daily, Owner::new("o"), start).unwrap();
        txn.commit().unwrap();

        let mut txn = registry.begin();
        let plain = txn.add_source(Source::plain());
        txn.add_interval(&daily, Owner::new("o"), start).unwrap();
        assert!(matches!(
            txn.commit(),
            Err(CadenceError::Storage(StorageError::UniqueViolation { .. }))
        ));
        assert_eq!(registry.store().source_get(plain).unwrap(), None);
        assert_eq!(registry.store().interval_count().unwrap(), 1);
    }

    #[test]
    fn test_mid_frame_interval_is_rejected() {
        let registry = Registry::new(InMemoryStore::new(), LocalZone::utc());
        let weekly = RepeatingSchedule::weekly();
        let monday = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let wednesday = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();

        let mut txn = registry.begin();
        txn.add_interval(&weekly, Owner::new("o"), monday).unwrap();
        assert!(matches!(
            txn.add_interval(&weekly, Owner::new("o"), wednesday),
            Err(CadenceError::Schedule(ScheduleError::Misaligned { frame_start, .. }))
                if frame_start == monday
        ));
        txn.commit().unwrap();

        let stored = registry
            .store()
            .intervals_for(&weekly.key(), &Owner::new("o"))
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].interval.start, monday);
        assert_eq!(
            stored[0].interval.finish,
            NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()
        );
    }

    #[test]
    fn test_open_in_memory_installs_invalidation() {
        let registry = Registry::open(&CadenceConfig::in_memory()).unwrap();
        assert_eq!(registry.zone().name(), "UTC");
        assert!(format!("{registry:?}").contains("interval_invalidator"));
    }
}
