//! LMDB-backed registry store.
//!
//! Uses the heed crate (Rust bindings for LMDB). Rows are JSON documents
//! keyed by id; two index databases cover the queries the registry makes:
//!
//! - `fact_source_index`: `source_id || fact_id` → empty, for cascades and
//!   per-source fact listing
//! - `interval_index`: length-prefixed `schedule` and `owner`, then
//!   `YYYY-MM-DD` → source id, which enforces `(schedule, owner, start)`
//!   uniqueness and lists a chain in start order
//!
//! Each `apply` runs in one write transaction. On error the transaction is
//! dropped, which aborts it.

use std::path::Path;

use cadence_core::{
    CadenceError, CadenceResult, Fact, FactId, IntervalRecord, Owner, ScheduleKey,
    Source, SourceId, SourceType, StorageError, TimeRange,
};
use chrono::NaiveDate;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::changes::{apply_changes, ApplyTarget, PendingChanges};
use crate::RegistryStore;

const MAX_DBS: u32 = 5;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for LmdbStoreError {
    fn from(e: heed::Error) -> Self {
        LmdbStoreError::Transaction(e.to_string())
    }
}

impl From<LmdbStoreError> for CadenceError {
    fn from(e: LmdbStoreError) -> Self {
        match e {
            LmdbStoreError::Serialization(reason) | LmdbStoreError::Deserialization(reason) => {
                CadenceError::Storage(StorageError::Serialization { reason })
            }
            other => CadenceError::Storage(StorageError::TransactionFailed {
                reason: other.to_string(),
            }),
        }
    }
}

type Table = Database<Bytes, Bytes>;

#[derive(Clone, Copy)]
struct Tables {
    sources: Table,
    facts: Table,
    fact_source_index: Table,
    interval_index: Table,
    constants: Table,
}

/// Registry store persisted in an LMDB environment.
pub struct LmdbStore {
    env: Env,
    tables: Tables,
}

impl LmdbStore {
    /// Open (creating if needed) the environment under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - A database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, LmdbStoreError> {
        let map_size = map_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            LmdbStoreError::EnvOpen(format!("map size of {map_size_mb} MiB overflows"))
        })?;
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per store and never
        // concurrently mapped with different options from this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(MAX_DBS)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn()?;
        let mut create = |name: &str| -> Result<Table, LmdbStoreError> {
            env.create_database(&mut wtxn, Some(name))
                .map_err(|e| LmdbStoreError::DbOpen(format!("{name}: {e}")))
        };
        let tables = Tables {
            sources: create("sources")?,
            facts: create("facts")?,
            fact_source_index: create("fact_source_index")?,
            interval_index: create("interval_index")?,
            constants: create("constants")?,
        };
        wtxn.commit()?;

        tracing::debug!(path = %path.as_ref().display(), map_size_mb, "Opened LMDB store");
        Ok(Self { env, tables })
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&Tables, &RoTxn) -> Result<T, LmdbStoreError>,
    ) -> CadenceResult<T> {
        let rtxn = self.env.read_txn().map_err(LmdbStoreError::from)?;
        Ok(f(&self.tables, &rtxn)?)
    }
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// KEYS AND ENCODING
// ============================================================================

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, LmdbStoreError> {
    serde_json::to_vec(value).map_err(|e| LmdbStoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, LmdbStoreError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbStoreError::Deserialization(e.to_string()))
}

fn decode_id(bytes: &[u8]) -> Result<Uuid, LmdbStoreError> {
    Uuid::from_slice(bytes).map_err(|e| LmdbStoreError::Deserialization(e.to_string()))
}

// Each component is length-prefixed, so no chain's prefix is a prefix of
// another chain's keys whatever bytes the schedule or owner contain.
fn chain_prefix(schedule: &ScheduleKey, owner: &Owner) -> Vec<u8> {
    let mut key = Vec::with_capacity(schedule.as_str().len() + owner.as_str().len() + 26);
    push_component(&mut key, schedule.as_str());
    push_component(&mut key, owner.as_str());
    key
}

fn push_component(key: &mut Vec<u8>, component: &str) {
    key.extend_from_slice(&(component.len() as u64).to_be_bytes());
    key.extend_from_slice(component.as_bytes());
}

fn interval_key(schedule: &ScheduleKey, owner: &Owner, start: NaiveDate) -> Vec<u8> {
    let mut key = chain_prefix(schedule, owner);
    key.extend_from_slice(start.format("%Y-%m-%d").to_string().as_bytes());
    key
}

fn fact_index_key(source_id: SourceId, fact_id: FactId) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(source_id.as_bytes());
    key[16..].copy_from_slice(fact_id.as_bytes());
    key
}

// ============================================================================
// READ HELPERS
// ============================================================================

fn get_source(t: &Tables, txn: &RoTxn, id: SourceId) -> Result<Option<Source>, LmdbStoreError> {
    t.sources
        .get(txn, id.as_bytes())?
        .map(decode)
        .transpose()
}

fn get_fact(t: &Tables, txn: &RoTxn, id: FactId) -> Result<Option<Fact>, LmdbStoreError> {
    t.facts.get(txn, id.as_bytes())?.map(decode).transpose()
}

fn fact_ids_by_source(
    t: &Tables,
    txn: &RoTxn,
    source_id: SourceId,
) -> Result<Vec<FactId>, LmdbStoreError> {
    let mut ids = Vec::new();
    for entry in t.fact_source_index.prefix_iter(txn, source_id.as_bytes())? {
        let (key, _) = entry?;
        ids.push(FactId::from(decode_id(&key[16..])?));
    }
    Ok(ids)
}

fn interval_record(
    t: &Tables,
    txn: &RoTxn,
    id: &[u8],
) -> Result<Option<IntervalRecord>, LmdbStoreError> {
    let source = get_source(t, txn, SourceId::from(decode_id(id)?))?;
    Ok(source.as_ref().and_then(IntervalRecord::from_source))
}

fn chain_records(
    t: &Tables,
    txn: &RoTxn,
    prefix: &[u8],
) -> Result<Vec<IntervalRecord>, LmdbStoreError> {
    let mut records = Vec::new();
    for entry in t.interval_index.prefix_iter(txn, prefix)? {
        let (_, id) = entry?;
        records.extend(interval_record(t, txn, id)?);
    }
    Ok(records)
}

// ============================================================================
// WRITE TARGET
// ============================================================================

struct LmdbWriter<'a> {
    tables: Tables,
    txn: RwTxn<'a>,
}

impl ApplyTarget for LmdbWriter<'_> {
    fn get_source(&mut self, id: SourceId) -> CadenceResult<Option<Source>> {
        Ok(get_source(&self.tables, &self.txn, id)?)
    }

    fn put_source(&mut self, source: &Source) -> CadenceResult<()> {
        let bytes = encode(source)?;
        self.tables
            .sources
            .put(&mut self.txn, source.source_id.as_bytes(), &bytes)
            .map_err(LmdbStoreError::from)?;
        if let Some(interval) = source.as_interval() {
            let key = interval_key(&interval.schedule, &interval.owner, interval.start);
            self.tables
                .interval_index
                .put(&mut self.txn, &key, source.source_id.as_bytes())
                .map_err(LmdbStoreError::from)?;
        }
        Ok(())
    }

    fn remove_source(&mut self, source: &Source) -> CadenceResult<()> {
        if let Some(interval) = source.as_interval() {
            let key = interval_key(&interval.schedule, &interval.owner, interval.start);
            self.tables
                .interval_index
                .delete(&mut self.txn, &key)
                .map_err(LmdbStoreError::from)?;
        }
        self.tables
            .sources
            .delete(&mut self.txn, source.source_id.as_bytes())
            .map_err(LmdbStoreError::from)?;
        Ok(())
    }

    fn interval_id_at(
        &mut self,
        schedule: &ScheduleKey,
        owner: &Owner,
        start: NaiveDate,
    ) -> CadenceResult<Option<SourceId>> {
        let key = interval_key(schedule, owner, start);
        let id = self
            .tables
            .interval_index
            .get(&self.txn, &key)
            .map_err(LmdbStoreError::from)?
            .map(decode_id)
            .transpose()?;
        Ok(id.map(SourceId::from))
    }

    fn get_fact(&mut self, id: FactId) -> CadenceResult<Option<Fact>> {
        Ok(get_fact(&self.tables, &self.txn, id)?)
    }

    fn put_fact(&mut self, previous: Option<&Fact>, fact: &Fact) -> CadenceResult<()> {
        if let Some(previous) = previous.filter(|p| p.source_id != fact.source_id) {
            let stale = fact_index_key(previous.source_id, previous.fact_id);
            self.tables
                .fact_source_index
                .delete(&mut self.txn, &stale)
                .map_err(LmdbStoreError::from)?;
        }
        let bytes = encode(fact)?;
        self.tables
            .facts
            .put(&mut self.txn, fact.fact_id.as_bytes(), &bytes)
            .map_err(LmdbStoreError::from)?;
        self.tables
            .fact_source_index
            .put(
                &mut self.txn,
                &fact_index_key(fact.source_id, fact.fact_id),
                &[],
            )
            .map_err(LmdbStoreError::from)?;
        Ok(())
    }

    fn remove_fact(&mut self, fact: &Fact) -> CadenceResult<()> {
        self.tables
            .fact_source_index
            .delete(&mut self.txn, &fact_index_key(fact.source_id, fact.fact_id))
            .map_err(LmdbStoreError::from)?;
        self.tables
            .facts
            .delete(&mut self.txn, fact.fact_id.as_bytes())
            .map_err(LmdbStoreError::from)?;
        Ok(())
    }

    fn fact_ids_by_source(&mut self, source_id: SourceId) -> CadenceResult<Vec<FactId>> {
        Ok(fact_ids_by_source(&self.tables, &self.txn, source_id)?)
    }

    fn put_constant(&mut self, key: &str, value: &str) -> CadenceResult<()> {
        self.tables
            .constants
            .put(&mut self.txn, key.as_bytes(), value.as_bytes())
            .map_err(LmdbStoreError::from)?;
        Ok(())
    }
}

// ============================================================================
// REGISTRY STORE
// ============================================================================

impl RegistryStore for LmdbStore {
    fn source_get(&self, id: SourceId) -> CadenceResult<Option<Source>> {
        self.read(|t, txn| get_source(t, txn, id))
    }

    fn sources_by_type(&self, source_type: SourceType) -> CadenceResult<Vec<Source>> {
        self.read(|t, txn| {
            let mut sources = Vec::new();
            for entry in t.sources.iter(txn)? {
                let (_, bytes) = entry?;
                let source: Source = decode(bytes)?;
                if source.source_type() == source_type {
                    sources.push(source);
                }
            }
            Ok(sources)
        })
    }

    fn intervals_for(
        &self,
        schedule: &ScheduleKey,
        owner: &Owner,
    ) -> CadenceResult<Vec<IntervalRecord>> {
        let prefix = chain_prefix(schedule, owner);
        self.read(|t, txn| chain_records(t, txn, &prefix))
    }

    fn interval_at(
        &self,
        schedule: &ScheduleKey,
        owner: &Owner,
        start: NaiveDate,
    ) -> CadenceResult<Option<IntervalRecord>> {
        let key = interval_key(schedule, owner, start);
        self.read(|t, txn| match t.interval_index.get(txn, &key)? {
            Some(id) => interval_record(t, txn, id),
            None => Ok(None),
        })
    }

    fn intervals_overlapping(
        &self,
        start: NaiveDate,
        finish: NaiveDate,
        owner: Option<&Owner>,
    ) -> CadenceResult<Vec<IntervalRecord>> {
        let records = self.all_intervals()?;
        Ok(crate::overlapping(records, start, finish, owner))
    }

    fn all_intervals(&self) -> CadenceResult<Vec<IntervalRecord>> {
        self.read(|t, txn| {
            let mut records = Vec::new();
            for entry in t.interval_index.iter(txn)? {
                let (_, id) = entry?;
                records.extend(interval_record(t, txn, id)?);
            }
            Ok(records)
        })
    }

    fn interval_count(&self) -> CadenceResult<usize> {
        self.read(|t, txn| Ok(t.interval_index.len(txn)? as usize))
    }

    fn fact_get(&self, id: FactId) -> CadenceResult<Option<Fact>> {
        self.read(|t, txn| get_fact(t, txn, id))
    }

    fn facts_by_source(&self, source_id: SourceId) -> CadenceResult<Vec<Fact>> {
        self.read(|t, txn| {
            let mut facts = Vec::new();
            for fact_id in fact_ids_by_source(t, txn, source_id)? {
                if let Some(fact) = get_fact(t, txn, fact_id)? {
                    facts.push(fact);
                }
            }
            Ok(facts)
        })
    }

    fn fact_time_range(&self, owner: Option<&Owner>) -> CadenceResult<TimeRange> {
        self.read(|t, txn| {
            let mut range = TimeRange::EMPTY;
            for entry in t.facts.iter(txn)? {
                let (_, bytes) = entry?;
                let fact: Fact = decode(bytes)?;
                crate::extend_with_fact(&mut range, &fact, owner);
            }
            Ok(range)
        })
    }

    fn fact_count(&self) -> CadenceResult<usize> {
        self.read(|t, txn| Ok(t.facts.len(txn)? as usize))
    }

    fn constant_get(&self, key: &str) -> CadenceResult<Option<String>> {
        self.read(|t, txn| {
            Ok(t.constants
                .get(txn, key.as_bytes())?
                .map(|v| String::from_utf8_lossy(v).into_owned()))
        })
    }

    fn apply(&self, changes: &PendingChanges) -> CadenceResult<()> {
        let txn = self.env.write_txn().map_err(LmdbStoreError::from)?;
        let mut writer = LmdbWriter {
            tables: self.tables,
            txn,
        };
        apply_changes(&mut writer, changes)?;
        writer.txn.commit().map_err(LmdbStoreError::from)?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::{FactValue, Interval, RepeatingSchedule, Schedule, Timestamp};
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store = LmdbStore::open(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn daily(owner: &str, start: NaiveDate) -> Source {
        Source::interval(Interval::for_frame(
            &RepeatingSchedule::daily(),
            Owner::new(owner),
            start,
        )
        .unwrap())
    }

    fn reading(source: &Source, time: &str) -> Fact {
        let time: Timestamp = time.parse().unwrap();
        Fact::new(
            source.source_id,
            Owner::new("diary"),
            "Rest HR",
            Some(time),
            Some(FactValue::Integer(47)),
        )
    }

    #[test]
    fn test_round_trip_sources_and_facts() {
        let (store, _dir) = create_test_store();
        let source = Source::plain();
        let fact = reading(&source, "2024-02-01T06:00:00Z");
        store
            .apply(&PendingChanges {
                new_sources: vec![source.clone()],
                new_facts: vec![fact.clone()],
                constants: vec![("timezone".to_string(), "UTC".to_string())],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(store.source_get(source.source_id).unwrap(), Some(source.clone()));
        assert_eq!(store.fact_get(fact.fact_id).unwrap(), Some(fact.clone()));
        assert_eq!(store.facts_by_source(source.source_id).unwrap(), vec![fact]);
        assert_eq!(
            store.sources_by_type(SourceType::Plain).unwrap(),
            vec![source]
        );
        assert_eq!(
            store.constant_get("timezone").unwrap(),
            Some("UTC".to_string())
        );
    }

    #[test]
    fn test_interval_chain_order_and_uniqueness() {
        let (store, _dir) = create_test_store();
        store
            .apply(&PendingChanges {
                new_sources: vec![
                    daily("o", d(2024, 1, 10)),
                    daily("o", d(2024, 1, 2)),
                    daily("o2", d(2024, 1, 1)),
                ],
                ..Default::default()
            })
            .unwrap();

        let key = RepeatingSchedule::daily().key();
        let starts: Vec<NaiveDate> = store
            .intervals_for(&key, &Owner::new("o"))
            .unwrap()
            .into_iter()
            .map(|r| r.interval.start)
            .collect();
        assert_eq!(starts, vec![d(2024, 1, 2), d(2024, 1, 10)]);

        let duplicate = store.apply(&PendingChanges {
            new_sources: vec![Source::plain(), daily("o", d(2024, 1, 2))],
            ..Default::default()
        });
        assert!(matches!(
            duplicate,
            Err(CadenceError::Storage(StorageError::UniqueViolation { .. }))
        ));
        assert_eq!(store.sources_by_type(SourceType::Plain).unwrap().len(), 0);
        assert_eq!(store.interval_count().unwrap(), 3);
    }

    #[test]
    fn test_delete_interval_cascades() {
        let (store, _dir) = create_test_store();
        let interval = daily("o", d(2024, 1, 2));
        let summary = reading(&interval, "2024-01-02T00:00:00Z");
        store
            .apply(&PendingChanges {
                new_sources: vec![interval.clone()],
                new_facts: vec![summary.clone()],
                ..Default::default()
            })
            .unwrap();

        store
            .apply(&PendingChanges {
                deleted_sources: vec![interval.clone()],
                ..Default::default()
            })
            .unwrap();

        assert_eq!(store.fact_get(summary.fact_id).unwrap(), None);
        assert_eq!(store.interval_count().unwrap(), 0);
        assert!(store
            .interval_at(&interval.as_interval().unwrap().schedule, &Owner::new("o"), d(2024, 1, 2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_fact_time_range_and_overlap_query() {
        let (store, _dir) = create_test_store();
        let source = Source::plain();
        store
            .apply(&PendingChanges {
                new_sources: vec![
                    source.clone(),
                    daily("o", d(2024, 1, 1)),
                    daily("o", d(2024, 1, 3)),
                ],
                new_facts: vec![
                    reading(&source, "1970-01-01T06:00:00Z"),
                    reading(&source, "2024-01-01T06:00:00Z"),
                    reading(&source, "2024-01-03T06:00:00Z"),
                ],
                ..Default::default()
            })
            .unwrap();

        let range = store.fact_time_range(None).unwrap();
        assert_eq!(range.start, Some("2024-01-01T06:00:00Z".parse().unwrap()));
        assert_eq!(range.finish, Some("2024-01-03T06:00:00Z".parse().unwrap()));

        let touching = store
            .intervals_overlapping(d(2024, 1, 2), d(2024, 1, 2), None)
            .unwrap();
        assert_eq!(touching.len(), 1);
        assert_eq!(touching[0].interval.start, d(2024, 1, 1));
    }

    #[test]
    fn test_reopen_preserves_data() {
        let temp_dir = TempDir::new().unwrap();
        let source = Source::plain();
        {
            let store = LmdbStore::open(temp_dir.path(), 10).unwrap();
            store
                .apply(&PendingChanges {
                    new_sources: vec![source.clone()],
                    ..Default::default()
                })
                .unwrap();
        }
        let store = LmdbStore::open(temp_dir.path(), 10).unwrap();
        assert_eq!(store.source_get(source.source_id).unwrap(), Some(source));
    }

    #[test]
    fn test_owner_with_nul_stays_in_its_own_chain() {
        let (store, _dir) = create_test_store();
        store
            .apply(&PendingChanges {
                new_sources: vec![daily("o", d(2024, 1, 1)), daily("o\0x", d(2024, 1, 2))],
                ..Default::default()
            })
            .unwrap();

        let key = RepeatingSchedule::daily().key();
        let plain: Vec<NaiveDate> = store
            .intervals_for(&key, &Owner::new("o"))
            .unwrap()
            .into_iter()
            .map(|r| r.interval.start)
            .collect();
        assert_eq!(plain, vec![d(2024, 1, 1)]);

        let tagged = store.intervals_for(&key, &Owner::new("o\0x")).unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].interval.owner, Owner::new("o\0x"));
        assert!(store
            .interval_at(&key, &Owner::new("o"), d(2024, 1, 2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_open_rejects_overflowing_map_size() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            LmdbStore::open(temp_dir.path(), usize::MAX),
            Err(LmdbStoreError::EnvOpen(_))
        ));
    }
}
