//! Error types for CADENCE operations

use crate::{Owner, ScheduleKey};
use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

/// Entity type discriminator used in error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Source,
    Interval,
    Fact,
    Constant,
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity_type:?} with id {id}")]
    NotFound { entity_type: EntityType, id: Uuid },

    #[error("Duplicate id for {entity_type:?}: {id}")]
    DuplicateId { entity_type: EntityType, id: Uuid },

    #[error("Unique constraint (schedule, owner, start) violated: {schedule} / {owner} / {start}")]
    UniqueViolation {
        schedule: ScheduleKey,
        owner: Owner,
        start: NaiveDate,
    },

    #[error("Fact {fact_id} references missing source {source_id}")]
    ForeignKey { fact_id: Uuid, source_id: Uuid },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Gap detection errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GapError {
    /// No qualifying facts exist, so there is nothing to measure gaps against.
    /// This is "not ready", never "fully covered".
    #[error("No facts yet{}", owner_suffix(.fact_owner))]
    NoFactsYet { fact_owner: Option<Owner> },
}

fn owner_suffix(owner: &Option<Owner>) -> String {
    owner
        .as_ref()
        .map(|o| format!(" for owner {o}"))
        .unwrap_or_default()
}

/// Source contract errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("time_range is not implemented for source {source_id} of kind {kind}")]
    TimeRangeUnsupported { source_id: Uuid, kind: String },
}

/// Schedule errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Cannot parse schedule '{spec}': {reason}")]
    Parse { spec: String, reason: String },

    #[error("Schedule {schedule} did not advance past {date}")]
    NotAdvancing { schedule: ScheduleKey, date: NaiveDate },

    #[error("{start} is not a frame start of schedule {schedule} (frame starts {frame_start})")]
    Misaligned {
        schedule: ScheduleKey,
        start: NaiveDate,
        frame_start: NaiveDate,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all CADENCE errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CadenceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Gap detection error: {0}")]
    Gap(#[from] GapError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CadenceError {
    /// True for the recoverable "wait for data" condition.
    pub fn is_no_facts_yet(&self) -> bool {
        matches!(self, CadenceError::Gap(GapError::NoFactsYet { .. }))
    }
}

/// Result type alias for CADENCE operations.
pub type CadenceResult<T> = Result<T, CadenceError>;

// =============================================================================
// TESTS
// =============================================================================
