//! CADENCE Core - Entity Types
//!
//! Data structures and frame arithmetic shared by every CADENCE crate:
//! identities, local-date conversion, schedules, sources, intervals, facts,
//! errors and configuration. Persistence lives in `cadence-storage`.

pub mod config;
pub mod error;
pub mod fact;
pub mod identity;
pub mod schedule;
pub mod source;
pub mod time;

pub use config::{
    CadenceConfig, StorageBackend, StorageConfig, TimezoneConfig, MAX_MAP_SIZE_MB, STORAGE_PATH_ENV,
};
pub use error::{
    CadenceError, CadenceResult, ConfigError, EntityType, GapError, ScheduleError, SourceError,
    StorageError,
};
pub use fact::{Fact, FactUpdate, FactValue};
pub use identity::{new_entity_id, FactId, SourceId, Timestamp};
pub use schedule::{Frame, FrameUnit, RepeatingSchedule, Schedule, ScheduleKey};
pub use source::{Interval, IntervalRecord, Owner, Source, SourceKind, SourceType};
pub use time::{is_reserved, reserved_day_end, LocalZone, TimeRange, RESERVED_DAY_SECONDS};
