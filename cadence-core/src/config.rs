//! Configuration types
//!
//! All fields are required unless explicitly marked optional.

use crate::{CadenceError, CadenceResult, ConfigError, LocalZone};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding `storage.path`.
pub const STORAGE_PATH_ENV: &str = "CADENCE_STORAGE_PATH";

const MAX_OFFSET_SECONDS: i32 = 24 * 60 * 60;

/// Upper bound on `storage.map_size_mb` (1 TiB).
pub const MAX_MAP_SIZE_MB: usize = 1024 * 1024;

/// Local timezone settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimezoneConfig {
    /// Label persisted in the store; a change triggers a full recompute.
    pub name: String,
    /// Offset east of UTC.
    pub utc_offset_seconds: i32,
}

/// Which store backs the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Lmdb,
}

/// Storage settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory for the LMDB environment (required for `lmdb`).
    pub path: Option<PathBuf>,
    pub map_size_mb: usize,
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CadenceConfig {
    pub timezone: TimezoneConfig,
    pub storage: StorageConfig,
}

impl CadenceConfig {
    /// In-memory store on UTC, for tests and throwaway registries.
    pub fn in_memory() -> Self {
        Self {
            timezone: TimezoneConfig {
                name: "UTC".to_string(),
                utc_offset_seconds: 0,
            },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                path: None,
                map_size_mb: 64,
            },
        }
    }

    /// Load, apply environment overrides, and validate.
    pub fn from_path(path: &Path) -> CadenceResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        if let Ok(path) = std::env::var(STORAGE_PATH_ENV) {
            config.storage.path = Some(PathBuf::from(path));
            config.validate()?;
        }
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(contents: &str) -> CadenceResult<Self> {
        let config: CadenceConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(CadenceError::Config) if invalid.
    ///
    /// Validates:
    /// - timezone.name is not empty
    /// - |timezone.utc_offset_seconds| < 24h
    /// - storage.path is present for the lmdb backend
    /// - 0 < storage.map_size_mb <= MAX_MAP_SIZE_MB
    pub fn validate(&self) -> CadenceResult<()> {
        if self.timezone.name.trim().is_empty() {
            return Err(CadenceError::Config(ConfigError::InvalidValue {
                field: "timezone.name".to_string(),
                value: self.timezone.name.clone(),
                reason: "timezone.name must not be empty".to_string(),
            }));
        }

        if self.timezone.utc_offset_seconds.abs() >= MAX_OFFSET_SECONDS {
            return Err(CadenceError::Config(ConfigError::InvalidValue {
                field: "timezone.utc_offset_seconds".to_string(),
                value: self.timezone.utc_offset_seconds.to_string(),
                reason: "offset must be within one day of UTC".to_string(),
            }));
        }

        if self.storage.backend == StorageBackend::Lmdb {
            match &self.storage.path {
                None => {
                    return Err(CadenceError::Config(ConfigError::MissingRequired {
                        field: "storage.path".to_string(),
                    }))
                }
                Some(path) if path.as_os_str().is_empty() => {
                    return Err(CadenceError::Config(ConfigError::InvalidValue {
                        field: "storage.path".to_string(),
                        value: String::new(),
                        reason: "storage.path must not be empty".to_string(),
                    }))
                }
                Some(_) => {}
            }
        }

        if self.storage.map_size_mb == 0 {
            return Err(CadenceError::Config(ConfigError::InvalidValue {
                field: "storage.map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "map_size_mb must be greater than 0".to_string(),
            }));
        }

        if self.storage.map_size_mb > MAX_MAP_SIZE_MB {
            return Err(CadenceError::Config(ConfigError::InvalidValue {
                field: "storage.map_size_mb".to_string(),
                value: self.storage.map_size_mb.to_string(),
                reason: format!("map_size_mb must not exceed {MAX_MAP_SIZE_MB}"),
            }));
        }

        Ok(())
    }

    /// The configured local zone.
    pub fn local_zone(&self) -> CadenceResult<LocalZone> {
        LocalZone::from_offset_seconds(&self.timezone.name, self.timezone.utc_offset_seconds)
            .ok_or_else(|| {
                CadenceError::Config(ConfigError::InvalidValue {
                    field: "timezone.utc_offset_seconds".to_string(),
                    value: self.timezone.utc_offset_seconds.to_string(),
                    reason: "not a valid UTC offset".to_string(),
                })
            })
    }
}

// =============================================================================
// TESTS
// =============================================================================
