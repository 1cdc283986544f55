//! Configuration for the data-share store.

use std::path::PathBuf;
use std::time::Duration;

/// Default database file name, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "datashare.db";

/// Default schema version written to the database's `user_version` pragma.
pub const DEFAULT_SCHEMA_VERSION: i32 = 1;

/// Default time-to-live for temporary values (5 minutes).
pub const DEFAULT_TEMP_TTL: Duration = Duration::from_secs(300);

/// Configuration for the data-share store.
///
/// Supplied at construction and fixed for the lifetime of the store
/// instance. There is no ambient/global configuration lookup.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the SQLite database file backing persistent entries.
    pub db_path: PathBuf,

    /// Schema version expected by this build.
    pub schema_version: i32,

    /// TTL applied to temporary values when the caller does not pass one.
    pub default_temp_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            schema_version: DEFAULT_SCHEMA_VERSION,
            default_temp_ttl: DEFAULT_TEMP_TTL,
        }
    }
}

impl StoreConfig {
    /// Create a configuration pointing at the given database path.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    /// Set the database path.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Set the schema version.
    pub fn with_schema_version(mut self, version: i32) -> Self {
        self.schema_version = version;
        self
    }

    /// Set the default TTL for temporary values.
    pub fn with_default_temp_ttl(mut self, ttl: Duration) -> Self {
        self.default_temp_ttl = ttl;
        self
    }
}
