//! Durable backend trait for pluggable storage.
//!
//! The store keeps its read path in memory and mirrors persistent writes
//! through a [`DurableBackend`]. Implementations can use different storage
//! technologies while providing a consistent interface; [`NoDurability`]
//! gives a memory-only store for callers that don't need values to survive
//! a restart.
//!
//! # Thread safety
//!
//! All implementations must be `Send + Sync` so a store can be shared
//! across tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A record as written to durable storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Entry key, unique within the store.
    pub key: String,

    /// Stored value.
    pub value: Value,

    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
}

impl PersistedEntry {
    /// Create an entry stamped with the current time.
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp: Utc::now(),
        }
    }
}

/// Trait for durable storage backends.
///
/// Methods are synchronous; the store invokes them from its async
/// operations. A backend is opened lazily by the store's `init` and may be
/// re-opened after `close`.
pub trait DurableBackend: Send + Sync + 'static {
    /// Open the backend, creating the underlying storage if absent.
    ///
    /// Opening an already-open backend is a no-op.
    fn open(&self) -> Result<()>;

    /// Load every persisted entry, for replay into the memory cache.
    fn load_all(&self) -> Result<Vec<PersistedEntry>>;

    /// Write an entry, overwriting any existing record for its key.
    fn put(&self, entry: &PersistedEntry) -> Result<()>;

    /// Delete the record for a key. Deleting an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Delete all records.
    fn clear(&self) -> Result<()>;

    /// Number of persisted records.
    fn count(&self) -> Result<usize>;

    /// Release the storage handle. Closing a closed backend is a no-op.
    fn close(&self);
}

impl<B: DurableBackend> DurableBackend for std::sync::Arc<B> {
    fn open(&self) -> Result<()> {
        (**self).open()
    }

    fn load_all(&self) -> Result<Vec<PersistedEntry>> {
        (**self).load_all()
    }

    fn put(&self, entry: &PersistedEntry) -> Result<()> {
        (**self).put(entry)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn count(&self) -> Result<usize> {
        (**self).count()
    }

    fn close(&self) {
        (**self).close()
    }
}

/// A no-op backend for memory-only operation.
///
/// Nothing is ever persisted: loads yield no entries and the record count
/// is always zero.
#[derive(Debug, Clone, Default)]
pub struct NoDurability;

impl DurableBackend for NoDurability {
    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<PersistedEntry>> {
        Ok(Vec::new())
    }

    fn put(&self, _entry: &PersistedEntry) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }

    fn count(&self) -> Result<usize> {
        Ok(0)
    }

    fn close(&self) {}
}

/// In-memory mock backend for tests.
///
/// Counts opens and snapshot loads so init idempotence can be asserted,
/// and can be switched into a failure mode to exercise degraded writes.
#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::{DurableBackend, PersistedEntry};
    use crate::error::{Error, Result};

    #[derive(Default)]
    pub(crate) struct MockBackend {
        records: Mutex<HashMap<String, PersistedEntry>>,
        pub(crate) opens: AtomicUsize,
        pub(crate) loads: AtomicUsize,
        fail_open: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl MockBackend {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Make the next `open` calls fail.
        pub(crate) fn set_fail_open(&self, fail: bool) {
            self.fail_open.store(fail, Ordering::SeqCst);
        }

        /// Make `put`/`remove`/`clear` fail.
        pub(crate) fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn seed(&self, entry: PersistedEntry) {
            self.records.lock().insert(entry.key.clone(), entry);
        }

        fn backend_error() -> Error {
            Error::Database(rusqlite::Error::InvalidQuery)
        }
    }

    impl DurableBackend for MockBackend {
        fn open(&self) -> Result<()> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(Self::backend_error());
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn load_all(&self) -> Result<Vec<PersistedEntry>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.lock().values().cloned().collect())
        }

        fn put(&self, entry: &PersistedEntry) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::backend_error());
            }
            self.records
                .lock()
                .insert(entry.key.clone(), entry.clone());
            Ok(())
        }

        fn remove(&self, key: &str) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::backend_error());
            }
            self.records.lock().remove(key);
            Ok(())
        }

        fn clear(&self) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Self::backend_error());
            }
            self.records.lock().clear();
            Ok(())
        }

        fn count(&self) -> Result<usize> {
            Ok(self.records.lock().len())
        }

        fn close(&self) {}
    }
}
