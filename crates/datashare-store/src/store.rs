//! The data-share store.
//!
//! `ShareStore` fronts an in-memory cache with a write-through durable
//! backend. Reads are synchronous and served from memory; writes update
//! memory first, then mirror to the backend, then notify watchers. The
//! backend is opened lazily on first use and its contents are replayed
//! into the cache before the store becomes ready.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::backend::{DurableBackend, NoDurability, PersistedEntry};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::pattern::KeyPattern;
use crate::sqlite::SqliteBackend;
use crate::watch::{WatchHandle, WatcherRegistry};

/// How a write landed.
///
/// The memory cache is always updated; this reports what happened on the
/// durable side. A failed durable write never rolls back the memory write,
/// so callers that need durability must check for
/// [`DurabilityLost`](WriteOutcome::DurabilityLost) themselves.
#[derive(Debug)]
pub enum WriteOutcome {
    /// Applied to the memory cache and the durable backend.
    Durable,

    /// Applied to the memory cache only, as requested.
    MemoryOnly,

    /// Applied to the memory cache, but the durable write failed.
    DurabilityLost(Error),

    /// No entry existed; nothing was changed.
    Unchanged,
}

impl WriteOutcome {
    /// Whether the change reached durable storage.
    pub fn is_durable(&self) -> bool {
        matches!(self, WriteOutcome::Durable)
    }

    /// Whether the memory and durable state may now diverge.
    pub fn is_degraded(&self) -> bool {
        matches!(self, WriteOutcome::DurabilityLost(_))
    }
}

/// Store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    /// Keys currently held in the memory cache.
    pub memory_keys: usize,

    /// Records in durable storage (zero if the backend count failed).
    pub durable_keys: usize,

    /// Registered watcher entries.
    pub watchers: usize,

    /// Keys with an active temp-expiry timer.
    pub temp_timers: usize,
}

struct TempTimer {
    handle: JoinHandle<()>,
    generation: u64,
}

/// Inner state shared by store clones and expiry timers.
struct StoreInner<B: DurableBackend> {
    config: StoreConfig,
    backend: B,

    /// Authoritative state for reads.
    cache: RwLock<HashMap<String, Value>>,

    watchers: WatcherRegistry,

    /// Active temp-expiry timers, at most one per key.
    timers: Mutex<HashMap<String, TempTimer>>,
    timer_generation: AtomicU64,

    /// Whether the backend has been opened and replayed into the cache.
    ready: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
}

impl<B: DurableBackend> StoreInner<B> {
    /// Expire a temporary value: drop it from memory (durable storage was
    /// never written for it) and notify watchers with the captured value.
    fn expire_temp(&self, key: &str, value: Value, generation: u64) {
        {
            let mut timers = self.timers.lock();
            // A re-armed timer may already have replaced ours.
            match timers.get(key) {
                Some(t) if t.generation == generation => {
                    timers.remove(key);
                }
                _ => return,
            }
        }

        self.cache.write().remove(key);
        debug!(key, "temporary value expired");
        self.watchers.notify(key, None, Some(&value));
    }
}

impl<B: DurableBackend> Drop for StoreInner<B> {
    fn drop(&mut self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.handle.abort();
        }
    }
}

/// Persistent key-value store with watchers and TTL'd temporaries.
///
/// Cheap to clone; clones share the same cache, backend, watchers, and
/// timers. See the crate docs for an overview and example.
pub struct ShareStore<B: DurableBackend = SqliteBackend> {
    inner: Arc<StoreInner<B>>,
}

impl ShareStore<SqliteBackend> {
    /// Create a store persisting to the configured SQLite database.
    ///
    /// The database is not touched until [`init`](Self::init) (or the
    /// first operation that awaits it).
    pub fn new(config: StoreConfig) -> Self {
        let backend = SqliteBackend::new(&config);
        Self::with_backend(config, backend)
    }
}

impl ShareStore<NoDurability> {
    /// Create a memory-only store: nothing survives the process.
    pub fn ephemeral() -> Self {
        Self::with_backend(StoreConfig::default(), NoDurability)
    }
}

impl<B: DurableBackend> ShareStore<B> {
    /// Create a store over a custom durable backend.
    pub fn with_backend(config: StoreConfig, backend: B) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                config,
                backend,
                cache: RwLock::new(HashMap::new()),
                watchers: WatcherRegistry::default(),
                timers: Mutex::new(HashMap::new()),
                timer_generation: AtomicU64::new(0),
                ready: AtomicBool::new(false),
                init_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Get the store configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Whether the durable backend is open and replayed into the cache.
    pub fn is_initialized(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Open the durable backend and replay its entries into the cache.
    ///
    /// Idempotent and safe to call concurrently: all callers observe a
    /// single backend open and a single snapshot load. On failure the
    /// store stays uninitialized and the next call retries.
    pub async fn init(&self) -> Result<()> {
        if self.inner.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.inner.init_lock.lock().await;
        if self.inner.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        self.inner.backend.open()?;
        let entries = self.inner.backend.load_all()?;
        let count = entries.len();
        {
            let mut cache = self.inner.cache.write();
            for entry in entries {
                cache.insert(entry.key, entry.value);
            }
        }

        self.inner.ready.store(true, Ordering::Release);
        debug!(entries = count, "store initialized");
        Ok(())
    }

    /// Write a value.
    ///
    /// The memory cache is updated unconditionally; with `persist` the
    /// entry is also written through to the durable backend, overwriting
    /// any existing record. Watchers are notified after the memory write
    /// regardless of the persistence outcome.
    pub async fn set(&self, key: &str, value: Value, persist: bool) -> Result<WriteOutcome> {
        validate_key(key)?;
        self.init().await?;

        let old = self
            .inner
            .cache
            .write()
            .insert(key.to_string(), value.clone());
        trace!(key, persist, "set");

        let outcome = if persist {
            match self.inner.backend.put(&PersistedEntry::new(key, value.clone())) {
                Ok(()) => WriteOutcome::Durable,
                Err(e) => {
                    warn!(key, error = %e, "durable write failed, value held in memory only");
                    WriteOutcome::DurabilityLost(e)
                }
            }
        } else {
            WriteOutcome::MemoryOnly
        };

        self.inner.watchers.notify(key, Some(&value), old.as_ref());
        Ok(outcome)
    }

    /// Serialize a typed value and [`set`](Self::set) it.
    pub async fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        persist: bool,
    ) -> Result<WriteOutcome> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, persist).await
    }

    /// Read a value from the memory cache.
    ///
    /// Never touches the backend and never triggers initialization;
    /// before [`init`](Self::init) completes this sees only what has been
    /// written in this session.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.cache.read().get(key).cloned()
    }

    /// Read a value and deserialize it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Remove a key from memory and, best-effort, from durable storage.
    ///
    /// Watchers are notified with `(None, old_value)`. Clearing an absent
    /// key changes nothing and notifies nobody.
    pub async fn clear(&self, key: &str) -> Result<WriteOutcome> {
        validate_key(key)?;
        self.init().await?;

        let Some(old) = self.inner.cache.write().remove(key) else {
            return Ok(WriteOutcome::Unchanged);
        };
        debug!(key, "cleared");

        let outcome = match self.inner.backend.remove(key) {
            Ok(()) => WriteOutcome::Durable,
            Err(e) => {
                warn!(key, error = %e, "durable delete failed");
                WriteOutcome::DurabilityLost(e)
            }
        };

        self.inner.watchers.notify(key, None, Some(&old));
        Ok(outcome)
    }

    /// Remove every entry from memory and durable storage.
    ///
    /// Watchers are notified once per previously-existing key.
    pub async fn clear_all(&self) -> Result<WriteOutcome> {
        self.init().await?;

        let drained: Vec<(String, Value)> = self.inner.cache.write().drain().collect();
        debug!(count = drained.len(), "cleared all entries");

        let outcome = match self.inner.backend.clear() {
            Ok(()) => WriteOutcome::Durable,
            Err(e) => {
                warn!(error = %e, "durable clear failed");
                WriteOutcome::DurabilityLost(e)
            }
        };

        for (key, old) in &drained {
            self.inner.watchers.notify(key, None, Some(old));
        }
        Ok(outcome)
    }

    /// Write a temporary, memory-only value that expires after `ttl`
    /// (the configured default when `None`).
    ///
    /// On expiry the key is dropped from the memory cache and watchers
    /// are notified with `(None, value)`. Re-arming a key cancels its
    /// previous timer; `set`/`clear` do not.
    pub async fn temp(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<WriteOutcome> {
        let outcome = self.set(key, value.clone(), false).await?;
        let ttl = ttl.unwrap_or(self.inner.config.default_temp_ttl);

        let generation = self.inner.timer_generation.fetch_add(1, Ordering::Relaxed);
        let timer_key = key.to_string();
        let weak = Arc::downgrade(&self.inner);

        // Hold the timer table lock across spawn + insert so an
        // immediately-firing timer cannot observe a stale table.
        let mut timers = self.inner.timers.lock();
        if let Some(prev) = timers.remove(key) {
            prev.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_temp(&timer_key, value, generation);
            }
        });
        timers.insert(key.to_string(), TempTimer { handle, generation });

        trace!(key, ttl_ms = ttl.as_millis() as u64, "temporary value armed");
        Ok(outcome)
    }

    /// Watch one or more keys/patterns for changes.
    ///
    /// The callback is invoked as `(new_value, old_value, key)` on every
    /// write or delete matching any of the keys. A key containing `*` is
    /// a glob pattern; see [`KeyPattern`](crate::KeyPattern) for the
    /// matching rules. The returned handle unsubscribes every entry
    /// registered by this call.
    pub fn watch<I, K, F>(&self, keys: I, callback: F) -> WatchHandle
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: Fn(Option<&Value>, Option<&Value>, &str) + Send + Sync + 'static,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.inner.watchers.register(keys, callback)
    }

    /// Snapshot of every cached entry.
    pub fn all(&self) -> HashMap<String, Value> {
        self.inner.cache.read().clone()
    }

    /// Currently cached keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.cache.read().keys().cloned().collect()
    }

    /// Cached keys matching a pattern, using watch-pattern semantics.
    pub fn keys_by_pattern(&self, pattern: &str) -> Vec<String> {
        let pattern = KeyPattern::new(pattern);
        self.inner
            .cache
            .read()
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.cache.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.cache.read().is_empty()
    }

    /// Whether a key is currently cached.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.cache.read().contains_key(key)
    }

    /// Store statistics. The durable record count is best-effort and
    /// reported as zero if the backend query fails.
    pub async fn stats(&self) -> Result<StoreStats> {
        self.init().await?;

        let durable_keys = match self.inner.backend.count() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "durable count failed");
                0
            }
        };

        Ok(StoreStats {
            memory_keys: self.inner.cache.read().len(),
            durable_keys,
            watchers: self.inner.watchers.count(),
            temp_timers: self.inner.timers.lock().len(),
        })
    }

    /// Release the durable connection.
    ///
    /// The memory cache, watchers, and pending temp timers are untouched;
    /// the next operation that requires initialization re-opens the
    /// backend.
    pub async fn close(&self) {
        let _guard = self.inner.init_lock.lock().await;
        self.inner.backend.close();
        self.inner.ready.store(false, Ordering::Release);
        debug!("store closed");
    }
}

impl<B: DurableBackend> Clone for ShareStore<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must be a non-empty string".into()));
    }
    Ok(())
}
