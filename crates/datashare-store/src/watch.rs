//! Change watchers.
//!
//! Callbacks can be registered against exact keys or glob patterns and are
//! invoked with `(new_value, old_value, key)` after every write or delete.
//! Exact-key watchers fire before pattern watchers; within each pass,
//! watchers fire in registration order. A panicking callback is isolated
//! and logged, and never prevents the remaining watchers from running.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, trace};

use crate::pattern::KeyPattern;

/// Callback invoked on changes, as `(new_value, old_value, key)`.
///
/// `None` stands for "no value": the old value of a fresh key, or the new
/// value of a deleted one.
pub type ChangeCallback = Arc<dyn Fn(Option<&Value>, Option<&Value>, &str) + Send + Sync>;

struct ExactEntry {
    id: u64,
    callback: ChangeCallback,
}

struct PatternEntry {
    id: u64,
    pattern: KeyPattern,
    callback: ChangeCallback,
}

#[derive(Default)]
struct RegistryState {
    /// Watchers on exact keys, in registration order per key.
    exact: HashMap<String, Vec<ExactEntry>>,

    /// Watchers on glob patterns, in global registration order.
    patterns: Vec<PatternEntry>,
}

/// Registry of change watchers.
#[derive(Default)]
pub(crate) struct WatcherRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl WatcherRegistry {
    /// Register one callback under each of the given keys/patterns.
    ///
    /// Returns a handle that unsubscribes every entry created here.
    pub(crate) fn register<F>(&self, keys: Vec<String>, callback: F) -> WatchHandle
    where
        F: Fn(Option<&Value>, Option<&Value>, &str) + Send + Sync + 'static,
    {
        let callback: ChangeCallback = Arc::new(callback);
        let mut ids = Vec::with_capacity(keys.len());
        let mut state = self.inner.state.write();

        for key in keys {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            ids.push(id);

            let pattern = KeyPattern::new(key);
            trace!(pattern = %pattern.as_str(), id, "watcher registered");

            if pattern.is_exact() {
                state
                    .exact
                    .entry(pattern.as_str().to_string())
                    .or_default()
                    .push(ExactEntry {
                        id,
                        callback: Arc::clone(&callback),
                    });
            } else {
                state.patterns.push(PatternEntry {
                    id,
                    pattern,
                    callback: Arc::clone(&callback),
                });
            }
        }

        WatchHandle {
            registry: Arc::downgrade(&self.inner),
            ids,
        }
    }

    /// Notify watchers of a change to `key`.
    ///
    /// Callbacks run outside the registry lock, so a watcher may freely
    /// register or unsubscribe other watchers; such changes take effect
    /// from the next notification.
    pub(crate) fn notify(&self, key: &str, new: Option<&Value>, old: Option<&Value>) {
        let callbacks: Vec<ChangeCallback> = {
            let state = self.inner.state.read();
            let exact = state
                .exact
                .get(key)
                .into_iter()
                .flatten()
                .map(|e| Arc::clone(&e.callback));
            let patterns = state
                .patterns
                .iter()
                .filter(|e| e.pattern.matches(key))
                .map(|e| Arc::clone(&e.callback));
            exact.chain(patterns).collect()
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(new, old, key))).is_err() {
                error!(key, "watcher callback panicked");
            }
        }
    }

    /// Number of registered watcher entries (exact and pattern).
    pub(crate) fn count(&self) -> usize {
        let state = self.inner.state.read();
        state.exact.values().map(Vec::len).sum::<usize>() + state.patterns.len()
    }
}

/// Handle returned by `watch`; unsubscribes all entries of one call.
///
/// Dropping the handle without calling [`unsubscribe`](Self::unsubscribe)
/// leaves the watchers registered for the lifetime of the store.
pub struct WatchHandle {
    registry: Weak<RegistryInner>,
    ids: Vec<u64>,
}

impl WatchHandle {
    /// Remove every watcher entry registered by the originating `watch`
    /// call. A no-op if the store has already been dropped.
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let mut state = registry.state.write();
        for id in &self.ids {
            trace!(id, "watcher unsubscribed");
        }
        state.exact.retain(|_, entries| {
            entries.retain(|e| !self.ids.contains(&e.id));
            !entries.is_empty()
        });
        state.patterns.retain(|e| !self.ids.contains(&e.id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recording(
        log: &Arc<Mutex<Vec<(String, Option<Value>, Option<Value>)>>>,
    ) -> impl Fn(Option<&Value>, Option<&Value>, &str) + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |new, old, key| {
            log.lock()
                .push((key.to_string(), new.cloned(), old.cloned()));
        }
    }

    #[test]
    fn exact_watcher_receives_change() {
        let registry = WatcherRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _handle = registry.register(vec!["user.name".into()], recording(&log));

        registry.notify("user.name", Some(&Value::from("a")), None);
        registry.notify("other", Some(&Value::from("b")), None);

        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "user.name");
        assert_eq!(log[0].1, Some(Value::from("a")));
        assert_eq!(log[0].2, None);
    }

    #[test]
    fn pattern_watcher_matches_anchored() {
        let registry = WatcherRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _handle = registry.register(vec!["user.*".into()], recording(&log));

        registry.notify("user.name", Some(&Value::from(1)), None);
        registry.notify("superuser.name", Some(&Value::from(2)), None);

        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn exact_fires_before_pattern() {
        let registry = WatcherRegistry::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let _p = registry.register(vec!["user.*".into()], move |_, _, _| o.lock().push("pattern"));
        let o = Arc::clone(&order);
        let _e = registry.register(vec!["user.name".into()], move |_, _, _| o.lock().push("exact"));

        registry.notify("user.name", Some(&Value::from(1)), None);

        assert_eq!(*order.lock(), vec!["exact", "pattern"]);
    }

    #[test]
    fn unsubscribe_removes_all_entries_of_call() {
        let registry = WatcherRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = registry.register(
            vec!["a".into(), "b".into(), "c.*".into()],
            recording(&log),
        );
        assert_eq!(registry.count(), 3);

        handle.unsubscribe();
        assert_eq!(registry.count(), 0);

        registry.notify("a", Some(&Value::from(1)), None);
        registry.notify("c.x", Some(&Value::from(2)), None);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn unsubscribe_leaves_other_watchers() {
        let registry = WatcherRegistry::default();
        let log_a = Arc::new(Mutex::new(Vec::new()));
        let log_b = Arc::new(Mutex::new(Vec::new()));

        let handle_a = registry.register(vec!["k".into()], recording(&log_a));
        let _handle_b = registry.register(vec!["k".into()], recording(&log_b));

        handle_a.unsubscribe();
        registry.notify("k", Some(&Value::from(1)), None);

        assert!(log_a.lock().is_empty());
        assert_eq!(log_b.lock().len(), 1);
    }

    #[test]
    fn panicking_watcher_does_not_stop_others() {
        let registry = WatcherRegistry::default();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _bad = registry.register(vec!["k".into()], |_, _, _| panic!("boom"));
        let _good = registry.register(vec!["k".into()], recording(&log));

        registry.notify("k", Some(&Value::from(1)), None);

        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn watcher_can_unsubscribe_during_notification() {
        let registry = WatcherRegistry::default();
        let slot: Arc<Mutex<Option<WatchHandle>>> = Arc::new(Mutex::new(None));

        let s = Arc::clone(&slot);
        let _self_removing = registry.register(vec!["k".into()], move |_, _, _| {
            if let Some(handle) = s.lock().take() {
                handle.unsubscribe();
            }
        });
        let handle = registry.register(vec!["k".into()], |_, _, _| {});
        *slot.lock() = Some(handle);

        registry.notify("k", Some(&Value::from(1)), None);
        assert_eq!(registry.count(), 1);
    }
}
