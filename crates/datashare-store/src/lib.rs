//! Persistent key-value data share with watchers and TTL'd temporaries.
//!
//! This crate provides a page-session style data store for applications
//! that want synchronous reads with durable state underneath:
//! - An in-memory cache as the authoritative read path
//! - Write-through persistence to SQLite, replayed into the cache on init
//! - Change watchers on exact keys or glob patterns (`user.*`)
//! - Temporary values that expire after a TTL, memory-only
//!
//! # Example
//!
//! ```no_run
//! use datashare_store::{ShareStore, StoreConfig};
//! use serde_json::json;
//!
//! # async fn demo() -> datashare_store::Result<()> {
//! let store = ShareStore::new(StoreConfig::new("app-data.db"));
//! store.init().await?;
//!
//! store.set("user.name", json!("hong"), true).await?;
//! assert_eq!(store.get("user.name"), Some(json!("hong")));
//!
//! let handle = store.watch(["user.*"], |new, _old, key| {
//!     println!("{key} changed to {new:?}");
//! });
//! store.set("user.email", json!("hong@example.com"), true).await?;
//! handle.unsubscribe();
//! # Ok(())
//! # }
//! ```

mod backend;
mod config;
mod error;
mod pattern;
mod sqlite;
mod store;
mod watch;

pub use backend::{DurableBackend, NoDurability, PersistedEntry};
pub use config::{DEFAULT_DB_PATH, DEFAULT_SCHEMA_VERSION, DEFAULT_TEMP_TTL, StoreConfig};
pub use error::{Error, Result};
pub use pattern::KeyPattern;
pub use sqlite::SqliteBackend;
pub use store::{ShareStore, StoreStats, WriteOutcome};
pub use watch::{ChangeCallback, WatchHandle};
