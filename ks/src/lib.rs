//! KeyStore - shared coordination state for keypace replicas
//!
//! Two persistence primitives live here, both usable from several processes
//! at once:
//!
//! - [`KvStore`] - a key-value store with atomic increment-with-expiry,
//!   set-if-absent-with-expiry, get, set and delete. [`SqliteStore`] is the
//!   multi-process backend; [`MemoryStore`] is an in-process fake with an
//!   injectable clock and a simulated outage switch.
//! - [`WorkQueue`] - a durable queue with delayed visibility, at-least-once
//!   delivery and per-item failure backoff.
//!
//! # Architecture
//!
//! ```text
//! ~/.local/share/keypace/
//! ├── store.db     # kv table: key, value, expires_at
//! └── queue.db     # items table: ready / leased / dead work items
//! ```
//!
//! # Example
//!
//! ```ignore
//! use keystore::{KvStore, SqliteStore};
//!
//! let mut store = SqliteStore::open("store.db")?;
//! let count = store.incr_with_ttl("keypace:123:count:29000000", Duration::from_secs(60))?;
//! let acquired = store.set_nx("keypace:123:lock", "token", Duration::from_secs(10))?;
//! ```

pub mod cli;
mod clock;
mod kv;
mod memory;
mod queue;
mod sqlite;

pub use clock::{Clock, ManualClock, SystemClock};
pub use kv::{KvError, KvResult, KvStore};
pub use memory::MemoryStore;
pub use queue::{
    Delivery, FailOutcome, QueueError, QueueItem, QueuePolicy, QueueResult, QueueStats, WorkQueue,
};
pub use sqlite::SqliteStore;

/// SQLite busy timeout applied to every connection (milliseconds)
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
