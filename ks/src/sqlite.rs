//! SQLite-backed KvStore
//!
//! Every mutating primitive runs inside a `BEGIN IMMEDIATE` transaction, which
//! takes the database write lock up front. That makes the read-modify-write
//! sequences below atomic across every connection to the same file, including
//! connections held by other processes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use crate::DEFAULT_BUSY_TIMEOUT_MS;
use crate::clock::{Clock, SystemClock};
use crate::kv::{KvResult, KvStore, parse_counter, remaining};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv(expires_at);
";

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?2)";

/// KvStore over a single SQLite database file
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    clock: Arc<dyn Clock>,
}

impl SqliteStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> KvResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "SqliteStore::open: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| crate::KvError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn, clock)
    }

    /// Private in-memory database (single connection; useful in tests)
    pub fn open_in_memory() -> KvResult<Self> {
        Self::init(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> KvResult<Self> {
        conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, clock })
    }

    fn ms(ttl: Duration) -> i64 {
        ttl.as_millis() as i64
    }
}

impl KvStore for SqliteStore {
    fn incr_with_ttl(&mut self, key: &str, ttl: Duration) -> KvResult<i64> {
        let now = self.clock.now_ms();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                &format!("SELECT value FROM kv WHERE key = ?1 AND {}", LIVE),
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;

        let next = match current {
            Some(value) => {
                let next = parse_counter(key, &value)? + 1;
                tx.execute("UPDATE kv SET value = ?2 WHERE key = ?1", params![key, next.to_string()])?;
                next
            }
            None => {
                tx.execute(
                    "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, '1', ?2)",
                    params![key, now + Self::ms(ttl)],
                )?;
                1
            }
        };

        tx.commit()?;
        Ok(next)
    }

    fn set_nx(&mut self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let now = self.clock.now_ms();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: bool = tx
            .query_row(
                &format!("SELECT 1 FROM kv WHERE key = ?1 AND {}", LIVE),
                params![key, now],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        if !exists {
            tx.execute(
                "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, now + Self::ms(ttl)],
            )?;
        }

        tx.commit()?;
        Ok(!exists)
    }

    fn get(&mut self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now_ms();
        let value = self
            .conn
            .query_row(
                &format!("SELECT value FROM kv WHERE key = ?1 AND {}", LIVE),
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let now = self.clock.now_ms();
        let expires_at = ttl.map(|t| now + Self::ms(t));
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> KvResult<bool> {
        let now = self.clock.now_ms();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(&format!("DELETE FROM kv WHERE key = ?1 AND {}", LIVE), params![key, now])?;
        // Stale row, if any
        tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn delete_if_equals(&mut self, key: &str, expected: &str) -> KvResult<bool> {
        let now = self.clock.now_ms();
        let removed = self.conn.execute(
            &format!("DELETE FROM kv WHERE key = ?1 AND {} AND value = ?3", LIVE),
            params![key, now, expected],
        )?;
        Ok(removed > 0)
    }

    fn ttl(&mut self, key: &str) -> KvResult<Option<Duration>> {
        let now = self.clock.now_ms();
        let expires_at: Option<Option<i64>> = self
            .conn
            .query_row(
                &format!("SELECT expires_at FROM kv WHERE key = ?1 AND {}", LIVE),
                params![key, now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(expires_at.and_then(|at| remaining(at, now)))
    }

    fn purge_expired(&mut self) -> KvResult<usize> {
        let now = self.clock.now_ms();
        let removed = self
            .conn
            .execute("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1", params![now])?;
        debug!(removed, "SqliteStore::purge_expired: done");
        Ok(removed)
    }
}
