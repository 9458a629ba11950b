//! Durable work queue with delayed visibility and at-least-once delivery
//!
//! Items move through three states:
//!
//! ```text
//! ready --dequeue--> leased --ack--> (deleted)
//!   ^                  |
//!   +---fail (retry)---+---fail (exhausted)--> dead
//!   +---visibility timeout (crash)
//! ```
//!
//! A leased item whose visibility deadline passes is handed out again, so a
//! consumer that dies mid-item never loses it. Once such an item has used up
//! its attempts it is dead-lettered instead.
//!
//! Each delivery owns the item only until its deadline. [`WorkQueue::ack`] and
//! [`WorkQueue::fail`] take the [`Delivery`] and match on the deadline, so a
//! consumer that overran its visibility timeout cannot touch a newer delivery.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::DEFAULT_BUSY_TIMEOUT_MS;
use crate::clock::{Clock, SystemClock};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS items (
    id          TEXT PRIMARY KEY,
    work_key    TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL,
    delay_ms    INTEGER NOT NULL,
    visible_at  INTEGER NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    state       TEXT NOT NULL,
    last_error  TEXT
);
CREATE INDEX IF NOT EXISTS items_state_visible ON items(state, visible_at);
";

const STATE_READY: &str = "ready";
const STATE_LEASED: &str = "leased";
const STATE_DEAD: &str = "dead";

const VISIBILITY_TIMEOUT_ERROR: &str = "visibility timeout";

/// Errors from queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue item not found: {0}")]
    NotFound(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(err: rusqlite::Error) -> Self {
        QueueError::Unavailable(err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Redelivery policy applied by [`WorkQueue::fail`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Deliveries allowed before an item is dead-lettered
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl QueuePolicy {
    /// Delay before the next delivery after `attempts` failed deliveries
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.backoff_base.saturating_mul(1u32 << exp).min(self.backoff_max)
    }
}

/// A unit of work waiting for, or undergoing, execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub work_key: String,
    pub enqueued_at_ms: i64,
    pub delay_ms: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueueItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            work_key: row.get("work_key")?,
            enqueued_at_ms: row.get("enqueued_at")?,
            delay_ms: row.get::<_, i64>("delay_ms")? as u64,
            attempts: row.get::<_, i64>("attempts")? as u32,
            last_error: row.get("last_error")?,
        })
    }
}

/// An item handed to a consumer, hidden from others until `deadline_ms`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub item: QueueItem,
    pub deadline_ms: i64,
}

/// What [`WorkQueue::fail`] decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Redelivered after the given delay
    Retry { after: Duration },
    /// Attempts exhausted; kept for inspection only
    Dead,
    /// The delivery's deadline passed and the item was left untouched
    Stale,
}

/// Item counts by state
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ready and visible now
    pub ready: u64,
    /// Ready but still inside their delay
    pub delayed: u64,
    /// Handed out and not yet acknowledged
    pub leased: u64,
    pub dead: u64,
}

/// SQLite-backed durable queue
#[derive(Debug)]
pub struct WorkQueue {
    conn: Connection,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
}

impl WorkQueue {
    /// Open or create the queue at `path`
    pub fn open(path: impl AsRef<Path>, policy: QueuePolicy) -> QueueResult<Self> {
        Self::open_with_clock(path, policy, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: impl AsRef<Path>, policy: QueuePolicy, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), ?policy, "WorkQueue::open: called");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| QueueError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, clock, policy })
    }

    /// Private in-memory queue (single connection; useful in tests)
    pub fn open_in_memory(policy: QueuePolicy) -> QueueResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            clock: Arc::new(SystemClock),
            policy,
        })
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Add an item that becomes visible after `delay`
    pub fn enqueue(&mut self, work_key: &str, delay: Duration) -> QueueResult<QueueItem> {
        let now = self.clock.now_ms();
        let delay_ms = delay.as_millis() as i64;
        let item = QueueItem {
            id: Uuid::now_v7().to_string(),
            work_key: work_key.to_string(),
            enqueued_at_ms: now,
            delay_ms: delay_ms as u64,
            attempts: 0,
            last_error: None,
        };

        self.conn.execute(
            "INSERT INTO items (id, work_key, enqueued_at, delay_ms, visible_at, attempts, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![item.id, item.work_key, now, delay_ms, now + delay_ms, STATE_READY],
        )?;

        debug!(id = %item.id, %work_key, delay_ms, "WorkQueue::enqueue: stored");
        Ok(item)
    }

    /// Claim the next visible item, hiding it for `visibility`
    ///
    /// Leased items whose deadline has passed are eligible again unless they
    /// have used up `max_attempts`, in which case they are dead-lettered.
    pub fn dequeue(&mut self, visibility: Duration) -> QueueResult<Option<Delivery>> {
        let now = self.clock.now_ms();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut item = loop {
            let candidate = tx
                .query_row(
                    "SELECT * FROM items
                     WHERE state IN (?1, ?2) AND visible_at <= ?3
                     ORDER BY visible_at, enqueued_at, id
                     LIMIT 1",
                    params![STATE_READY, STATE_LEASED, now],
                    |row| Ok((QueueItem::from_row(row)?, row.get::<_, String>("state")?)),
                )
                .optional()?;

            let Some((item, state)) = candidate else {
                tx.commit()?;
                return Ok(None);
            };

            if state == STATE_LEASED && item.attempts >= self.policy.max_attempts {
                tx.execute(
                    "UPDATE items SET state = ?2, last_error = ?3 WHERE id = ?1",
                    params![item.id, STATE_DEAD, VISIBILITY_TIMEOUT_ERROR],
                )?;
                info!(id = %item.id, attempts = item.attempts, "WorkQueue::dequeue: dead-lettered after visibility timeout");
                continue;
            }
            break item;
        };

        let deadline_ms = now + visibility.as_millis() as i64;
        item.attempts += 1;
        tx.execute(
            "UPDATE items SET state = ?2, visible_at = ?3, attempts = ?4 WHERE id = ?1",
            params![item.id, STATE_LEASED, deadline_ms, item.attempts],
        )?;
        tx.commit()?;

        if item.attempts > 1 {
            debug!(id = %item.id, attempts = item.attempts, "WorkQueue::dequeue: redelivery");
        }
        Ok(Some(Delivery { item, deadline_ms }))
    }

    /// Acknowledge successful processing; the item is removed
    ///
    /// Returns `false` if the delivery no longer owns the item.
    pub fn ack(&mut self, delivery: &Delivery) -> QueueResult<bool> {
        let id = &delivery.item.id;
        let removed = self.conn.execute(
            "DELETE FROM items WHERE id = ?1 AND state = ?2 AND visible_at = ?3",
            params![id, STATE_LEASED, delivery.deadline_ms],
        )?;
        if removed == 0 {
            warn!(%id, "WorkQueue::ack: delivery no longer owns the item (lease expired or already acknowledged)");
        }
        Ok(removed > 0)
    }

    /// Report a failed delivery; schedules a retry or dead-letters the item
    pub fn fail(&mut self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome> {
        let id = &delivery.item.id;
        let now = self.clock.now_ms();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT attempts, state, visible_at FROM items WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (attempts, state, visible_at) = row.ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let attempts = attempts as u32;

        if state != STATE_LEASED || visible_at != delivery.deadline_ms {
            tx.commit()?;
            warn!(%id, %state, "WorkQueue::fail: delivery no longer owns the item, ignoring");
            return Ok(FailOutcome::Stale);
        }

        let outcome = if attempts >= self.policy.max_attempts {
            tx.execute(
                "UPDATE items SET state = ?2, last_error = ?3 WHERE id = ?1",
                params![id, STATE_DEAD, error],
            )?;
            FailOutcome::Dead
        } else {
            let after = self.policy.backoff(attempts);
            tx.execute(
                "UPDATE items SET state = ?2, visible_at = ?3, last_error = ?4 WHERE id = ?1",
                params![id, STATE_READY, now + after.as_millis() as i64, error],
            )?;
            FailOutcome::Retry { after }
        };
        tx.commit()?;

        match &outcome {
            FailOutcome::Dead => info!(%id, attempts, %error, "WorkQueue::fail: dead-lettered"),
            FailOutcome::Retry { after } => debug!(%id, attempts, ?after, "WorkQueue::fail: retry scheduled"),
            FailOutcome::Stale => {}
        }
        Ok(outcome)
    }

    pub fn stats(&mut self) -> QueueResult<QueueStats> {
        let now = self.clock.now_ms();
        let stats = self.conn.query_row(
            "SELECT
                COALESCE(SUM(state = ?1 AND visible_at <= ?4), 0),
                COALESCE(SUM(state = ?1 AND visible_at > ?4), 0),
                COALESCE(SUM(state = ?2), 0),
                COALESCE(SUM(state = ?3), 0)
             FROM items",
            params![STATE_READY, STATE_LEASED, STATE_DEAD, now],
            |row| {
                Ok(QueueStats {
                    ready: row.get::<_, i64>(0)? as u64,
                    delayed: row.get::<_, i64>(1)? as u64,
                    leased: row.get::<_, i64>(2)? as u64,
                    dead: row.get::<_, i64>(3)? as u64,
                })
            },
        )?;
        Ok(stats)
    }

    /// Dead-lettered items, most recent first
    pub fn dead_letters(&mut self, limit: usize) -> QueueResult<Vec<QueueItem>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM items WHERE state = ?1 ORDER BY enqueued_at DESC LIMIT ?2")?;
        let items = stmt
            .query_map(params![STATE_DEAD, limit as i64], QueueItem::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }
}
