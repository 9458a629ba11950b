//! Async client for the persistent work queue
//!
//! Same ownership model as [`crate::store`]: one actor thread owns the
//! [`WorkQueue`] connection and answers commands over a channel.

use std::time::Duration;

use keystore::{Delivery, FailOutcome, QueueError, QueueItem, QueueResult, QueueStats, WorkQueue};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug)]
enum QueueCommand {
    Enqueue {
        work_key: String,
        delay: Duration,
        reply: oneshot::Sender<QueueResult<QueueItem>>,
    },
    Dequeue {
        visibility: Duration,
        reply: oneshot::Sender<QueueResult<Option<Delivery>>>,
    },
    Ack {
        delivery: Delivery,
        reply: oneshot::Sender<QueueResult<bool>>,
    },
    Fail {
        delivery: Delivery,
        error: String,
        reply: oneshot::Sender<QueueResult<FailOutcome>>,
    },
    Stats {
        reply: oneshot::Sender<QueueResult<QueueStats>>,
    },
    DeadLetters {
        limit: usize,
        reply: oneshot::Sender<QueueResult<Vec<QueueItem>>>,
    },
}

/// Cloneable handle to the queue actor
#[derive(Clone, Debug)]
pub struct QueueClient {
    tx: mpsc::Sender<QueueCommand>,
}

impl QueueClient {
    pub fn spawn(queue: WorkQueue) -> QueueResult<Self> {
        debug!(policy = ?queue.policy(), "QueueClient::spawn: called");
        let (tx, rx) = mpsc::channel(256);
        std::thread::Builder::new()
            .name("keypace-queue".to_string())
            .spawn(move || actor_loop(queue, rx))
            .map_err(|e| QueueError::Unavailable(format!("failed to spawn queue actor: {}", e)))?;
        Ok(Self { tx })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<QueueResult<T>>) -> QueueCommand) -> QueueResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| QueueError::Unavailable("queue actor stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| QueueError::Unavailable("queue actor dropped the request".to_string()))?
    }

    pub async fn enqueue(&self, work_key: &str, delay: Duration) -> QueueResult<QueueItem> {
        debug!(%work_key, ?delay, "enqueue: called");
        self.request(|reply| QueueCommand::Enqueue {
            work_key: work_key.to_string(),
            delay,
            reply,
        })
        .await
    }

    pub async fn dequeue(&self, visibility: Duration) -> QueueResult<Option<Delivery>> {
        self.request(|reply| QueueCommand::Dequeue { visibility, reply }).await
    }

    /// `false` if the visibility deadline passed and the item was redelivered
    pub async fn ack(&self, delivery: &Delivery) -> QueueResult<bool> {
        debug!(id = %delivery.item.id, "ack: called");
        self.request(|reply| QueueCommand::Ack {
            delivery: delivery.clone(),
            reply,
        })
        .await
    }

    /// Hand a failed item back to the queue's redelivery policy
    pub async fn fail(&self, delivery: &Delivery, error: &str) -> QueueResult<FailOutcome> {
        debug!(id = %delivery.item.id, %error, "fail: called");
        self.request(|reply| QueueCommand::Fail {
            delivery: delivery.clone(),
            error: error.to_string(),
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        self.request(|reply| QueueCommand::Stats { reply }).await
    }

    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<QueueItem>> {
        self.request(|reply| QueueCommand::DeadLetters { limit, reply }).await
    }
}

fn actor_loop(mut queue: WorkQueue, mut rx: mpsc::Receiver<QueueCommand>) {
    debug!("Queue actor started");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            QueueCommand::Enqueue { work_key, delay, reply } => {
                let _ = reply.send(queue.enqueue(&work_key, delay));
            }
            QueueCommand::Dequeue { visibility, reply } => {
                let _ = reply.send(queue.dequeue(visibility));
            }
            QueueCommand::Ack { delivery, reply } => {
                let _ = reply.send(queue.ack(&delivery));
            }
            QueueCommand::Fail { delivery, error, reply } => {
                let _ = reply.send(queue.fail(&delivery, &error));
            }
            QueueCommand::Stats { reply } => {
                let _ = reply.send(queue.stats());
            }
            QueueCommand::DeadLetters { limit, reply } => {
                let _ = reply.send(queue.dead_letters(limit));
            }
        }
    }

    debug!("Queue actor stopped");
}
