//! StoreClient - handle to the actor that owns the KvStore backend

use std::time::Duration;

use keystore::KvStore;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use super::messages::{StoreCommand, StoreError, StoreResult};

const CHANNEL_CAPACITY: usize = 256;

/// Handle to send commands to the store actor
///
/// The backend does blocking I/O, so the actor runs on its own OS thread
/// rather than on the async runtime. Losing the actor (the thread panicked or
/// was shut down) is reported as [`StoreError::Unavailable`], like any other
/// backend outage.
#[derive(Clone)]
pub struct StoreClient {
    tx: mpsc::Sender<StoreCommand>,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient").field("closed", &self.tx.is_closed()).finish()
    }
}

impl StoreClient {
    /// Spawn a store actor owning `store`
    pub fn spawn<S: KvStore + 'static>(store: S) -> StoreResult<Self> {
        debug!("StoreClient::spawn: called");
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        std::thread::Builder::new()
            .name("keypace-store".to_string())
            .spawn(move || actor_loop(Box::new(store), rx))
            .map_err(|e| StoreError::Unavailable(format!("failed to spawn store actor: {}", e)))?;
        info!("StoreClient spawned");
        Ok(Self { tx })
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> StoreCommand) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StoreError::Unavailable("store actor stopped".to_string()))?;
        reply_rx
            .await
            .map_err(|_| StoreError::Unavailable("store actor dropped the request".to_string()))?
    }

    /// Atomic increment; TTL applied only when the key is created
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        debug!(%key, ?ttl, "incr_with_ttl: called");
        self.request(|reply| StoreCommand::IncrWithTtl {
            key: key.to_string(),
            ttl,
            reply,
        })
        .await
    }

    /// Create the key only if absent
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        debug!(%key, ?ttl, "set_nx: called");
        self.request(|reply| StoreCommand::SetNx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
            reply,
        })
        .await
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        debug!(%key, "get: called");
        self.request(|reply| StoreCommand::Get {
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        debug!(%key, ?ttl, "set: called");
        self.request(|reply| StoreCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
            reply,
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        debug!(%key, "delete: called");
        self.request(|reply| StoreCommand::Delete {
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Compare-and-delete
    pub async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        debug!(%key, "delete_if_equals: called");
        self.request(|reply| StoreCommand::DeleteIfEquals {
            key: key.to_string(),
            expected: expected.to_string(),
            reply,
        })
        .await
    }

    pub async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        debug!(%key, "ttl: called");
        self.request(|reply| StoreCommand::Ttl {
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub async fn purge_expired(&self) -> StoreResult<usize> {
        debug!("purge_expired: called");
        self.request(|reply| StoreCommand::PurgeExpired { reply }).await
    }

    /// Stop the actor; later requests fail with `Unavailable`
    pub async fn shutdown(&self) {
        debug!("shutdown: called");
        let _ = self.tx.send(StoreCommand::Shutdown).await;
    }
}

fn actor_loop(mut store: Box<dyn KvStore>, mut rx: mpsc::Receiver<StoreCommand>) {
    debug!("Store actor started");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            StoreCommand::IncrWithTtl { key, ttl, reply } => {
                let _ = reply.send(store.incr_with_ttl(&key, ttl).map_err(StoreError::from));
            }
            StoreCommand::SetNx { key, value, ttl, reply } => {
                let _ = reply.send(store.set_nx(&key, &value, ttl).map_err(StoreError::from));
            }
            StoreCommand::Get { key, reply } => {
                let _ = reply.send(store.get(&key).map_err(StoreError::from));
            }
            StoreCommand::Set { key, value, ttl, reply } => {
                let _ = reply.send(store.set(&key, &value, ttl).map_err(StoreError::from));
            }
            StoreCommand::Delete { key, reply } => {
                let _ = reply.send(store.delete(&key).map_err(StoreError::from));
            }
            StoreCommand::DeleteIfEquals { key, expected, reply } => {
                let _ = reply.send(store.delete_if_equals(&key, &expected).map_err(StoreError::from));
            }
            StoreCommand::Ttl { key, reply } => {
                let _ = reply.send(store.ttl(&key).map_err(StoreError::from));
            }
            StoreCommand::PurgeExpired { reply } => {
                let _ = reply.send(store.purge_expired().map_err(StoreError::from));
            }
            StoreCommand::Shutdown => {
                debug!("actor_loop: Shutdown command");
                break;
            }
        }
    }

    debug!("Store actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystore::MemoryStore;

    #[tokio::test]
    async fn test_round_trip_through_actor() {
        let client = StoreClient::spawn(MemoryStore::new()).unwrap();

        assert_eq!(client.incr_with_ttl("c", Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(client.incr_with_ttl("c", Duration::from_secs(60)).await.unwrap(), 2);
        assert!(client.set_nx("lock", "t", Duration::from_secs(1)).await.unwrap());
        assert!(!client.set_nx("lock", "u", Duration::from_secs(1)).await.unwrap());
        assert_eq!(client.get("lock").await.unwrap().as_deref(), Some("t"));
        assert!(client.delete_if_equals("lock", "t").await.unwrap());
        assert_eq!(client.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_outage_maps_to_unavailable() {
        let backend = MemoryStore::new();
        let client = StoreClient::spawn(backend.clone()).unwrap();

        backend.set_available(false);
        let err = client.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_shutdown_makes_client_unavailable() {
        let client = StoreClient::spawn(MemoryStore::new()).unwrap();
        client.shutdown().await;

        // The actor drains the channel and exits; give it a moment
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(client.get("k").await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_corrupt_counter() {
        let client = StoreClient::spawn(MemoryStore::new()).unwrap();
        client.set("c", "not-a-number", None).await.unwrap();
        let err = client.incr_with_ttl("c", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
