use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{CacheError, TensorCache};
use crate::protocol::SandboxEvent;

#[derive(Debug)]
enum CacheReply {
    Value(Option<Vec<u8>>),
    Ack(bool),
}

/// Sandbox-side view of the host's tensor cache.
///
/// Requests go out as `CacheGet`/`CachePut` events; replies are matched by
/// correlation id. A read that is not answered in time counts as a miss.
#[derive(Clone)]
pub struct CacheBridge {
    events: mpsc::Sender<SandboxEvent>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<CacheReply>>>>,
    next_correlation: Arc<AtomicU64>,
    read_timeout: Duration,
}

impl CacheBridge {
    pub fn new(events: mpsc::Sender<SandboxEvent>, read_timeout: Duration) -> Self {
        Self {
            events,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_correlation: Arc::new(AtomicU64::new(1)),
            read_timeout,
        }
    }

    /// Deliver the host's answer to a `CacheGet`
    pub async fn complete_value(&self, correlation: u64, value: Option<Vec<u8>>) {
        self.complete(correlation, CacheReply::Value(value)).await;
    }

    /// Deliver the host's answer to a `CachePut`
    pub async fn complete_ack(&self, correlation: u64, ok: bool) {
        self.complete(correlation, CacheReply::Ack(ok)).await;
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn complete(&self, correlation: u64, reply: CacheReply) {
        match self.pending.lock().await.remove(&correlation) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!("Dropping late cache reply {}", correlation),
        }
    }

    async fn request(&self, event: impl FnOnce(u64) -> SandboxEvent) -> Result<CacheReply, CacheError> {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(correlation, tx);

        if self.events.send(event(correlation)).await.is_err() {
            self.pending.lock().await.remove(&correlation);
            return Err(CacheError::Closed);
        }

        match timeout(self.read_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CacheError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&correlation);
                Err(CacheError::Timeout)
            }
        }
    }
}

#[async_trait]
impl TensorCache for CacheBridge {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let owned = key.to_string();
        match self
            .request(|correlation| SandboxEvent::CacheGet { correlation, key: owned })
            .await
        {
            Ok(CacheReply::Value(value)) => Ok(value),
            Ok(CacheReply::Ack(_)) => {
                warn!("Unexpected cache ack for read of {}", key);
                Ok(None)
            }
            Err(e) => {
                debug!("Cache read for {} degraded to miss: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), CacheError> {
        let owned = key.to_string();
        match self
            .request(|correlation| SandboxEvent::CachePut {
                correlation,
                key: owned,
                blob,
            })
            .await?
        {
            CacheReply::Ack(true) => Ok(()),
            _ => Err(CacheError::Rejected(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SledTensorCache;
    use std::time::Instant;

    /// Answers bridge requests from a store, the way the host pump does
    fn serve(mut rx: mpsc::Receiver<SandboxEvent>, bridge: CacheBridge, store: SledTensorCache) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SandboxEvent::CacheGet { correlation, key } => {
                        let value = store.get(&key).await.unwrap_or(None);
                        bridge.complete_value(correlation, value).await;
                    }
                    SandboxEvent::CachePut { correlation, key, blob } => {
                        let ok = store.put(&key, blob).await.is_ok();
                        bridge.complete_ack(correlation, ok).await;
                    }
                    _ => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn test_round_trip_through_host() {
        let (tx, rx) = mpsc::channel(16);
        let bridge = CacheBridge::new(tx, Duration::from_secs(5));
        serve(rx, bridge.clone(), SledTensorCache::new_temp().unwrap());

        let blob = vec![9u8; 4096];
        bridge.put("https://host/params_shard_3.bin", blob.clone()).await.unwrap();
        assert_eq!(bridge.get("https://host/params_shard_3.bin").await.unwrap(), Some(blob));
        assert_eq!(bridge.get("https://host/unknown.bin").await.unwrap(), None);
        assert_eq!(bridge.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_unanswered_read_is_bounded_miss() {
        let (tx, _rx) = mpsc::channel(16);
        let bridge = CacheBridge::new(tx, Duration::from_millis(50));

        let started = Instant::now();
        assert_eq!(bridge.get("never-answered").await.unwrap(), None);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(bridge.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_closed_channel_is_miss_for_reads() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let bridge = CacheBridge::new(tx, Duration::from_secs(5));

        assert_eq!(bridge.get("k").await.unwrap(), None);
        assert!(matches!(bridge.put("k", vec![1]).await, Err(CacheError::Closed)));
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped() {
        let (tx, _rx) = mpsc::channel(16);
        let bridge = CacheBridge::new(tx, Duration::from_millis(10));
        assert_eq!(bridge.get("k").await.unwrap(), None);

        bridge.complete_value(1, Some(vec![1])).await;
        assert_eq!(bridge.pending_requests().await, 0);
    }
}
