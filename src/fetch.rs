use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cache::TensorCache;
use crate::catalog::{ArtifactKind, ModelConfig};

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("GET {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("GET {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },
}

/// Source of artifact bytes
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Fetches artifacts over HTTP(S)
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let transport = |e: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await.map_err(transport)?;
        debug!("Fetched {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }
}

/// Upper bound on tries per artifact, whatever the configuration says
pub const MAX_FETCH_ATTEMPTS: u32 = 3;

/// Fetch with at most `attempts` tries (clamped to `1..=MAX_FETCH_ATTEMPTS`)
/// and a fixed delay between them
pub async fn fetch_with_retry(
    fetcher: &dyn ArtifactFetcher,
    url: &str,
    attempts: u32,
    delay: Duration,
) -> Result<Vec<u8>, FetchError> {
    let attempts = attempts.clamp(1, MAX_FETCH_ATTEMPTS);
    let mut last = String::new();

    for attempt in 1..=attempts {
        match fetcher.fetch(url).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                warn!("Fetch attempt {}/{} for {} failed: {}", attempt, attempts, url, e);
                last = e.to_string();
                if attempt < attempts {
                    sleep(delay).await;
                }
            }
        }
    }

    Err(FetchError::Exhausted {
        url: url.to_string(),
        attempts,
        last,
    })
}

/// Loaded artifact bytes keyed by source URL
#[derive(Debug, Clone, Default)]
pub struct ArtifactSet {
    entries: HashMap<String, (ArtifactKind, Vec<u8>)>,
    pub cache_hits: usize,
    pub fetched: usize,
}

impl ArtifactSet {
    pub fn insert(&mut self, key: String, kind: ArtifactKind, bytes: Vec<u8>) {
        self.entries.insert(key, (kind, bytes));
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(|(_, bytes)| bytes.as_slice())
    }

    /// First artifact of a kind
    pub fn first_of(&self, kind: ArtifactKind) -> Option<&[u8]> {
        self.entries
            .values()
            .find(|(k, _)| *k == kind)
            .map(|(_, bytes)| bytes.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|(_, bytes)| bytes.len()).sum()
    }
}

/// Progress of an artifact load
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub fraction: f32,
    pub done: usize,
    pub total: usize,
    pub key: String,
    pub from_cache: bool,
}

/// Loads model artifacts through a tensor cache, fetching on a miss
pub struct ArtifactLoader<C: TensorCache> {
    cache: C,
    fetcher: Arc<dyn ArtifactFetcher>,
    attempts: u32,
    retry_delay: Duration,
}

impl<C: TensorCache> ArtifactLoader<C> {
    pub fn new(cache: C, fetcher: Arc<dyn ArtifactFetcher>, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            cache,
            fetcher,
            attempts,
            retry_delay,
        }
    }

    /// Load every artifact of `model`.
    ///
    /// Progress tops out below 1.0; the last share belongs to runtime
    /// instantiation.
    pub async fn load<F>(&self, model: &ModelConfig, mut on_progress: F) -> Result<ArtifactSet, FetchError>
    where
        F: FnMut(LoadProgress) + Send,
    {
        let artifacts = model.artifacts();
        let total = artifacts.len();
        let mut set = ArtifactSet::default();

        for (i, artifact) in artifacts.into_iter().enumerate() {
            let cached = match self.cache.get(&artifact.key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!("Cache read for {} failed, fetching instead: {}", artifact.key, e);
                    None
                }
            };

            let from_cache = cached.is_some();
            let bytes = match cached {
                Some(bytes) => {
                    set.cache_hits += 1;
                    bytes
                }
                None => {
                    let bytes = fetch_with_retry(
                        self.fetcher.as_ref(),
                        &artifact.key,
                        self.attempts,
                        self.retry_delay,
                    )
                    .await?;
                    set.fetched += 1;
                    if let Err(e) = self.cache.put(&artifact.key, bytes.clone()).await {
                        warn!("Failed to cache {}: {}", artifact.key, e);
                    }
                    bytes
                }
            };

            on_progress(LoadProgress {
                fraction: (i + 1) as f32 / (total + 1) as f32,
                done: i + 1,
                total,
                key: artifact.key.clone(),
                from_cache,
            });
            set.insert(artifact.key, artifact.kind, bytes);
        }

        info!(
            "Loaded {} artifacts for {} ({} from cache, {} fetched, {} bytes)",
            set.len(),
            model.id,
            set.cache_hits,
            set.fetched,
            set.total_bytes()
        );
        Ok(set)
    }
}
