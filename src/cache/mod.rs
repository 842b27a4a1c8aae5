use async_trait::async_trait;
use thiserror::Error;

pub mod bridge;
pub mod store;

pub use bridge::CacheBridge;
pub use store::{CacheStats, SledTensorCache};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("Failed to encode cache entry: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode cache entry: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Cache request timed out")]
    Timeout,

    #[error("Cache channel closed")]
    Closed,

    #[error("Cache write for {0} was rejected")]
    Rejected(String),
}

/// Durable key/value store for model artifacts, keyed by source path
#[async_trait]
pub trait TensorCache: Send + Sync {
    /// `None` is a miss
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), CacheError>;
}
