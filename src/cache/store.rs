use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sled::{Db, Tree};
use tracing::{debug, info};

use super::{CacheError, TensorCache};
use crate::protocol::{GenerationOptions, GenerationResult, RequestPrompt};

/// Tensor cache backed by sled.
///
/// Entries are never rewritten: a changed artifact URL is a new key.
#[derive(Clone)]
pub struct SledTensorCache {
    db: Db,
    tensors: Tree,
    completions: Tree,
}

impl SledTensorCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let db = sled::open(&path)?;
        let cache = Self::with_db(db)?;
        info!(
            "Opened tensor cache at {} ({} entries)",
            path.as_ref().display(),
            cache.tensors.len()
        );
        Ok(cache)
    }

    /// In-memory store that disappears on drop
    pub fn new_temp() -> Result<Self, CacheError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self, CacheError> {
        let tensors = db.open_tree("tensors")?;
        let completions = db.open_tree("completions")?;
        Ok(Self {
            db,
            tensors,
            completions,
        })
    }

    pub fn contains(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.tensors.contains_key(key.as_bytes())?)
    }

    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.tensors.remove(key.as_bytes())?.is_some())
    }

    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::with_capacity(self.tensors.len());
        for entry in self.tensors.iter().keys() {
            keys.push(String::from_utf8_lossy(&entry?).into_owned());
        }
        Ok(keys)
    }

    /// Drop every tensor and completion entry
    pub fn clear(&self) -> Result<(), CacheError> {
        self.tensors.clear()?;
        self.completions.clear()?;
        info!("Cleared tensor cache");
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut bytes = 0u64;
        for entry in self.tensors.iter().values() {
            bytes += entry?.len() as u64;
        }
        Ok(CacheStats {
            entries: self.tensors.len(),
            bytes,
            completions: self.completions.len(),
            disk_size_bytes: self.db.size_on_disk()?,
        })
    }

    pub async fn flush(&self) -> Result<(), CacheError> {
        self.db.flush_async().await?;
        Ok(())
    }

    /// Stable key for a completion request
    pub fn completion_key(
        model_id: &str,
        prompt: &RequestPrompt,
        options: &GenerationOptions,
    ) -> Result<String, CacheError> {
        let encoded = rmp_serde::to_vec(&(model_id, prompt, options))?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    pub fn get_completion(&self, key: &str) -> Result<Option<GenerationResult>, CacheError> {
        match self.completions.get(key.as_bytes())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn put_completion(&self, key: &str, result: &GenerationResult) -> Result<(), CacheError> {
        let data = rmp_serde::to_vec(result)?;
        self.completions.insert(key.as_bytes(), data)?;
        debug!("Stored completion {}", key);
        Ok(())
    }
}

#[async_trait]
impl TensorCache for SledTensorCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let value = self.tensors.get(key.as_bytes())?;
        debug!("Cache {} for {}", if value.is_some() { "hit" } else { "miss" }, key);
        Ok(value.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &str, blob: Vec<u8>) -> Result<(), CacheError> {
        let len = blob.len();
        self.tensors.insert(key.as_bytes(), blob)?;
        debug!("Cached {} bytes for {}", len, key);
        Ok(())
    }
}

/// Tensor cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
    pub completions: usize,
    pub disk_size_bytes: u64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: entries={}, bytes={}, completions={}, disk_size={}",
            self.entries, self.bytes, self.completions, self.disk_size_bytes
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FinishReason;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let cache = SledTensorCache::new_temp().unwrap();
        let blob: Vec<u8> = (0..=255).collect();

        cache.put("https://host/params_shard_0.bin", blob.clone()).await.unwrap();
        assert_eq!(cache.get("https://host/params_shard_0.bin").await.unwrap(), Some(blob));
        assert_eq!(cache.get("https://host/params_shard_1.bin").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = SledTensorCache::new(dir.path()).unwrap();
            cache.put("k", vec![1, 2, 3]).await.unwrap();
            cache.flush().await.unwrap();
        }

        let cache = SledTensorCache::new(dir.path()).unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(cache.contains("k").unwrap());
    }

    #[tokio::test]
    async fn test_stats_remove_and_clear() {
        let cache = SledTensorCache::new_temp().unwrap();
        cache.put("a", vec![0; 10]).await.unwrap();
        cache.put("b", vec![0; 5]).await.unwrap();

        let stats = cache.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.bytes, 15);

        assert!(cache.remove("a").unwrap());
        assert!(!cache.remove("a").unwrap());
        assert_eq!(cache.keys().unwrap(), vec!["b".to_string()]);

        cache.clear().unwrap();
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_completion_cache() {
        let cache = SledTensorCache::new_temp().unwrap();
        let prompt = RequestPrompt::text("hi");
        let options = GenerationOptions::default();

        let key = SledTensorCache::completion_key("m", &prompt, &options).unwrap();
        assert_eq!(key.len(), 64);
        assert_eq!(key, SledTensorCache::completion_key("m", &prompt, &options).unwrap());
        assert_ne!(key, SledTensorCache::completion_key("other", &prompt, &options).unwrap());

        let result = GenerationResult {
            request_id: Uuid::new_v4(),
            model_id: "m".to_string(),
            text: "hello".to_string(),
            finish_reason: FinishReason::EndOfSequence,
            prompt_tokens: 4,
            completion_tokens: 2,
            cached: false,
        };
        assert_eq!(cache.get_completion(&key).unwrap(), None);
        cache.put_completion(&key, &result).unwrap();
        assert_eq!(cache.get_completion(&key).unwrap(), Some(result));
    }
}
