//! Deterministic fakes for unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use crate::catalog::{ArtifactKind, DType, DeviceFeature, ModelCatalog, ModelConfig, WindowConfig};
use crate::config::HostConfig;
use crate::fetch::{ArtifactFetcher, ArtifactSet, FetchError};
use crate::runtime::{DeviceInfo, LoadedRuntime, ModelRuntime, RuntimeBackend, RuntimeError};
use crate::tokenizer::{Tokenizer, TokenizerError};

const BYTE_OFFSET: u32 = 3;
const BOS: u32 = 1;
const EOS: u32 = 2;
pub const VOCAB_SIZE: usize = 256 + BYTE_OFFSET as usize;

/// One token per byte; ids 0..3 are reserved
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, TokenizerError> {
        Ok(text.bytes().map(|b| b as u32 + BYTE_OFFSET).collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String, TokenizerError> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= BYTE_OFFSET)
            .map(|&id| (id - BYTE_OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn bos_token_id(&self) -> Option<u32> {
        Some(BOS)
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

#[derive(Debug, Default)]
pub struct RuntimeCounters {
    pub prefills: AtomicUsize,
    pub decodes: AtomicUsize,
}

/// Runtime whose logits spell out a fixed script, then EOS
pub struct ScriptedRuntime {
    script: Vec<u32>,
    next: usize,
    step_delay: Duration,
    fail_at_decode: Option<usize>,
    panic_at_decode: Option<usize>,
    counters: Arc<RuntimeCounters>,
}

impl ScriptedRuntime {
    pub fn from_text(script: &str) -> Self {
        Self {
            script: script.bytes().map(|b| b as u32 + BYTE_OFFSET).collect(),
            next: 0,
            step_delay: Duration::ZERO,
            fail_at_decode: None,
            panic_at_decode: None,
            counters: Arc::new(RuntimeCounters::default()),
        }
    }

    fn logits_for_next(&mut self) -> Vec<f32> {
        let target = self.script.get(self.next).copied().unwrap_or(EOS);
        self.next += 1;
        let mut logits = vec![0.0; VOCAB_SIZE];
        logits[target as usize] = 10.0;
        logits
    }
}

#[async_trait]
impl ModelRuntime for ScriptedRuntime {
    async fn prefill(&mut self, _tokens: &[u32]) -> Result<Vec<f32>, RuntimeError> {
        self.counters.prefills.fetch_add(1, Ordering::SeqCst);
        if !self.step_delay.is_zero() {
            sleep(self.step_delay).await;
        }
        self.next = 0;
        Ok(self.logits_for_next())
    }

    async fn decode(&mut self, _token: u32, _seq_len: usize) -> Result<Vec<f32>, RuntimeError> {
        let call = self.counters.decodes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at_decode == Some(call) {
            return Err(RuntimeError::Compute("device lost".to_string()));
        }
        if self.panic_at_decode == Some(call) {
            panic!("decode kernel aborted");
        }
        if !self.step_delay.is_zero() {
            sleep(self.step_delay).await;
        }
        Ok(self.logits_for_next())
    }

    fn clear_kv_cache(&mut self) {}

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }
}

/// Backend handing out scripted runtimes and counting creations
#[derive(Clone)]
pub struct MockBackend {
    script: String,
    step_delay: Duration,
    instantiate_delay: Duration,
    fail_at_decode: Option<usize>,
    panic_at_decode: Option<usize>,
    device: Option<DeviceInfo>,
    pub creations: Arc<AtomicUsize>,
    pub counters: Arc<RuntimeCounters>,
}

impl MockBackend {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
            step_delay: Duration::ZERO,
            instantiate_delay: Duration::ZERO,
            fail_at_decode: None,
            panic_at_decode: None,
            device: Some(DeviceInfo::new("mock gpu")),
            creations: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(RuntimeCounters::default()),
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn with_instantiate_delay(mut self, delay: Duration) -> Self {
        self.instantiate_delay = delay;
        self
    }

    pub fn failing_at_decode(mut self, call: usize) -> Self {
        self.fail_at_decode = Some(call);
        self
    }

    pub fn panicking_at_decode(mut self, call: usize) -> Self {
        self.panic_at_decode = Some(call);
        self
    }

    pub fn with_f16(mut self) -> Self {
        self.device = Some(DeviceInfo::new("mock gpu").with_feature(DeviceFeature::ShaderF16));
        self
    }

    pub fn without_device(mut self) -> Self {
        self.device = None;
        self
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn prefills(&self) -> usize {
        self.counters.prefills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeBackend for MockBackend {
    async fn probe_device(&self) -> Result<DeviceInfo, RuntimeError> {
        self.device
            .clone()
            .ok_or_else(|| RuntimeError::UnsupportedDevice("no adapter found".to_string()))
    }

    async fn instantiate(
        &self,
        _model: &ModelConfig,
        artifacts: &ArtifactSet,
        _device: &DeviceInfo,
    ) -> Result<LoadedRuntime, RuntimeError> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        if artifacts.first_of(ArtifactKind::Tokenizer).is_none() {
            return Err(RuntimeError::Instantiate("missing tokenizer".to_string()));
        }
        if !self.instantiate_delay.is_zero() {
            sleep(self.instantiate_delay).await;
        }

        let mut runtime = ScriptedRuntime::from_text(&self.script);
        runtime.step_delay = self.step_delay;
        runtime.fail_at_decode = self.fail_at_decode;
        runtime.panic_at_decode = self.panic_at_decode;
        runtime.counters = self.counters.clone();

        Ok(LoadedRuntime {
            runtime: Box::new(runtime),
            tokenizer: Arc::new(ByteTokenizer),
        })
    }
}

/// In-memory artifact source with failure injection
#[derive(Default)]
pub struct MemoryFetcher {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, u32>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Duration,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_model(model: &ModelConfig) -> Self {
        let fetcher = Self::new();
        for artifact in model.artifacts() {
            fetcher.insert(&artifact.key, artifact.key.as_bytes().to_vec());
        }
        fetcher
    }

    pub fn for_catalog(catalog: &ModelCatalog) -> Self {
        let fetcher = Self::new();
        for model in catalog.models() {
            for artifact in model.artifacts() {
                fetcher.insert(&artifact.key, artifact.key.as_bytes().to_vec());
            }
        }
        fetcher
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn insert(&self, url: &str, bytes: Vec<u8>) {
        self.artifacts.lock().unwrap().insert(url.to_string(), bytes);
    }

    /// Fail the next `count` fetches of `url`
    pub fn fail_next(&self, url: &str, count: u32) {
        self.failures.lock().unwrap().insert(url.to_string(), count);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ArtifactFetcher for MemoryFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_insert(0) += 1;
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Transport {
                        url: url.to_string(),
                        message: "connection reset".to_string(),
                    });
                }
            }
        }

        self.artifacts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

pub fn test_model(id: &str) -> ModelConfig {
    ModelConfig {
        id: id.to_string(),
        label: id.to_string(),
        description: String::new(),
        model_cache_url: format!("mem://{}", id),
        runtime_url: format!("mem://{}/runtime.wasm", id),
        tokenizer_url: None,
        shard_count: 1,
        template: "vicuna_v1.1".to_string(),
        window: WindowConfig::default(),
        dtype: DType::Float32,
        cache_namespace: id.to_string(),
        required_features: Vec::new(),
        size_gb: 0.0,
        vram_gb: 0.0,
    }
}

/// `test-model`, `other-model` and the f16-only `half-model`
pub fn test_catalog() -> ModelCatalog {
    let mut catalog = ModelCatalog::new();
    catalog.insert(test_model("test-model"));
    catalog.insert(test_model("other-model"));

    let mut half = test_model("half-model");
    half.dtype = DType::Float16;
    half.required_features = vec![DeviceFeature::ShaderF16];
    catalog.insert(half);
    catalog
}

pub fn test_host_config() -> HostConfig {
    HostConfig {
        cache_path: None,
        ready_timeout: Duration::from_secs(1),
        load_stall_timeout: Duration::from_secs(2),
        cache_read_timeout: Duration::from_secs(1),
        fetch_attempts: 3,
        fetch_retry_delay: Duration::from_millis(1),
        crash_reload_cooldown: Duration::from_millis(50),
        channel_capacity: 64,
    }
}
