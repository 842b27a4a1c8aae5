use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors raised while loading a model catalog
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Model {id} is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

/// Context window limits of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub max_window_length: usize,
    pub mean_gen_length: usize,
    pub max_gen_length: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_window_length: 2048,
            mean_gen_length: 128,
            max_gen_length: 1024,
        }
    }
}

/// Numeric format of the model weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Float16,
}

/// Optional device capability a model may depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceFeature {
    ShaderF16,
}

impl std::fmt::Display for DeviceFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceFeature::ShaderF16 => write!(f, "shader-f16"),
        }
    }
}

/// Role of a downloaded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    RuntimeModule,
    Tokenizer,
    WeightIndex,
    WeightShard,
}

/// One artifact of a model; `key` is its source URL and cache key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub kind: ArtifactKind,
}

/// Static description of a loadable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Base URL of the weight shards and tokenizer
    pub model_cache_url: String,
    /// Compiled runtime module
    pub runtime_url: String,
    #[serde(default)]
    pub tokenizer_url: Option<String>,
    pub shard_count: usize,
    pub template: String,
    #[serde(default)]
    pub window: WindowConfig,
    pub dtype: DType,
    /// Namespace prefix of this model's entries in the tensor cache
    #[serde(default)]
    pub cache_namespace: String,
    #[serde(default)]
    pub required_features: Vec<DeviceFeature>,
    /// Download size in GB
    #[serde(default)]
    pub size_gb: f32,
    /// Estimated GPU memory in GB
    #[serde(default)]
    pub vram_gb: f32,
}

impl ModelConfig {
    pub fn tokenizer_url(&self) -> String {
        self.tokenizer_url
            .clone()
            .unwrap_or_else(|| join_url(&self.model_cache_url, "tokenizer.json"))
    }

    /// Every artifact needed to instantiate the model, in load order
    pub fn artifacts(&self) -> Vec<ArtifactRef> {
        let mut artifacts = vec![
            ArtifactRef {
                key: self.runtime_url.clone(),
                kind: ArtifactKind::RuntimeModule,
            },
            ArtifactRef {
                key: self.tokenizer_url(),
                kind: ArtifactKind::Tokenizer,
            },
            ArtifactRef {
                key: join_url(&self.model_cache_url, "ndarray-cache.json"),
                kind: ArtifactKind::WeightIndex,
            },
        ];
        artifacts.extend((0..self.shard_count).map(|i| ArtifactRef {
            key: join_url(&self.model_cache_url, &format!("params_shard_{}.bin", i)),
            kind: ArtifactKind::WeightShard,
        }));
        artifacts
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let invalid = |reason: &str| CatalogError::Invalid {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.is_empty() {
            return Err(invalid("empty id"));
        }
        if self.window.mean_gen_length >= self.window.max_window_length {
            return Err(invalid("mean generation length must be below the window length"));
        }
        if self.dtype == DType::Float16 && !self.required_features.contains(&DeviceFeature::ShaderF16) {
            return Err(invalid("float16 weights require the shader-f16 feature"));
        }
        Ok(())
    }
}

fn join_url(base: &str, file: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file)
}

/// Models known to the orchestrator, keyed by id
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: BTreeMap<String, ModelConfig>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for model in builtin_models() {
            catalog.insert(model);
        }
        catalog
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let models: Vec<ModelConfig> = serde_json::from_str(json)?;
        let mut catalog = Self::new();
        for model in models {
            model.validate()?;
            catalog.insert(model);
        }
        Ok(catalog)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|source| CatalogError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let catalog = Self::from_json(&json)?;
        info!("Loaded {} models from {}", catalog.len(), path.as_ref().display());
        Ok(catalog)
    }

    pub fn insert(&mut self, model: ModelConfig) {
        self.models.insert(model.id.clone(), model);
    }

    pub fn get(&self, id: &str) -> Option<&ModelConfig> {
        self.models.get(id)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelConfig> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

fn builtin_models() -> Vec<ModelConfig> {
    const LIBS: &str = "https://raw.githubusercontent.com/mlc-ai/binary-mlc-libs/main";

    let model = |id: &str,
                 label: &str,
                 description: &str,
                 cache_url: &str,
                 lib: &str,
                 shards: usize,
                 template: &str,
                 dtype: DType,
                 size_gb: f32,
                 vram_gb: f32| ModelConfig {
        id: id.to_string(),
        label: label.to_string(),
        description: description.to_string(),
        model_cache_url: cache_url.to_string(),
        runtime_url: format!("{}/{}", LIBS, lib),
        tokenizer_url: None,
        shard_count: shards,
        template: template.to_string(),
        window: WindowConfig::default(),
        dtype,
        cache_namespace: id.to_string(),
        required_features: match dtype {
            DType::Float16 => vec![DeviceFeature::ShaderF16],
            DType::Float32 => Vec::new(),
        },
        size_gb,
        vram_gb,
    };

    vec![
        model(
            "wizard-vicuna-7b",
            "Wizard Vicuna 7B",
            "Uncensored model with balanced system requirements",
            "https://huggingface.co/spaces/idosal/web-llm/resolve/main/wizardlm-vicuna-7b-q4f32_0",
            "wizardlm-vicuna-7b-q4f32_0-webgpu.wasm",
            131,
            "vicuna_v1.1",
            DType::Float32,
            4.0,
            7.9,
        ),
        model(
            "redpajama-chat-3b",
            "RedPajama Chat 3B",
            "Smallest model, for low-end devices",
            "https://huggingface.co/mlc-ai/mlc-chat-RedPajama-INCITE-Chat-3B-v1-q4f32_0/resolve/main",
            "RedPajama-INCITE-Chat-3B-v1-q4f32_0-webgpu.wasm",
            51,
            "redpajama_chat",
            DType::Float32,
            1.7,
            3.9,
        ),
        model(
            "llama-2-13b-chat",
            "Llama 2 13B Chat",
            "Larger model, slower on most devices",
            "https://huggingface.co/mlc-ai/mlc-chat-Llama-2-13b-chat-hf-q4f32_1/resolve/main",
            "Llama-2-13b-chat-hf-q4f32_1-webgpu.wasm",
            163,
            "llama-2",
            DType::Float32,
            6.8,
            9.9,
        ),
        model(
            "stable-platypus2-13b",
            "Stable Platypus2 13B",
            "Strongest model, for higher-end devices",
            "https://huggingface.co/spaces/idosal/web-llm/resolve/main/Stable-Platypus2-13B-q4f16_1",
            "Stable-Platypus2-13B-q4f16_1-webgpu.wasm",
            163,
            "wizardlm",
            DType::Float16,
            6.8,
            9.9,
        ),
    ]
}
