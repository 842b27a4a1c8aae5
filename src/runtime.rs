use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::catalog::{DeviceFeature, ModelConfig};
use crate::fetch::ArtifactSet;
use crate::protocol::ErrorKind;
use crate::tokenizer::Tokenizer;

/// Failures of the device or the model runtime
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("No usable execution device: {0}")]
    UnsupportedDevice(String),

    #[error("Model {model} requires the {feature} device feature")]
    MissingExtension { model: String, feature: DeviceFeature },

    #[error("Failed to instantiate runtime: {0}")]
    Instantiate(String),

    #[error("Runtime compute failure: {0}")]
    Compute(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::UnsupportedDevice(_) => ErrorKind::UnsupportedDevice,
            RuntimeError::MissingExtension { .. } => ErrorKind::MissingExtension,
            RuntimeError::Instantiate(_) => ErrorKind::MalformedConfig,
            RuntimeError::Compute(_) => ErrorKind::RuntimeCrash,
        }
    }
}

/// Capabilities of the execution device
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub description: String,
    pub features: HashSet<DeviceFeature>,
}

impl DeviceInfo {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            features: HashSet::new(),
        }
    }

    pub fn with_feature(mut self, feature: DeviceFeature) -> Self {
        self.features.insert(feature);
        self
    }

    /// Fail when the device lacks a feature the model depends on
    pub fn check(&self, model: &ModelConfig) -> Result<(), RuntimeError> {
        match model
            .required_features
            .iter()
            .find(|feature| !self.features.contains(feature))
        {
            Some(feature) => Err(RuntimeError::MissingExtension {
                model: model.id.clone(),
                feature: *feature,
            }),
            None => Ok(()),
        }
    }
}

/// Opaque executor of a loaded model.
///
/// `prefill` and `decode` return logits over the full vocabulary for the
/// next position.
#[async_trait]
pub trait ModelRuntime: Send {
    /// Encode a whole prefix, filling the KV cache
    async fn prefill(&mut self, tokens: &[u32]) -> Result<Vec<f32>, RuntimeError>;

    /// One step conditioned on the KV cache; `seq_len` counts the new token
    async fn decode(&mut self, token: u32, seq_len: usize) -> Result<Vec<f32>, RuntimeError>;

    fn clear_kv_cache(&mut self);

    fn vocab_size(&self) -> usize;
}

/// A runtime together with the tokenizer that came with its artifacts
pub struct LoadedRuntime {
    pub runtime: Box<dyn ModelRuntime>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

/// Builds model runtimes on a device; implemented by embedders
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    async fn probe_device(&self) -> Result<DeviceInfo, RuntimeError>;

    async fn instantiate(
        &self,
        model: &ModelConfig,
        artifacts: &ArtifactSet,
        device: &DeviceInfo,
    ) -> Result<LoadedRuntime, RuntimeError>;
}
