//! Sandbox LLM - sandboxed language-model generation with a persistent tensor cache
//!
//! This crate brings a model runtime up and down inside an isolated sandbox
//! actor and multiplexes it across concurrent callers. It features:
//!
//! - A lifecycle state machine (`Asleep → Waking → Ready → Generating`) with
//!   idle teardown
//! - A single generation slot: one prefill/decode loop at a time, with
//!   streaming deltas and cooperative interruption
//! - Conversation templates and context-window shifting
//! - A sled-backed tensor cache that lets a slow first model fetch be replayed
//!   across restarts
//!
//! The tensor math itself is supplied by an embedder through
//! [`runtime::RuntimeBackend`].
//!
//! # Example
//!
//! ```rust,ignore
//! use sandbox_llm::{
//!     config::AppConfig,
//!     fetch::HttpFetcher,
//!     orchestrator::Orchestrator,
//!     protocol::{ChatMessage, GenerationOptions, RequestPrompt},
//! };
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! async fn run(backend: Arc<dyn sandbox_llm::runtime::RuntimeBackend>) -> sandbox_llm::Result<()> {
//!     let orchestrator = Orchestrator::open(AppConfig::default(), backend, Arc::new(HttpFetcher::new()))?;
//!
//!     let prompt = RequestPrompt::messages(vec![ChatMessage::user("hi")]);
//!     let mut stream = orchestrator.stream(prompt, GenerationOptions::default()).await?;
//!     while let Some(delta) = stream.next().await {
//!         print!("{}", delta?);
//!     }
//!     orchestrator.sleep().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod fetch;
pub mod host;
pub mod lifecycle;
pub mod orchestrator;
pub mod pipeline;
pub mod protocol;
pub mod runtime;
pub mod sampling;
pub mod sandbox;
pub mod tokenizer;
pub mod tracker;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use cache::{CacheBridge, SledTensorCache, TensorCache};
pub use catalog::{ModelCatalog, ModelConfig};
pub use config::{AppConfig, HostConfig, OrchestratorConfig};
pub use host::RuntimeHost;
pub use lifecycle::{Lifecycle, LifecycleState};
pub use orchestrator::{IdleState, Orchestrator, TextStream};
pub use protocol::{
    ChatMessage, ErrorKind, ErrorReport, FinishReason, GenerationOptions, GenerationResult, RequestPrompt,
};

use thiserror::Error;

/// Errors that can occur in the sandbox-llm system
#[derive(Error, Debug)]
pub enum SandboxLlmError {
    #[error("Conversation error: {0}")]
    Conversation(#[from] conversation::ConversationError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] tokenizer::TokenizerError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] runtime::RuntimeError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] fetch::FetchError),

    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] catalog::CatalogError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] lifecycle::LifecycleError),

    #[error("Host error: {0}")]
    Host(#[from] host::HostError),

    /// Failure reported from inside the sandbox
    #[error("Sandbox error: {0}")]
    Sandbox(ErrorReport),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Sandbox is gone")]
    SandboxGone,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandboxLlmError {
    /// Classification used for retry and teardown decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxLlmError::Pipeline(e) => e.kind(),
            SandboxLlmError::Runtime(e) => e.kind(),
            SandboxLlmError::Host(e) => e.kind(),
            SandboxLlmError::Sandbox(report) => report.kind,
            SandboxLlmError::Fetch(_) => ErrorKind::ArtifactFetch,
            SandboxLlmError::Tokenizer(_)
            | SandboxLlmError::Lifecycle(_)
            | SandboxLlmError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SandboxLlmError::SandboxGone => ErrorKind::RuntimeCrash,
            SandboxLlmError::Conversation(_)
            | SandboxLlmError::Cache(_)
            | SandboxLlmError::Catalog(_)
            | SandboxLlmError::Io(_)
            | SandboxLlmError::Json(_) => ErrorKind::MalformedConfig,
        }
    }
}

/// Result type alias for sandbox-llm operations
pub type Result<T> = std::result::Result<T, SandboxLlmError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
