use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Speaker of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message supplied by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Prompt supplied with a request: either flat text or a chat history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPrompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl RequestPrompt {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self::Text(prompt.into())
    }

    pub fn messages(messages: Vec<ChatMessage>) -> Self {
        Self::Messages(messages)
    }

    /// True when there is nothing for the model to answer
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Messages(messages) => messages.is_empty(),
        }
    }
}

/// Sampling and stopping parameters for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// Model to run; the orchestrator default is used when absent
    pub model: Option<String>,
    /// Temperature for sampling (0.0 = greedy)
    pub temperature: f32,
    /// Nucleus sampling threshold
    pub top_p: f32,
    /// Upper bound on generated tokens
    pub max_tokens: usize,
    /// Penalty for already generated tokens (1.0 = none)
    pub repetition_penalty: f32,
    /// Extra stop sequences on top of the template stop string
    pub stop_sequences: Vec<String>,
    /// Seed for the sampling source
    pub seed: u64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.0,
            top_p: 0.95,
            max_tokens: 2048,
            repetition_penalty: 1.0,
            stop_sequences: Vec::new(),
            seed: 299_792_458,
        }
    }
}

impl GenerationOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token produced
    EndOfSequence,
    /// Template stop string or a request stop sequence appeared
    StopSequence,
    /// Request token budget used up
    MaxTokens,
    /// No room left in the context window
    WindowExhausted,
    /// Caller interrupted the generation
    Interrupted,
}

/// Classification of a failure crossing a context boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No usable execution device
    UnsupportedDevice,
    /// The device lacks a numeric extension the model needs
    MissingExtension,
    /// Template or model configuration cannot be used
    MalformedConfig,
    /// Artifact fetch failed beyond the retry budget
    ArtifactFetch,
    /// The runtime died or reported a compute failure
    RuntimeCrash,
    /// Loading made no progress within the stall timeout
    LoadStalled,
    /// The prompt cannot fit the context window
    WindowTooSmall,
    /// The request itself is unusable
    InvalidRequest,
}

impl ErrorKind {
    /// Failures that leave the sandbox unusable
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ErrorKind::WindowTooSmall | ErrorKind::InvalidRequest)
    }

    /// Whether retrying later (after a reload) can help
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ArtifactFetch | ErrorKind::RuntimeCrash | ErrorKind::LoadStalled
        )
    }

    /// Whether the host schedules a delayed full reload
    pub fn schedules_reload(&self) -> bool {
        self.is_retryable()
    }
}

/// Serializable failure report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub stack: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Final outcome of one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub request_id: Uuid,
    pub model_id: String,
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    /// Whether the text came from the completion cache
    #[serde(default)]
    pub cached: bool,
}

/// Messages sent from the host into the sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HostMessage {
    /// One-shot completion request
    Generate {
        request_id: Uuid,
        prompt: RequestPrompt,
        options: GenerationOptions,
    },
    /// Incremental completion request
    Stream {
        request_id: Uuid,
        prompt: RequestPrompt,
        options: GenerationOptions,
    },
    /// Cooperative cancellation of the running generation
    Interrupt,
    /// Reply to a `CacheGet`
    CacheValue {
        correlation: u64,
        value: Option<Vec<u8>>,
    },
    /// Reply to a `CachePut`
    CacheAck { correlation: u64, ok: bool },
    /// Stop the sandbox
    Shutdown,
}

/// Events emitted by the sandbox towards the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SandboxEvent {
    /// Load progress in [0, 1]
    Progress {
        fraction: f32,
        elapsed_ms: u64,
        text: String,
    },
    /// The runtime is loaded and accepting requests
    Ready { model_id: String },
    /// Incremental output of a stream request
    StreamChunk { request_id: Uuid, delta: String },
    /// Stream completion marker
    End { result: GenerationResult },
    /// Result of a one-shot request
    Completion { result: GenerationResult },
    /// Failure report, tied to a request when one was running
    Error {
        request_id: Option<Uuid>,
        report: ErrorReport,
    },
    /// Tensor cache read
    CacheGet { correlation: u64, key: String },
    /// Tensor cache write
    CachePut {
        correlation: u64,
        key: String,
        blob: Vec<u8>,
    },
}

impl HostMessage {
    /// Serialize this message to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

impl SandboxEvent {
    /// Serialize this event to MessagePack format
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize from MessagePack format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }

    /// Request this event belongs to, if any
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            SandboxEvent::StreamChunk { request_id, .. } => Some(*request_id),
            SandboxEvent::End { result } | SandboxEvent::Completion { result } => {
                Some(result.request_id)
            }
            SandboxEvent::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}
