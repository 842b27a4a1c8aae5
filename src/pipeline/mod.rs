use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::{ModelConfig, WindowConfig};
use crate::conversation::{Conversation, ConversationError, TemplateConfig};
use crate::protocol::{ErrorKind, FinishReason, GenerationOptions, RequestPrompt};
use crate::runtime::{ModelRuntime, RuntimeError};
use crate::sampling::{Sampler, SamplingParams};
use crate::tokenizer::{Tokenizer, TokenizerError};

pub mod stream;

pub use stream::DeltaEmitter;

/// Share of the window kept as context after a window shift
pub const SHIFT_FILL_FACTOR: f64 = 0.1;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Conversation error: {0}")]
    Conversation(#[from] ConversationError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Prompt needs {required} tokens plus generation room but the window holds {max_window}")]
    WindowTooSmall { required: usize, max_window: usize },

    #[error("Invalid window configuration: {0}")]
    InvalidWindow(String),

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("No active generation session")]
    NotActive,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Conversation(_) | PipelineError::InvalidWindow(_) => ErrorKind::MalformedConfig,
            PipelineError::Tokenizer(_) | PipelineError::EmptyPrompt | PipelineError::NotActive => {
                ErrorKind::InvalidRequest
            }
            PipelineError::Runtime(e) => e.kind(),
            PipelineError::WindowTooSmall { .. } => ErrorKind::WindowTooSmall,
        }
    }
}

/// Cooperative cancellation flag observed once per decode step
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Mutable state of one generation
#[derive(Debug, Default)]
struct SessionState {
    kv_cache_length: usize,
    window_budget: usize,
    appeared_tokens: HashSet<u32>,
    stopped: bool,
    active: bool,
    prompt_tokens: usize,
    output_tokens: Vec<u32>,
    pending_logits: Option<Vec<f32>>,
    message: String,
    finish_reason: Option<FinishReason>,
}

/// Output of one decode step
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeStep {
    pub token: u32,
    /// Full decoded output so far, truncated at any stop marker
    pub text: String,
    pub finish: Option<FinishReason>,
}

impl DecodeStep {
    pub fn is_stop(&self) -> bool {
        self.finish.is_some()
    }
}

/// Final outcome of `GenerationPipeline::generate`
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    pub finish_reason: FinishReason,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// Encoding and decoding counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub prefill_tokens: usize,
    pub prefill_time: Duration,
    pub decode_tokens: usize,
    pub decode_time: Duration,
}

impl PipelineStats {
    pub fn prefill_tokens_per_sec(&self) -> f64 {
        rate(self.prefill_tokens, self.prefill_time)
    }

    pub fn decode_tokens_per_sec(&self) -> f64 {
        rate(self.decode_tokens, self.decode_time)
    }
}

fn rate(tokens: usize, time: Duration) -> f64 {
    let secs = time.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

impl std::fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "prefill: {:.1} tok/s ({} tokens), decode: {:.1} tok/s ({} tokens)",
            self.prefill_tokens_per_sec(),
            self.prefill_tokens,
            self.decode_tokens_per_sec(),
            self.decode_tokens
        )
    }
}

/// Prefill and decode loop over a model runtime.
///
/// The pipeline is the only writer of its session state; one generation
/// runs at a time.
pub struct GenerationPipeline {
    runtime: Box<dyn ModelRuntime>,
    tokenizer: Arc<dyn Tokenizer>,
    template: TemplateConfig,
    window: WindowConfig,
    session: SessionState,
    sampler: Sampler,
    params: SamplingParams,
    stop_markers: Vec<String>,
    stats: PipelineStats,
}

impl GenerationPipeline {
    pub fn new(
        runtime: Box<dyn ModelRuntime>,
        tokenizer: Arc<dyn Tokenizer>,
        model: &ModelConfig,
    ) -> Result<Self, PipelineError> {
        let template = TemplateConfig::named(&model.template)?;
        Self::with_template(runtime, tokenizer, template, model.window)
    }

    pub fn with_template(
        runtime: Box<dyn ModelRuntime>,
        tokenizer: Arc<dyn Tokenizer>,
        template: TemplateConfig,
        window: WindowConfig,
    ) -> Result<Self, PipelineError> {
        template.stop_str()?;
        if window.mean_gen_length >= window.max_window_length {
            return Err(PipelineError::InvalidWindow(format!(
                "mean generation length {} must be below the window length {}",
                window.mean_gen_length, window.max_window_length
            )));
        }

        Ok(Self {
            runtime,
            tokenizer,
            template,
            window,
            session: SessionState::default(),
            sampler: Sampler::new(GenerationOptions::default().seed),
            params: SamplingParams::default(),
            stop_markers: Vec::new(),
            stats: PipelineStats::default(),
        })
    }

    pub fn template(&self) -> &TemplateConfig {
        &self.template
    }

    pub fn window(&self) -> &WindowConfig {
        &self.window
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn kv_cache_length(&self) -> usize {
        self.session.kv_cache_length
    }

    pub fn eos_token_id(&self) -> u32 {
        self.tokenizer.eos_token_id()
    }

    /// Stop markers of the current session: template stop string first
    pub fn stop_markers(&self) -> &[String] {
        &self.stop_markers
    }

    /// Markers a stream consumer must never see for these options
    pub fn markers_for(&self, options: &GenerationOptions) -> Vec<String> {
        let mut markers = Vec::with_capacity(options.stop_sequences.len() + 1);
        if let Ok(stop) = self.template.stop_str() {
            markers.push(stop.to_string());
        }
        markers.extend(
            options
                .stop_sequences
                .iter()
                .filter(|s| !s.is_empty())
                .cloned(),
        );
        markers
    }

    /// Token sequence for a prompt, shifting the window when history is too long.
    ///
    /// Pure: the session is left untouched.
    pub fn build_input_tokens(&self, prompt: &RequestPrompt) -> Result<Vec<u32>, PipelineError> {
        if prompt.is_empty() {
            return Err(PipelineError::EmptyPrompt);
        }
        let conversation = Conversation::from_prompt(self.template.clone(), prompt)?;
        let prompts = conversation.prompt_array()?;
        let max_window = self.window.max_window_length;
        let mean_gen = self.window.mean_gen_length;

        let mut tokens = self.preamble_tokens(&prompts[0])?;
        let mut encoded = Vec::with_capacity(prompts.len());
        for piece in &prompts[1..] {
            encoded.push(self.tokenizer.encode(piece)?);
        }

        // Every prefill starts from a cleared KV cache
        let mut ctx_length = tokens.len();
        let mut need_shift = false;
        for turn in encoded.iter().rev() {
            ctx_length += turn.len();
            if ctx_length + mean_gen >= max_window {
                need_shift = true;
                break;
            }
        }

        if !need_shift {
            for turn in &encoded {
                tokens.extend_from_slice(turn);
            }
            return Ok(tokens);
        }

        let fill = SHIFT_FILL_FACTOR * max_window as f64;
        let mut ctx_length = tokens.len();
        let mut context = VecDeque::new();
        for i in (1..prompts.len()).rev() {
            let turn = &encoded[i - 1];
            ctx_length += turn.len();
            if ctx_length as f64 >= fill && i + 2 < prompts.len() {
                break;
            }
            context.push_front(turn);
        }
        let kept = context.len();
        for turn in context {
            tokens.extend_from_slice(turn);
        }

        info!(
            "Shifted context window: kept {} of {} turns, {} tokens",
            kept,
            encoded.len(),
            tokens.len()
        );

        if tokens.len() + mean_gen >= max_window {
            return Err(PipelineError::WindowTooSmall {
                required: tokens.len() + mean_gen,
                max_window,
            });
        }
        Ok(tokens)
    }

    fn preamble_tokens(&self, system: &str) -> Result<Vec<u32>, PipelineError> {
        let mut tokens = Vec::new();
        if self.template.add_bos {
            if let Some(bos) = self.tokenizer.bos_token_id() {
                tokens.push(bos);
            }
        }
        tokens.extend(self.tokenizer.encode(system)?);
        Ok(tokens)
    }

    /// Encode the prompt into a fresh KV cache and arm the session
    pub async fn prefill(&mut self, tokens: &[u32], options: &GenerationOptions) -> Result<(), PipelineError> {
        let max_window = self.window.max_window_length;
        if tokens.is_empty() {
            return Err(PipelineError::EmptyPrompt);
        }
        if tokens.len() >= max_window {
            return Err(PipelineError::WindowTooSmall {
                required: tokens.len(),
                max_window,
            });
        }

        self.runtime.clear_kv_cache();
        self.session = SessionState::default();

        let started = Instant::now();
        let logits = self.runtime.prefill(tokens).await?;
        self.stats.prefill_tokens += tokens.len();
        self.stats.prefill_time += started.elapsed();

        self.sampler = Sampler::new(options.seed);
        self.params = SamplingParams {
            temperature: options.temperature,
            top_p: options.top_p,
            repetition_penalty: options.repetition_penalty,
        };
        self.stop_markers = self.markers_for(options);

        self.session.kv_cache_length = tokens.len();
        self.session.prompt_tokens = tokens.len();
        self.session.window_budget = (max_window - tokens.len())
            .min(self.window.max_gen_length)
            .min(options.max_tokens);
        self.session.pending_logits = Some(logits);
        self.session.active = true;

        debug!(
            "Prefilled {} tokens, budget {} tokens",
            tokens.len(),
            self.session.window_budget
        );
        Ok(())
    }

    /// Produce one token; the first step samples from the prefill logits
    pub async fn decode_step(&mut self) -> Result<DecodeStep, PipelineError> {
        if !self.session.active || self.session.stopped {
            return Err(PipelineError::NotActive);
        }
        // Only reachable with a zero budget; otherwise the previous step stopped
        if self.session.output_tokens.len() >= self.session.window_budget {
            return Ok(self.finish_without_token(FinishReason::MaxTokens));
        }

        let started = Instant::now();
        let logits = match self.session.pending_logits.take() {
            Some(logits) => logits,
            None => {
                let last = match self.session.output_tokens.last() {
                    Some(token) => *token,
                    None => return Err(PipelineError::NotActive),
                };
                if self.session.kv_cache_length + 1 > self.window.max_window_length {
                    return Ok(self.finish_without_token(FinishReason::WindowExhausted));
                }
                self.session.kv_cache_length += 1;
                let logits = self
                    .runtime
                    .decode(last, self.session.kv_cache_length)
                    .await?;
                self.stats.decode_tokens += 1;
                self.stats.decode_time += started.elapsed();
                logits
            }
        };

        let vocab_size = self.runtime.vocab_size();
        if logits.len() != vocab_size {
            return Err(PipelineError::Runtime(RuntimeError::Compute(format!(
                "runtime returned {} logits for a vocabulary of {}",
                logits.len(),
                vocab_size
            ))));
        }

        let token = self
            .sampler
            .sample(&logits, &self.params, &self.session.appeared_tokens);
        self.session.output_tokens.push(token);
        self.session.appeared_tokens.insert(token);

        let mut finish = None;
        let text = if token == self.tokenizer.eos_token_id() {
            finish = Some(FinishReason::EndOfSequence);
            let produced = self.session.output_tokens.len() - 1;
            self.tokenizer.decode(&self.session.output_tokens[..produced])?
        } else {
            let mut text = self.tokenizer.decode(&self.session.output_tokens)?;
            if let Some(pos) = earliest_marker(&text, &self.stop_markers) {
                text.truncate(pos);
                finish = Some(FinishReason::StopSequence);
            }
            text
        };

        let generated = self.session.output_tokens.len();
        if finish.is_none() && generated >= self.session.window_budget {
            let room = self.window.max_window_length - self.session.prompt_tokens;
            finish = Some(if generated >= room {
                FinishReason::WindowExhausted
            } else {
                FinishReason::MaxTokens
            });
        }

        self.session.message = text.clone();
        if let Some(reason) = finish {
            self.session.stopped = true;
            self.session.finish_reason = Some(reason);
        }

        Ok(DecodeStep { token, text, finish })
    }

    fn finish_without_token(&mut self, reason: FinishReason) -> DecodeStep {
        self.session.stopped = true;
        self.session.finish_reason = Some(reason);
        DecodeStep {
            token: self.tokenizer.eos_token_id(),
            text: self.session.message.clone(),
            finish: Some(reason),
        }
    }

    /// Output of the current session so far
    pub fn message(&self) -> &str {
        &self.session.message
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.session.finish_reason
    }

    pub fn is_stopped(&self) -> bool {
        self.session.stopped
    }

    /// Stop the session; the message keeps what was produced so far
    pub fn trigger_stop(&mut self) {
        self.session.stopped = true;
        if self.session.finish_reason.is_none() {
            self.session.finish_reason = Some(FinishReason::Interrupted);
        }
    }

    /// Drop the session and the KV cache
    pub fn reset(&mut self) {
        self.runtime.clear_kv_cache();
        self.session = SessionState::default();
        self.stats = PipelineStats::default();
    }

    /// Run one full generation.
    ///
    /// `interrupt` is checked once at the top of every iteration; `on_step`
    /// sees every decode step, including the final one.
    pub async fn generate<F>(
        &mut self,
        prompt: &RequestPrompt,
        options: &GenerationOptions,
        interrupt: &InterruptFlag,
        mut on_step: F,
    ) -> Result<GenerationOutcome, PipelineError>
    where
        F: FnMut(&DecodeStep) + Send,
    {
        let tokens = self.build_input_tokens(prompt)?;
        self.reset();
        self.prefill(&tokens, options).await?;

        let finish_reason = loop {
            if interrupt.is_raised() {
                self.trigger_stop();
                break FinishReason::Interrupted;
            }
            let step = self.decode_step().await?;
            on_step(&step);
            if let Some(reason) = step.finish {
                break reason;
            }
        };

        let outcome = GenerationOutcome {
            text: self.session.message.clone(),
            finish_reason,
            prompt_tokens: self.session.prompt_tokens,
            completion_tokens: self.session.output_tokens.len(),
        };
        info!(
            "Generation finished ({:?}): {} prompt tokens, {} completion tokens, {}",
            finish_reason, outcome.prompt_tokens, outcome.completion_tokens, self.stats
        );
        Ok(outcome)
    }
}

/// Byte offset of the earliest marker occurrence
fn earliest_marker(text: &str, markers: &[String]) -> Option<usize> {
    markers
        .iter()
        .filter(|m| !m.is_empty())
        .filter_map(|m| text.find(m.as_str()))
        .min()
}
