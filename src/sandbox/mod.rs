use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::CacheBridge;
use crate::catalog::ModelConfig;
use crate::config::HostConfig;
use crate::fetch::{ArtifactFetcher, ArtifactLoader};
use crate::pipeline::{DeltaEmitter, GenerationPipeline, InterruptFlag};
use crate::protocol::{
    ErrorKind, ErrorReport, GenerationOptions, GenerationResult, HostMessage, RequestPrompt, SandboxEvent,
};
use crate::runtime::RuntimeBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobMode {
    OneShot,
    Stream,
}

struct Job {
    mode: JobMode,
    request_id: Uuid,
    prompt: RequestPrompt,
    options: GenerationOptions,
}

/// Host-side handle of a running sandbox.
///
/// Dropping the handle stops the sandbox tasks.
pub struct SandboxHandle {
    id: String,
    model_id: String,
    commands: mpsc::Sender<HostMessage>,
    dispatcher: AbortHandle,
    executor: AbortHandle,
}

impl SandboxHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Inbound channel of the sandbox
    pub fn commands(&self) -> mpsc::Sender<HostMessage> {
        self.commands.clone()
    }

    pub async fn send(&self, message: HostMessage) -> bool {
        self.commands.send(message).await.is_ok()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stop both sandbox tasks without waiting for the current step
    pub fn shutdown(&self) {
        if self.commands.try_send(HostMessage::Shutdown).is_err() {
            debug!("Sandbox {} inbound channel already closed", self.id);
        }
        self.executor.abort();
        self.dispatcher.abort();
        info!("Sandbox {} for {} shut down", self.id, self.model_id);
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.executor.abort();
        self.dispatcher.abort();
    }
}

/// Start a sandbox for `model`; events come out of the returned receiver
pub fn spawn_sandbox(
    model: ModelConfig,
    backend: Arc<dyn RuntimeBackend>,
    fetcher: Arc<dyn ArtifactFetcher>,
    config: &HostConfig,
) -> (SandboxHandle, mpsc::Receiver<SandboxEvent>) {
    let capacity = config.channel_capacity.max(1);
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::channel(capacity);
    let (job_tx, job_rx) = mpsc::channel(capacity);

    let id = Uuid::new_v4().to_string();
    let interrupt = InterruptFlag::new();
    let bridge = CacheBridge::new(event_tx.clone(), config.cache_read_timeout);

    let dispatcher = tokio::spawn(dispatch(
        command_rx,
        job_tx,
        interrupt.clone(),
        bridge.clone(),
        event_tx.clone(),
    ));

    let executor = Executor {
        model: model.clone(),
        backend,
        fetcher,
        bridge,
        events: event_tx.clone(),
        interrupt,
        fetch_attempts: config.fetch_attempts,
        fetch_retry_delay: config.fetch_retry_delay,
    };
    let executor = tokio::spawn(executor.run(job_rx));
    let executor_abort = executor.abort_handle();
    supervise(executor, event_tx, id.clone());

    info!("Spawned sandbox {} for {}", id, model.id);

    let handle = SandboxHandle {
        id,
        model_id: model.id,
        commands: command_tx,
        dispatcher: dispatcher.abort_handle(),
        executor: executor_abort,
    };
    (handle, event_rx)
}

/// Report an executor panic as a runtime crash
fn supervise(executor: JoinHandle<()>, events: mpsc::Sender<SandboxEvent>, id: String) {
    tokio::spawn(async move {
        if let Err(e) = executor.await {
            if e.is_panic() {
                let payload = e.into_panic();
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!("Sandbox {} executor panicked: {}", id, detail);
                let report =
                    ErrorReport::new(ErrorKind::RuntimeCrash, "sandbox executor panicked").with_stack(detail);
                let _ = events
                    .send(SandboxEvent::Error {
                        request_id: None,
                        report,
                    })
                    .await;
            }
        }
    });
}

/// Single demultiplexer of the inbound channel
async fn dispatch(
    mut inbound: mpsc::Receiver<HostMessage>,
    jobs: mpsc::Sender<Job>,
    interrupt: InterruptFlag,
    bridge: CacheBridge,
    events: mpsc::Sender<SandboxEvent>,
) {
    while let Some(message) = inbound.recv().await {
        let job = match message {
            HostMessage::Generate {
                request_id,
                prompt,
                options,
            } => Job {
                mode: JobMode::OneShot,
                request_id,
                prompt,
                options,
            },
            HostMessage::Stream {
                request_id,
                prompt,
                options,
            } => Job {
                mode: JobMode::Stream,
                request_id,
                prompt,
                options,
            },
            HostMessage::Interrupt => {
                debug!("Interrupt requested");
                interrupt.raise();
                continue;
            }
            HostMessage::CacheValue { correlation, value } => {
                bridge.complete_value(correlation, value).await;
                continue;
            }
            HostMessage::CacheAck { correlation, ok } => {
                bridge.complete_ack(correlation, ok).await;
                continue;
            }
            HostMessage::Shutdown => {
                debug!("Sandbox dispatcher shutting down");
                break;
            }
        };

        // Cleared here so an interrupt sent right after this request still lands
        interrupt.clear();
        let request_id = job.request_id;
        if jobs.send(job).await.is_err() {
            warn!("Sandbox executor is gone, rejecting request {}", request_id);
            let report = ErrorReport::new(ErrorKind::RuntimeCrash, "sandbox runtime is not running");
            let _ = events
                .send(SandboxEvent::Error {
                    request_id: Some(request_id),
                    report,
                })
                .await;
        }
    }
}

struct Executor {
    model: ModelConfig,
    backend: Arc<dyn RuntimeBackend>,
    fetcher: Arc<dyn ArtifactFetcher>,
    bridge: CacheBridge,
    events: mpsc::Sender<SandboxEvent>,
    interrupt: InterruptFlag,
    fetch_attempts: u32,
    fetch_retry_delay: std::time::Duration,
}

impl Executor {
    async fn run(self, mut jobs: mpsc::Receiver<Job>) {
        let mut pipeline = match self.boot().await {
            Ok(pipeline) => pipeline,
            Err(report) => {
                error!("Sandbox failed to load {}: {}", self.model.id, report);
                self.emit(SandboxEvent::Error {
                    request_id: None,
                    report,
                })
                .await;
                return;
            }
        };

        while let Some(job) = jobs.recv().await {
            let request_id = job.request_id;
            if let Err(report) = self.serve(&mut pipeline, job).await {
                let fatal = report.kind.is_fatal();
                if fatal {
                    error!("Request {} failed fatally: {}", request_id, report);
                } else {
                    warn!("Request {} failed: {}", request_id, report);
                }
                self.emit(SandboxEvent::Error {
                    request_id: Some(request_id),
                    report,
                })
                .await;
                if fatal {
                    return;
                }
            }
        }
        debug!("Sandbox executor for {} finished", self.model.id);
    }

    async fn boot(&self) -> Result<GenerationPipeline, ErrorReport> {
        let started = Instant::now();
        self.progress(0.0, &started, "Detecting execution device");

        let device = self
            .backend
            .probe_device()
            .await
            .map_err(|e| ErrorReport::new(e.kind(), e.to_string()))?;
        device
            .check(&self.model)
            .map_err(|e| ErrorReport::new(e.kind(), e.to_string()))?;
        debug!("Using device {}", device.description);

        let loader = ArtifactLoader::new(
            self.bridge.clone(),
            self.fetcher.clone(),
            self.fetch_attempts,
            self.fetch_retry_delay,
        );
        let artifacts = loader
            .load(&self.model, |p| {
                let source = if p.from_cache { "cache" } else { "network" };
                let text = format!("Loaded artifact {}/{} from {}", p.done, p.total, source);
                self.progress(p.fraction, &started, &text);
            })
            .await
            .map_err(|e| ErrorReport::new(ErrorKind::ArtifactFetch, e.to_string()))?;

        let loaded = self
            .backend
            .instantiate(&self.model, &artifacts, &device)
            .await
            .map_err(|e| ErrorReport::new(e.kind(), e.to_string()))?;
        let pipeline = GenerationPipeline::new(loaded.runtime, loaded.tokenizer, &self.model)
            .map_err(|e| ErrorReport::new(e.kind(), e.to_string()))?;

        self.progress(1.0, &started, "Model ready");
        self.emit(SandboxEvent::Ready {
            model_id: self.model.id.clone(),
        })
        .await;
        info!(
            "Sandbox ready with {} after {}ms",
            self.model.id,
            started.elapsed().as_millis()
        );
        Ok(pipeline)
    }

    async fn serve(&self, pipeline: &mut GenerationPipeline, job: Job) -> Result<(), ErrorReport> {
        let Job {
            mode,
            request_id,
            prompt,
            options,
        } = job;
        let report = |e: crate::pipeline::PipelineError| {
            let report = ErrorReport::new(e.kind(), e.to_string());
            if e.kind().is_fatal() {
                report.with_stack(format!("{:?}", e))
            } else {
                report
            }
        };

        let outcome = match mode {
            JobMode::OneShot => pipeline
                .generate(&prompt, &options, &self.interrupt, |_| {})
                .await
                .map_err(report)?,
            JobMode::Stream => {
                let mut emitter = DeltaEmitter::new(pipeline.markers_for(&options));
                let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
                let events = self.events.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(delta) = delta_rx.recv().await {
                        if events
                            .send(SandboxEvent::StreamChunk { request_id, delta })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });

                let result = pipeline
                    .generate(&prompt, &options, &self.interrupt, |step| {
                        if let Some(delta) = emitter.push(&step.text) {
                            let _ = delta_tx.send(delta);
                        }
                    })
                    .await;
                if let Ok(outcome) = &result {
                    if let Some(delta) = emitter.finish(&outcome.text) {
                        let _ = delta_tx.send(delta);
                    }
                }
                drop(delta_tx);
                if forwarder.await.is_err() {
                    warn!("Stream forwarder for {} stopped early", request_id);
                }
                result.map_err(report)?
            }
        };

        let result = GenerationResult {
            request_id,
            model_id: self.model.id.clone(),
            text: outcome.text,
            finish_reason: outcome.finish_reason,
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.completion_tokens,
            cached: false,
        };
        let event = match mode {
            JobMode::OneShot => SandboxEvent::Completion { result },
            JobMode::Stream => SandboxEvent::End { result },
        };
        self.emit(event).await;
        Ok(())
    }

    /// Progress is advisory and dropped when the host lags behind
    fn progress(&self, fraction: f32, started: &Instant, text: &str) {
        debug!("Load progress {:.0}%: {}", fraction * 100.0, text);
        let event = SandboxEvent::Progress {
            fraction,
            elapsed_ms: started.elapsed().as_millis() as u64,
            text: text.to_string(),
        };
        if self.events.try_send(event).is_err() {
            debug!("Dropped progress update");
        }
    }

    async fn emit(&self, event: SandboxEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Sandbox event channel closed");
        }
    }
}
