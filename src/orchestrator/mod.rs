use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::SledTensorCache;
use crate::catalog::ModelCatalog;
use crate::config::{AppConfig, OrchestratorConfig};
use crate::fetch::ArtifactFetcher;
use crate::host::RuntimeHost;
use crate::lifecycle::{Lifecycle, LifecycleEvent, LifecycleRecord, LifecycleState};
use crate::protocol::{
    ErrorKind, ErrorReport, FinishReason, GenerationOptions, GenerationResult, HostMessage, RequestPrompt,
    SandboxEvent,
};
use crate::runtime::RuntimeBackend;
use crate::tracker::{RequestKind, RequestTracker};
use crate::{Result, SandboxLlmError};

pub mod stream;

pub use stream::TextStream;

/// Reference to a ready runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeHandleRef {
    pub model_id: String,
    /// Sandbox slot epoch; changes whenever the sandbox is recreated
    pub epoch: u64,
}

/// Signal from the host environment about user presence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Active,
    Idle,
    Locked,
}

/// What an idle signal did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    Ignored,
    TornDown,
    /// Teardown waits for the running generation
    Deferred,
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    host: RuntimeHost,
    lifecycle: Lifecycle,
    /// Exactly one generation in flight
    generation: Arc<Mutex<()>>,
    tracker: RequestTracker,
    idle_deferred: AtomicBool,
}

/// Front door for callers: brings the runtime up and down and serializes
/// generations through a single slot.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

fn gone_report() -> ErrorReport {
    ErrorReport::new(ErrorKind::RuntimeCrash, "sandbox went away mid-generation")
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, host: RuntimeHost) -> Self {
        let lifecycle = host.lifecycle().clone();
        Self {
            inner: Arc::new(OrchestratorInner {
                config,
                host,
                lifecycle,
                generation: Arc::new(Mutex::new(())),
                tracker: RequestTracker::new(),
                idle_deferred: AtomicBool::new(false),
            }),
        }
    }

    /// Build the whole stack from a configuration file's contents
    pub fn open(
        config: AppConfig,
        backend: Arc<dyn RuntimeBackend>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self> {
        let catalog = match &config.catalog {
            Some(path) => ModelCatalog::from_file(path)?,
            None => ModelCatalog::builtin(),
        };
        let host = RuntimeHost::open(config.host, catalog, backend, fetcher, Lifecycle::new())?;
        Ok(Self::new(config.orchestrator, host))
    }

    pub fn host(&self) -> &RuntimeHost {
        &self.inner.host
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.inner.tracker
    }

    pub fn status(&self) -> LifecycleRecord {
        self.inner.lifecycle.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleRecord> {
        self.inner.lifecycle.subscribe()
    }

    fn store(&self) -> &SledTensorCache {
        self.inner.host.store()
    }

    /// Make `model_id` the ready model, waiting for any running generation
    pub async fn ensure_model(&self, model_id: &str) -> Result<RuntimeHandleRef> {
        let _slot = self.inner.generation.lock().await;
        let handle = self.ensure_model_locked(model_id).await?;
        self.honor_deferred_idle().await;
        Ok(handle)
    }

    async fn ensure_model_locked(&self, model_id: &str) -> Result<RuntimeHandleRef> {
        let lifecycle = &self.inner.lifecycle;
        let record = lifecycle.snapshot();
        if record.state == LifecycleState::Ready && record.current_model.as_deref() == Some(model_id) {
            if let Some(epoch) = self.inner.host.ready_epoch(model_id).await {
                lifecycle.touch();
                return Ok(RuntimeHandleRef {
                    model_id: model_id.to_string(),
                    epoch,
                });
            }
        }

        lifecycle.transition(LifecycleEvent::Wake(model_id.to_string()))?;
        info!("Waking runtime for {}", model_id);

        match self.inner.host.setup(model_id).await {
            Ok(epoch) => {
                lifecycle.clear_error();
                lifecycle.transition(LifecycleEvent::Woke)?;
                Ok(RuntimeHandleRef {
                    model_id: model_id.to_string(),
                    epoch,
                })
            }
            Err(e) => {
                warn!("Failed to wake runtime for {}: {}", model_id, e);
                lifecycle.record_error(e.report());
                let _ = lifecycle.transition(LifecycleEvent::WakeFailed);
                Err(e.into())
            }
        }
    }

    /// Validate and record a new request
    async fn admit(
        &self,
        prompt: &RequestPrompt,
        options: &GenerationOptions,
        kind: RequestKind,
    ) -> Result<(Uuid, String)> {
        if prompt.is_empty() {
            return Err(SandboxLlmError::InvalidRequest("prompt is empty".to_string()));
        }
        let model_id = options
            .model
            .clone()
            .unwrap_or_else(|| self.inner.config.default_model.clone());
        let request_id = Uuid::new_v4();
        self.inner.tracker.track(request_id, kind, &model_id).await;
        Ok((request_id, model_id))
    }

    /// Wake the model, enter Generating and hand `message` to the host.
    /// Runs under the generation slot.
    async fn start(
        &self,
        request_id: Uuid,
        model_id: &str,
        message: HostMessage,
    ) -> Result<mpsc::UnboundedReceiver<SandboxEvent>> {
        self.inner.tracker.mark_running(request_id).await;

        if let Err(e) = self.ensure_model_locked(model_id).await {
            self.inner.tracker.mark_failed(request_id, e.to_string()).await;
            return Err(e);
        }
        if let Err(e) = self.inner.lifecycle.transition(LifecycleEvent::Begin) {
            self.inner.tracker.mark_failed(request_id, e.to_string()).await;
            return Err(e.into());
        }

        match self.inner.host.submit(request_id, message).await {
            Ok(events) => Ok(events),
            Err(e) => {
                self.finish_generation(request_id, Err(&e.report())).await;
                Err(e.into())
            }
        }
    }

    /// One-shot completion
    pub async fn generate(&self, prompt: RequestPrompt, options: GenerationOptions) -> Result<GenerationResult> {
        let (request_id, model_id) = self.admit(&prompt, &options, RequestKind::Generate).await?;
        let _slot = self.inner.generation.lock().await;

        let cache_key = if self.inner.config.completion_cache {
            SledTensorCache::completion_key(&model_id, &prompt, &options).ok()
        } else {
            None
        };
        if let Some(key) = &cache_key {
            match self.store().get_completion(key) {
                Ok(Some(mut hit)) => {
                    debug!("Serving request {} from the completion cache", request_id);
                    hit.request_id = request_id;
                    hit.cached = true;
                    self.inner.tracker.mark_running(request_id).await;
                    self.inner.tracker.mark_completed(request_id, hit.completion_tokens).await;
                    self.prune_requests().await;
                    self.inner.lifecycle.touch();
                    return Ok(hit);
                }
                Ok(None) => {}
                Err(e) => warn!("Completion cache lookup failed: {}", e),
            }
        }

        let message = HostMessage::Generate {
            request_id,
            prompt,
            options,
        };
        let mut events = self.start(request_id, &model_id, message).await?;

        let outcome = loop {
            match events.recv().await {
                Some(SandboxEvent::Completion { result }) => break Ok(result),
                Some(SandboxEvent::Error { report, .. }) => break Err(report),
                Some(other) => debug!("Ignoring {:?} for one-shot request", other),
                None => break Err(gone_report()),
            }
        };
        self.finish_generation(request_id, outcome.as_ref()).await;

        let result = outcome.map_err(SandboxLlmError::Sandbox)?;
        if let Some(key) = cache_key {
            if result.finish_reason != FinishReason::Interrupted {
                if let Err(e) = self.store().put_completion(&key, &result) {
                    warn!("Failed to store completion: {}", e);
                }
            }
        }
        Ok(result)
    }

    /// Incremental completion.
    ///
    /// Returns once the request holds the generation slot and the sandbox
    /// accepted it. The slot is released after the sandbox's end event.
    pub async fn stream(&self, prompt: RequestPrompt, options: GenerationOptions) -> Result<TextStream> {
        let (request_id, model_id) = self.admit(&prompt, &options, RequestKind::Stream).await?;
        let slot = self.inner.generation.clone().lock_owned().await;

        let message = HostMessage::Stream {
            request_id,
            prompt,
            options,
        };
        let mut events = self.start(request_id, &model_id, message).await?;

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let orchestrator = self.clone();

        tokio::spawn(async move {
            let _slot = slot;
            let mut consumer_gone = false;

            let outcome = loop {
                match events.recv().await {
                    Some(SandboxEvent::StreamChunk { delta, .. }) => {
                        if !consumer_gone && chunk_tx.send(Ok(delta)).is_err() {
                            debug!("Stream {} dropped by its consumer, interrupting", request_id);
                            consumer_gone = true;
                            orchestrator.interrupt().await;
                        }
                    }
                    Some(SandboxEvent::End { result }) => break Ok(result),
                    Some(SandboxEvent::Error { report, .. }) => break Err(report),
                    Some(other) => debug!("Ignoring {:?} for stream request", other),
                    None => break Err(gone_report()),
                }
            };

            if let Err(report) = &outcome {
                let _ = chunk_tx.send(Err(SandboxLlmError::Sandbox(report.clone())));
            }
            orchestrator.finish_generation(request_id, outcome.as_ref()).await;
            drop(chunk_tx);
            let _ = result_tx.send(outcome);
        });

        Ok(TextStream::new(request_id, chunk_rx, result_rx))
    }

    /// Settle the lifecycle after a generation. Runs under the generation slot.
    async fn finish_generation(
        &self,
        request_id: Uuid,
        outcome: std::result::Result<&GenerationResult, &ErrorReport>,
    ) {
        let tracker = &self.inner.tracker;
        match outcome {
            Ok(result) => {
                if result.finish_reason == FinishReason::Interrupted {
                    tracker.mark_interrupted(request_id).await;
                } else {
                    tracker.mark_completed(request_id, result.completion_tokens).await;
                }
                self.return_to_ready();
            }
            Err(report) => {
                tracker.mark_failed(request_id, report.to_string()).await;
                if report.kind.is_fatal() {
                    warn!("Generation {} failed fatally, putting runtime to sleep", request_id);
                    self.inner.lifecycle.record_error(report.clone());
                    self.sleep_locked().await;
                } else {
                    self.return_to_ready();
                }
            }
        }
        self.prune_requests().await;
        self.honor_deferred_idle().await;
    }

    async fn prune_requests(&self) {
        let removed = self.inner.tracker.cleanup_old(self.inner.config.request_retention).await;
        if removed > 0 {
            debug!("Forgot {} finished requests", removed);
        }
    }

    fn return_to_ready(&self) {
        if let Err(e) = self.inner.lifecycle.transition(LifecycleEvent::Finish) {
            debug!("Not returning to ready: {}", e);
        }
    }

    async fn honor_deferred_idle(&self) {
        if self.inner.idle_deferred.swap(false, Ordering::SeqCst)
            && self.inner.lifecycle.state() == LifecycleState::Ready
        {
            info!("Applying deferred idle teardown");
            self.sleep_locked().await;
        }
    }

    /// Stop the running generation after its current step.
    ///
    /// Returns false when nothing was generating.
    pub async fn interrupt(&self) -> bool {
        if !self
            .inner
            .lifecycle
            .transition_if(LifecycleState::Generating, LifecycleEvent::Interrupt)
        {
            return false;
        }
        info!("Interrupting generation");
        self.inner.host.interrupt().await
    }

    /// Interrupt any generation, release the sandbox and go to sleep
    pub async fn sleep(&self) {
        self.interrupt().await;
        let wait = self.inner.host.config().ready_timeout;
        match timeout(wait, self.inner.generation.lock()).await {
            Ok(_slot) => self.sleep_locked().await,
            Err(_) => {
                warn!("Generation did not stop within {}ms, tearing down anyway", wait.as_millis());
                self.sleep_locked().await;
            }
        }
    }

    async fn sleep_locked(&self) {
        self.inner.idle_deferred.store(false, Ordering::SeqCst);
        self.inner.host.teardown().await;
        let _ = self.inner.lifecycle.transition(LifecycleEvent::Sleep);
        info!("Runtime is asleep");
    }

    /// React to an idle or lock-screen signal.
    ///
    /// While the slot is busy the teardown is deferred until it is released;
    /// an `Active` signal in the meantime cancels it.
    pub async fn on_idle_signal(&self, state: IdleState) -> IdleOutcome {
        if state == IdleState::Active {
            if self.inner.idle_deferred.swap(false, Ordering::SeqCst) {
                debug!("User is back, cancelling deferred idle teardown");
            }
            return IdleOutcome::Ignored;
        }
        if !self.inner.config.teardown_on_idle_signal || self.inner.lifecycle.state() == LifecycleState::Asleep {
            return IdleOutcome::Ignored;
        }

        match self.inner.generation.try_lock() {
            Ok(_slot) => {
                if self.inner.lifecycle.state() == LifecycleState::Asleep {
                    return IdleOutcome::Ignored;
                }
                info!("Idle signal {:?}, tearing down", state);
                self.sleep_locked().await;
                IdleOutcome::TornDown
            }
            Err(_) => {
                debug!("Idle signal {:?} deferred until the generation ends", state);
                if !self.inner.idle_deferred.swap(true, Ordering::SeqCst) {
                    // The holder may have checked the flag already; queue behind it
                    let orchestrator = self.clone();
                    let generation = self.inner.generation.clone();
                    tokio::spawn(async move {
                        let _slot = generation.lock_owned().await;
                        orchestrator.honor_deferred_idle().await;
                    });
                }
                IdleOutcome::Deferred
            }
        }
    }

    /// Sleep when Ready and quiet for at least `idle`
    pub async fn sleep_if_idle(&self, idle: Duration) -> bool {
        let record = self.inner.lifecycle.snapshot();
        if record.state != LifecycleState::Ready {
            return false;
        }
        let quiet = (Utc::now() - record.last_activity).to_std().unwrap_or_default();
        if quiet < idle {
            return false;
        }

        let _slot = match self.inner.generation.try_lock() {
            Ok(slot) => slot,
            Err(_) => return false,
        };
        if self.inner.lifecycle.state() != LifecycleState::Ready {
            return false;
        }
        info!("Idle for {}s, putting runtime to sleep", quiet.as_secs());
        self.sleep_locked().await;
        true
    }

    /// Periodically apply the idle timeout; `None` when it is disabled
    pub fn spawn_idle_watchdog(&self) -> Option<JoinHandle<()>> {
        let idle = self.inner.config.idle_timeout?;
        let period = self.inner.config.idle_check_interval.max(Duration::from_millis(1));
        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                let orchestrator = Orchestrator { inner };
                orchestrator.prune_requests().await;
                orchestrator.sleep_if_idle(idle).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::testing::{test_catalog, test_host_config, MemoryFetcher, MockBackend};
    use futures::StreamExt;
    use tokio::time::sleep;

    fn orchestrator_with(backend: MockBackend, config: OrchestratorConfig, host_config: HostConfig) -> Orchestrator {
        let catalog = test_catalog();
        let fetcher = Arc::new(MemoryFetcher::for_catalog(&catalog));
        let host = RuntimeHost::new(
            host_config,
            catalog,
            Arc::new(backend),
            fetcher,
            SledTensorCache::new_temp().unwrap(),
            Lifecycle::new(),
        );
        Orchestrator::new(config, host)
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            default_model: "test-model".to_string(),
            idle_timeout: None,
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator(backend: MockBackend) -> Orchestrator {
        orchestrator_with(backend, test_config(), test_host_config())
    }

    fn hi() -> RequestPrompt {
        RequestPrompt::messages(vec![crate::protocol::ChatMessage::user("hi")])
    }

    async fn collect(stream: &mut TextStream) -> String {
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk.unwrap());
        }
        text
    }

    #[tokio::test]
    async fn test_generate_wakes_and_returns_to_ready() {
        let backend = MockBackend::new("Hello");
        let orch = orchestrator(backend.clone());

        let result = orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        assert_eq!(result.text, "Hello");
        assert_eq!(result.model_id, "test-model");
        assert!(!result.cached);

        let record = orch.status();
        assert_eq!(record.state, LifecycleState::Ready);
        assert_eq!(record.current_model.as_deref(), Some("test-model"));
        assert_eq!(orch.tracker().stats().await.completed, 1);

        let again = orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        assert_eq!(again.text, result.text);
        assert_eq!(backend.creations(), 1);
    }

    #[tokio::test]
    async fn test_ensure_model_reuses_and_switches() {
        let backend = MockBackend::new("ok");
        let orch = orchestrator(backend.clone());

        let first = orch.ensure_model("test-model").await.unwrap();
        assert_eq!(orch.ensure_model("test-model").await.unwrap(), first);
        assert_eq!(backend.creations(), 1);

        let other = orch.ensure_model("other-model").await.unwrap();
        assert_ne!(other.epoch, first.epoch);
        assert_eq!(orch.status().current_model.as_deref(), Some("other-model"));
        assert_eq!(backend.creations(), 2);
    }

    #[tokio::test]
    async fn test_wake_failure_reverts_to_asleep() {
        let backend = MockBackend::new("ok");
        let orch = orchestrator(backend.clone());

        let err = orch.ensure_model("half-model").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingExtension);
        let record = orch.status();
        assert_eq!(record.state, LifecycleState::Asleep);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::MissingExtension);

        // A later call retries from scratch
        assert!(orch.ensure_model("half-model").await.is_err());
        assert_eq!(backend.creations(), 0);
        orch.ensure_model("test-model").await.unwrap();
        assert!(orch.status().last_error.is_none());
    }

    #[tokio::test]
    async fn test_f16_device_runs_f16_model() {
        let backend = MockBackend::new("half").with_f16();
        let orch = orchestrator(backend.clone());

        let options = GenerationOptions {
            model: Some("half-model".to_string()),
            ..Default::default()
        };
        let result = orch.generate(hi(), options).await.unwrap();
        assert_eq!(result.text, "half");
        assert_eq!(result.model_id, "half-model");
        assert_eq!(backend.creations(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_streams_do_not_interleave() {
        let backend = MockBackend::new("Hello world").with_step_delay(Duration::from_millis(2));
        let orch = orchestrator(backend.clone());
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for name in ["a", "b"] {
            let orch = orch.clone();
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = orch.stream(hi(), GenerationOptions::default()).await.unwrap();
                let mut text = String::new();
                while let Some(chunk) = stream.next().await {
                    log.lock().unwrap().push(name);
                    text.push_str(&chunk.unwrap());
                }
                let result = stream.into_result().await.unwrap();
                assert_eq!(result.text, text);
                text
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), "Hello world");
        }

        assert_eq!(backend.prefills(), 2);
        let log = log.lock().unwrap();
        let switches = log.windows(2).filter(|w| w[0] != w[1]).count();
        assert_eq!(switches, 1);
    }

    #[tokio::test]
    async fn test_interrupt_keeps_emitted_prefix() {
        let backend = MockBackend::new(&"abcdefghij".repeat(20)).with_step_delay(Duration::from_millis(5));
        let orch = orchestrator(backend);

        let mut stream = orch.stream(hi(), GenerationOptions::default()).await.unwrap();
        let mut text = String::new();
        for _ in 0..3 {
            text.push_str(&stream.next().await.unwrap().unwrap());
        }
        assert_eq!(orch.status().state, LifecycleState::Generating);
        assert!(orch.interrupt().await);
        assert_eq!(orch.status().state, LifecycleState::Interrupted);

        text.push_str(&collect(&mut stream).await);
        let result = stream.into_result().await.unwrap();
        assert_eq!(result.finish_reason, FinishReason::Interrupted);
        assert_eq!(result.text, text);
        assert!(text.len() < 200);

        assert_eq!(orch.status().state, LifecycleState::Ready);
        assert!(!orch.interrupt().await);
        assert_eq!(orch.tracker().stats().await.interrupted, 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_slot() {
        let backend = MockBackend::new(&"abcdefghij".repeat(20)).with_step_delay(Duration::from_millis(2));
        let orch = orchestrator(backend);

        let mut stream = orch.stream(hi(), GenerationOptions::default()).await.unwrap();
        stream.next().await.unwrap().unwrap();
        drop(stream);

        let result = timeout(
            Duration::from_secs(5),
            orch.generate(hi(), GenerationOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(result.finish_reason, FinishReason::EndOfSequence);
        assert_eq!(orch.tracker().stats().await.interrupted, 1);
    }

    #[tokio::test]
    async fn test_idle_while_generating_is_deferred() {
        let backend = MockBackend::new(&"abcdefghij".repeat(5)).with_step_delay(Duration::from_millis(2));
        let orch = orchestrator(backend);

        let mut stream = orch.stream(hi(), GenerationOptions::default()).await.unwrap();
        stream.next().await.unwrap().unwrap();
        assert_eq!(orch.on_idle_signal(IdleState::Idle).await, IdleOutcome::Deferred);
        assert_eq!(orch.status().state, LifecycleState::Generating);

        collect(&mut stream).await;
        let result = stream.into_result().await.unwrap();
        assert_eq!(result.finish_reason, FinishReason::EndOfSequence);

        assert_eq!(orch.status().state, LifecycleState::Asleep);
        assert!(orch.host().status().await.is_none());
    }

    #[tokio::test]
    async fn test_active_signal_cancels_deferred_idle() {
        let backend = MockBackend::new(&"abcdefghij".repeat(5)).with_step_delay(Duration::from_millis(2));
        let orch = orchestrator(backend.clone());

        let mut stream = orch.stream(hi(), GenerationOptions::default()).await.unwrap();
        stream.next().await.unwrap().unwrap();
        assert_eq!(orch.on_idle_signal(IdleState::Idle).await, IdleOutcome::Deferred);
        assert_eq!(orch.on_idle_signal(IdleState::Active).await, IdleOutcome::Ignored);

        collect(&mut stream).await;
        stream.into_result().await.unwrap();
        sleep(Duration::from_millis(50)).await;

        assert_eq!(orch.status().state, LifecycleState::Ready);
        assert!(orch.host().status().await.is_some());
        orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        assert_eq!(orch.status().state, LifecycleState::Ready);
        assert_eq!(backend.creations(), 1);
    }

    #[tokio::test]
    async fn test_idle_deferred_until_slot_is_released() {
        let backend = MockBackend::new("ok");
        let orch = orchestrator(backend.clone());
        orch.ensure_model("test-model").await.unwrap();

        // Whoever holds the slot has already passed its deferred-idle check
        let slot = orch.inner.generation.clone().lock_owned().await;
        assert_eq!(orch.on_idle_signal(IdleState::Locked).await, IdleOutcome::Deferred);
        assert_eq!(orch.status().state, LifecycleState::Ready);
        drop(slot);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(orch.status().state, LifecycleState::Asleep);

        // Nothing stale is left to tear down the next runtime
        orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.status().state, LifecycleState::Ready);
        assert_eq!(backend.creations(), 2);
    }

    #[tokio::test]
    async fn test_finished_requests_are_forgotten() {
        let config = OrchestratorConfig {
            request_retention: Duration::ZERO,
            ..test_config()
        };
        let orch = orchestrator_with(MockBackend::new("ok"), config, test_host_config());

        for _ in 0..5 {
            orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        }
        assert_eq!(orch.tracker().stats().await.total, 0);

        let kept = orchestrator(MockBackend::new("ok"));
        for _ in 0..3 {
            kept.generate(hi(), GenerationOptions::default()).await.unwrap();
        }
        assert_eq!(kept.tracker().stats().await.completed, 3);
    }

    #[tokio::test]
    async fn test_idle_while_ready_tears_down() {
        let backend = MockBackend::new("ok");
        let orch = orchestrator(backend.clone());
        orch.ensure_model("test-model").await.unwrap();

        assert_eq!(orch.on_idle_signal(IdleState::Active).await, IdleOutcome::Ignored);
        assert_eq!(orch.on_idle_signal(IdleState::Locked).await, IdleOutcome::TornDown);
        let record = orch.status();
        assert_eq!(record.state, LifecycleState::Asleep);
        assert_eq!(record.progress, 0.0);
        assert_eq!(orch.on_idle_signal(IdleState::Idle).await, IdleOutcome::Ignored);

        // The next request starts over, replaying the durable cache
        orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        assert_eq!(backend.creations(), 2);
        assert_eq!(orch.host().stats().cache_hits, 4);
    }

    #[tokio::test]
    async fn test_fatal_error_puts_runtime_to_sleep() {
        let orch = orchestrator(MockBackend::new("abcdef").failing_at_decode(1));

        let err = orch.generate(hi(), GenerationOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeCrash);

        let record = orch.status();
        assert_eq!(record.state, LifecycleState::Asleep);
        assert_eq!(record.last_error.unwrap().kind, ErrorKind::RuntimeCrash);
        assert!(orch.host().status().await.is_none());
        assert_eq!(orch.tracker().stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_window_too_small_is_not_fatal() {
        let orch = orchestrator(MockBackend::new("ok"));

        let err = orch
            .generate(RequestPrompt::text("z".repeat(5000)), GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WindowTooSmall);
        assert_eq!(orch.status().state, LifecycleState::Ready);

        assert_eq!(orch.generate(hi(), GenerationOptions::default()).await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let orch = orchestrator(MockBackend::new("ok"));
        let err = orch
            .generate(RequestPrompt::text("  "), GenerationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(orch.status().state, LifecycleState::Asleep);
    }

    #[tokio::test]
    async fn test_completion_cache_serves_repeats() {
        let backend = MockBackend::new("cached text");
        let config = OrchestratorConfig {
            completion_cache: true,
            ..test_config()
        };
        let orch = orchestrator_with(backend.clone(), config, test_host_config());

        let first = orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        let second = orch.generate(hi(), GenerationOptions::default()).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.text, first.text);
        assert_ne!(second.request_id, first.request_id);
        assert_eq!(backend.prefills(), 1);
    }

    #[tokio::test]
    async fn test_sleep_releases_runtime() {
        let orch = orchestrator(MockBackend::new("ok"));
        orch.ensure_model("test-model").await.unwrap();

        orch.sleep().await;
        assert_eq!(orch.status().state, LifecycleState::Asleep);
        assert!(orch.host().status().await.is_none());
    }

    #[tokio::test]
    async fn test_idle_watchdog() {
        let config = OrchestratorConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            idle_check_interval: Duration::from_millis(20),
            ..test_config()
        };
        let orch = orchestrator_with(MockBackend::new("ok"), config, test_host_config());
        orch.ensure_model("test-model").await.unwrap();

        let watchdog = orch.spawn_idle_watchdog().unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(orch.status().state, LifecycleState::Asleep);
        watchdog.abort();

        assert!(orchestrator(MockBackend::new("ok")).spawn_idle_watchdog().is_none());
    }
}
