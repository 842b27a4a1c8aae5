use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, SledTensorCache, TensorCache};
use crate::catalog::ModelCatalog;
use crate::config::HostConfig;
use crate::fetch::ArtifactFetcher;
use crate::lifecycle::{Lifecycle, LifecycleEvent, LifecycleState};
use crate::protocol::{ErrorKind, ErrorReport, HostMessage, SandboxEvent};
use crate::runtime::RuntimeBackend;
use crate::sandbox::{spawn_sandbox, SandboxHandle};

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("No ready sandbox")]
    NotReady,

    #[error("Sandbox failed: {0}")]
    Sandbox(ErrorReport),

    #[error("Sandbox channel closed")]
    Closed,

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::UnknownModel(_) => ErrorKind::InvalidRequest,
            HostError::Sandbox(report) => report.kind,
            HostError::NotReady | HostError::Closed => ErrorKind::RuntimeCrash,
            HostError::Cache(_) => ErrorKind::MalformedConfig,
        }
    }

    pub fn report(&self) -> ErrorReport {
        match self {
            HostError::Sandbox(report) => report.clone(),
            other => ErrorReport::new(other.kind(), other.to_string()),
        }
    }
}

/// Load state of the sandbox slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SlotStatus {
    Loading { progress: f32 },
    Ready,
    Failed(ErrorReport),
}

/// Public view of the slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotInfo {
    pub model_id: String,
    pub epoch: u64,
    pub sandbox_id: String,
    pub status: SlotStatus,
}

struct Slot {
    model_id: String,
    epoch: u64,
    handle: SandboxHandle,
    status: watch::Receiver<SlotStatus>,
    pump: JoinHandle<()>,
}

/// Request currently receiving generation events
struct ActiveRequest {
    request_id: Uuid,
    tx: mpsc::UnboundedSender<SandboxEvent>,
}

#[derive(Debug, Default)]
struct HostCounters {
    sandboxes_created: AtomicU64,
    reloads_scheduled: AtomicU64,
    reloads_performed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_writes: AtomicU64,
}

/// Host counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    pub sandboxes_created: u64,
    pub reloads_scheduled: u64,
    pub reloads_performed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_writes: u64,
}

impl std::fmt::Display for HostStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Host: sandboxes={}, reloads={}/{}, cache_hits={}, cache_misses={}, cache_writes={}",
            self.sandboxes_created,
            self.reloads_performed,
            self.reloads_scheduled,
            self.cache_hits,
            self.cache_misses,
            self.cache_writes
        )
    }
}

struct HostInner {
    config: HostConfig,
    catalog: ModelCatalog,
    backend: Arc<dyn RuntimeBackend>,
    fetcher: Arc<dyn ArtifactFetcher>,
    store: SledTensorCache,
    lifecycle: Lifecycle,
    /// Held across a whole setup
    creation: Mutex<()>,
    slot: Mutex<Option<Slot>>,
    epoch: AtomicU64,
    active: Mutex<Option<ActiveRequest>>,
    counters: HostCounters,
}

/// Owner of the single sandbox slot.
///
/// Creates, reuses and tears down sandboxes, services their cache requests
/// from the durable store and routes generation events to the active request.
#[derive(Clone)]
pub struct RuntimeHost {
    inner: Arc<HostInner>,
}

impl RuntimeHost {
    pub fn new(
        config: HostConfig,
        catalog: ModelCatalog,
        backend: Arc<dyn RuntimeBackend>,
        fetcher: Arc<dyn ArtifactFetcher>,
        store: SledTensorCache,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                catalog,
                backend,
                fetcher,
                store,
                lifecycle,
                creation: Mutex::new(()),
                slot: Mutex::new(None),
                epoch: AtomicU64::new(0),
                active: Mutex::new(None),
                counters: HostCounters::default(),
            }),
        }
    }

    /// Open the durable store named by `config`, or a temporary one
    pub fn open(
        config: HostConfig,
        catalog: ModelCatalog,
        backend: Arc<dyn RuntimeBackend>,
        fetcher: Arc<dyn ArtifactFetcher>,
        lifecycle: Lifecycle,
    ) -> Result<Self, HostError> {
        let store = match &config.cache_path {
            Some(path) => SledTensorCache::new(path)?,
            None => SledTensorCache::new_temp()?,
        };
        Ok(Self::new(config, catalog, backend, fetcher, store, lifecycle))
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.inner.catalog
    }

    pub fn store(&self) -> &SledTensorCache {
        &self.inner.store
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.inner.lifecycle
    }

    /// Bring up a sandbox for `model_id`, reusing a ready one.
    ///
    /// Returns the epoch of the ready slot.
    pub async fn setup(&self, model_id: &str) -> Result<u64, HostError> {
        let model = self
            .inner
            .catalog
            .get(model_id)
            .cloned()
            .ok_or_else(|| HostError::UnknownModel(model_id.to_string()))?;

        let _creating = self.inner.creation.lock().await;

        let existing = {
            let slot = self.inner.slot.lock().await;
            slot.as_ref()
                .map(|s| (s.model_id.clone(), s.epoch, s.status.clone()))
        };

        if let Some((current_model, epoch, mut status)) = existing {
            if current_model != model_id {
                info!("Switching sandbox from {} to {}", current_model, model_id);
                self.teardown_slot(Some(epoch)).await;
            } else {
                let current = status.borrow().clone();
                match current {
                    SlotStatus::Ready => {
                        debug!("Reusing ready sandbox for {} (epoch {})", model_id, epoch);
                        return Ok(epoch);
                    }
                    SlotStatus::Failed(report) => {
                        info!("Recreating failed sandbox for {}: {}", model_id, report);
                        self.teardown_slot(Some(epoch)).await;
                    }
                    SlotStatus::Loading { progress } => {
                        debug!("Awaiting sandbox for {} at {:.0}%", model_id, progress * 100.0);
                        let ready_timeout = self.inner.config.ready_timeout;
                        match timeout(ready_timeout, wait_ready(&mut status, None)).await {
                            Ok(Ok(())) => return Ok(epoch),
                            Ok(Err(report)) => warn!("Loading sandbox for {} failed: {}", model_id, report),
                            Err(_) => warn!(
                                "Sandbox for {} not ready after {}ms, recreating",
                                model_id,
                                ready_timeout.as_millis()
                            ),
                        }
                        self.teardown_slot(Some(epoch)).await;
                    }
                }
            }
        }

        let (epoch, mut status) = self.create(model).await;
        let stall = self.inner.config.load_stall_timeout;
        match wait_ready(&mut status, Some(stall)).await {
            Ok(()) => {
                info!("Sandbox for {} ready (epoch {})", model_id, epoch);
                Ok(epoch)
            }
            Err(report) => {
                error!("Sandbox for {} failed to load: {}", model_id, report);
                if report.kind == ErrorKind::LoadStalled {
                    self.inner.lifecycle.record_error(report.clone());
                }
                self.teardown_slot(Some(epoch)).await;
                Err(HostError::Sandbox(report))
            }
        }
    }

    async fn create(&self, model: crate::catalog::ModelConfig) -> (u64, watch::Receiver<SlotStatus>) {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let model_id = model.id.clone();
        let (handle, events) = spawn_sandbox(
            model,
            self.inner.backend.clone(),
            self.inner.fetcher.clone(),
            &self.inner.config,
        );

        let (status_tx, status_rx) = watch::channel(SlotStatus::Loading { progress: 0.0 });
        let pump = tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            epoch,
            events,
            status_tx,
            handle.commands(),
        ));

        self.inner.lifecycle.set_progress(0.0);
        self.inner.counters.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        info!("Creating sandbox {} for {} (epoch {})", handle.id(), model_id, epoch);

        *self.inner.slot.lock().await = Some(Slot {
            model_id,
            epoch,
            handle,
            status: status_rx.clone(),
            pump,
        });
        (epoch, status_rx)
    }

    /// Stop the sandbox and clear volatile progress
    pub async fn teardown(&self) {
        if self.teardown_slot(None).await {
            info!("Sandbox torn down");
        }
    }

    /// Tear down the slot, only if it still has `expected` epoch when given
    async fn teardown_slot(&self, expected: Option<u64>) -> bool {
        teardown_inner(&self.inner, expected).await
    }

    /// Route `message` to the ready sandbox; events for `request_id` come out
    /// of the returned receiver
    pub async fn submit(
        &self,
        request_id: Uuid,
        message: HostMessage,
    ) -> Result<mpsc::UnboundedReceiver<SandboxEvent>, HostError> {
        let commands = {
            let slot = self.inner.slot.lock().await;
            match slot.as_ref() {
                Some(s) if *s.status.borrow() == SlotStatus::Ready => s.handle.commands(),
                _ => return Err(HostError::NotReady),
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.active.lock().await = Some(ActiveRequest { request_id, tx });

        if commands.send(message).await.is_err() {
            self.inner.active.lock().await.take();
            return Err(HostError::Closed);
        }
        debug!("Submitted request {}", request_id);
        Ok(rx)
    }

    /// Ask the running generation to stop after its current step
    pub async fn interrupt(&self) -> bool {
        let commands = {
            let slot = self.inner.slot.lock().await;
            slot.as_ref().map(|s| s.handle.commands())
        };
        match commands {
            Some(commands) => commands.send(HostMessage::Interrupt).await.is_ok(),
            None => false,
        }
    }

    pub async fn status(&self) -> Option<SlotInfo> {
        let slot = self.inner.slot.lock().await;
        slot.as_ref().map(|s| SlotInfo {
            model_id: s.model_id.clone(),
            epoch: s.epoch,
            sandbox_id: s.handle.id().to_string(),
            status: s.status.borrow().clone(),
        })
    }

    /// Epoch of a ready slot holding `model_id`
    pub async fn ready_epoch(&self, model_id: &str) -> Option<u64> {
        let slot = self.inner.slot.lock().await;
        slot.as_ref()
            .filter(|s| s.model_id == model_id && *s.status.borrow() == SlotStatus::Ready)
            .map(|s| s.epoch)
    }

    pub fn stats(&self) -> HostStats {
        let c = &self.inner.counters;
        HostStats {
            sandboxes_created: c.sandboxes_created.load(Ordering::Relaxed),
            reloads_scheduled: c.reloads_scheduled.load(Ordering::Relaxed),
            reloads_performed: c.reloads_performed.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            cache_writes: c.cache_writes.load(Ordering::Relaxed),
        }
    }
}

async fn teardown_inner(inner: &HostInner, expected: Option<u64>) -> bool {
    let slot = {
        let mut slot = inner.slot.lock().await;
        match (slot.as_ref(), expected) {
            (None, _) => return false,
            (Some(s), Some(epoch)) if s.epoch != epoch => return false,
            _ => slot.take(),
        }
    };

    if let Some(slot) = slot {
        slot.pump.abort();
        slot.handle.shutdown();
        debug!("Released sandbox slot epoch {}", slot.epoch);
    }
    if let Some(active) = inner.active.lock().await.take() {
        warn!("Dropping active request {} on teardown", active.request_id);
    }
    inner.lifecycle.set_progress(0.0);
    true
}

/// Wait until the slot is ready. With `stall`, fail when no status change
/// arrives within that long.
async fn wait_ready(
    status: &mut watch::Receiver<SlotStatus>,
    stall: Option<std::time::Duration>,
) -> Result<(), ErrorReport> {
    loop {
        let current = status.borrow_and_update().clone();
        match current {
            SlotStatus::Ready => return Ok(()),
            SlotStatus::Failed(report) => return Err(report),
            SlotStatus::Loading { .. } => {}
        }

        let changed = match stall {
            Some(stall) => match timeout(stall, status.changed()).await {
                Ok(changed) => changed,
                Err(_) => {
                    return Err(ErrorReport::new(
                        ErrorKind::LoadStalled,
                        format!("no load progress for {}ms", stall.as_millis()),
                    ))
                }
            },
            None => status.changed().await,
        };
        if changed.is_err() {
            return Err(ErrorReport::new(
                ErrorKind::RuntimeCrash,
                "sandbox went away while loading",
            ));
        }
    }
}

/// Per-slot event loop
async fn pump(
    host: Weak<HostInner>,
    epoch: u64,
    mut events: mpsc::Receiver<SandboxEvent>,
    status: watch::Sender<SlotStatus>,
    commands: mpsc::Sender<HostMessage>,
) {
    loop {
        let event = events.recv().await;
        let inner = match host.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        let event = match event {
            Some(event) => event,
            None => {
                let report = ErrorReport::new(ErrorKind::RuntimeCrash, "sandbox exited unexpectedly");
                error!("Sandbox epoch {} closed its event channel", epoch);
                on_fatal(&inner, epoch, &status, &report);
                forward(&inner, SandboxEvent::Error {
                    request_id: None,
                    report,
                })
                .await;
                break;
            }
        };

        match event {
            SandboxEvent::Progress { fraction, text, .. } => {
                debug!("Sandbox progress {:.0}%: {}", fraction * 100.0, text);
                status.send_if_modified(|s| match s {
                    SlotStatus::Loading { progress } => {
                        *progress = fraction;
                        true
                    }
                    _ => false,
                });
                inner.lifecycle.set_progress(fraction);
            }
            SandboxEvent::Ready { model_id } => {
                debug!("Sandbox epoch {} reports {} ready", epoch, model_id);
                inner.lifecycle.set_progress(1.0);
                status.send_replace(SlotStatus::Ready);
            }
            SandboxEvent::CacheGet { correlation, key } => {
                let inner = inner.clone();
                let commands = commands.clone();
                tokio::spawn(async move {
                    let value = match inner.store.get(&key).await {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("Cache read for {} failed, reporting a miss: {}", key, e);
                            None
                        }
                    };
                    let counter = if value.is_some() {
                        &inner.counters.cache_hits
                    } else {
                        &inner.counters.cache_misses
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    let _ = commands.send(HostMessage::CacheValue { correlation, value }).await;
                });
            }
            SandboxEvent::CachePut { correlation, key, blob } => {
                let inner = inner.clone();
                let commands = commands.clone();
                tokio::spawn(async move {
                    let ok = match inner.store.put(&key, blob).await {
                        Ok(()) => {
                            inner.counters.cache_writes.fetch_add(1, Ordering::Relaxed);
                            true
                        }
                        Err(e) => {
                            warn!("Cache write for {} failed: {}", key, e);
                            false
                        }
                    };
                    let _ = commands.send(HostMessage::CacheAck { correlation, ok }).await;
                });
            }
            SandboxEvent::Error { request_id, report } => {
                if report.kind.is_fatal() {
                    on_fatal(&inner, epoch, &status, &report);
                }
                forward(&inner, SandboxEvent::Error { request_id, report }).await;
            }
            event => forward(&inner, event).await,
        }
    }
}

fn on_fatal(inner: &Arc<HostInner>, epoch: u64, status: &watch::Sender<SlotStatus>, report: &ErrorReport) {
    error!("Sandbox epoch {} failed: {}", epoch, report);
    inner.lifecycle.record_error(report.clone());
    status.send_replace(SlotStatus::Failed(report.clone()));

    if report.kind.schedules_reload() {
        schedule_reload(inner, epoch);
    }
}

fn schedule_reload(inner: &Arc<HostInner>, epoch: u64) {
    inner.counters.reloads_scheduled.fetch_add(1, Ordering::Relaxed);
    let cooldown = inner.config.crash_reload_cooldown;
    info!("Reloading sandbox epoch {} in {}ms", epoch, cooldown.as_millis());

    let host = Arc::downgrade(inner);
    tokio::spawn(async move {
        sleep(cooldown).await;
        if let Some(inner) = host.upgrade() {
            reload(&inner, epoch).await;
        }
    });
}

/// Drop a crashed slot so the next request starts from scratch
async fn reload(inner: &HostInner, epoch: u64) {
    let _creating = inner.creation.lock().await;
    if !teardown_inner(inner, Some(epoch)).await {
        debug!("Skipping reload of epoch {}: slot already replaced", epoch);
        return;
    }
    inner.lifecycle.clear_error();
    inner.lifecycle.transition_if(LifecycleState::Ready, LifecycleEvent::Sleep);
    inner.counters.reloads_performed.fetch_add(1, Ordering::Relaxed);
    info!("Reloaded after crash of epoch {}", epoch);
}

/// Deliver a generation event to the active request
async fn forward(inner: &HostInner, event: SandboxEvent) {
    let mut active = inner.active.lock().await;
    let matches = match (active.as_ref(), event.request_id()) {
        (Some(a), Some(id)) => a.request_id == id,
        // A sandbox-wide failure ends whatever is running
        (Some(_), None) => matches!(event, SandboxEvent::Error { .. }),
        (None, _) => false,
    };
    if !matches {
        debug!("Dropping event for inactive request {:?}", event.request_id());
        return;
    }

    let terminal = matches!(
        event,
        SandboxEvent::End { .. } | SandboxEvent::Completion { .. } | SandboxEvent::Error { .. }
    );
    if let Some(a) = active.as_ref() {
        if a.tx.send(event).is_err() {
            debug!("Receiver for request {} is gone", a.request_id);
        }
    }
    if terminal {
        active.take();
    }
}
