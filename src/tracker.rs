use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// State of a generation request
#[derive(Debug, Clone, PartialEq)]
pub enum RequestState {
    /// Waiting for the generation slot
    Queued,
    /// Holding the slot and generating
    Running,
    Completed { completion_tokens: usize },
    /// Stopped early by the caller
    Interrupted,
    Failed { error: String },
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::Queued | RequestState::Running)
    }
}

/// Shape of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Generate,
    Stream,
}

/// Metadata about a tracked request
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub id: Uuid,
    pub kind: RequestKind,
    pub model_id: String,
    pub state: RequestState,
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl RequestInfo {
    pub fn new(id: Uuid, kind: RequestKind, model_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            model_id,
            state: RequestState::Queued,
            submitted: now,
            started: None,
            last_updated: now,
        }
    }

    fn update_state(&mut self, state: RequestState) {
        self.state = state;
        self.last_updated = Utc::now();
    }

    /// Time spent waiting for the slot
    pub fn queue_time(&self) -> Option<chrono::Duration> {
        self.started.map(|started| started - self.submitted)
    }

    /// Time spent generating, once finished
    pub fn run_time(&self) -> Option<chrono::Duration> {
        match (self.started, self.state.is_terminal()) {
            (Some(started), true) => Some(self.last_updated - started),
            _ => None,
        }
    }
}

/// Tracks requests from submission to completion
#[derive(Clone, Default)]
pub struct RequestTracker {
    requests: Arc<RwLock<HashMap<Uuid, RequestInfo>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, id: Uuid, kind: RequestKind, model_id: &str) {
        let mut requests = self.requests.write().await;
        debug!("Tracking {:?} request {} for {}", kind, id, model_id);
        requests.insert(id, RequestInfo::new(id, kind, model_id.to_string()));
    }

    pub async fn mark_running(&self, id: Uuid) {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&id) {
            Some(info) => {
                info.started = Some(Utc::now());
                info.update_state(RequestState::Running);
                if let Some(waited) = info.queue_time() {
                    debug!("Request {} started after {}ms", id, waited.num_milliseconds());
                }
            }
            None => warn!("Attempted to start unknown request {}", id),
        }
    }

    pub async fn mark_completed(&self, id: Uuid, completion_tokens: usize) {
        let mut requests = self.requests.write().await;
        if let Some(info) = requests.get_mut(&id) {
            info.update_state(RequestState::Completed { completion_tokens });
            if let Some(duration) = info.run_time() {
                info!(
                    "Request {} completed with {} tokens in {}ms",
                    id,
                    completion_tokens,
                    duration.num_milliseconds()
                );
            }
        }
    }

    pub async fn mark_interrupted(&self, id: Uuid) {
        let mut requests = self.requests.write().await;
        if let Some(info) = requests.get_mut(&id) {
            info.update_state(RequestState::Interrupted);
            info!("Request {} interrupted", id);
        }
    }

    pub async fn mark_failed(&self, id: Uuid, error: String) {
        let mut requests = self.requests.write().await;
        if let Some(info) = requests.get_mut(&id) {
            warn!("Request {} failed: {}", id, error);
            info.update_state(RequestState::Failed { error });
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<RequestInfo> {
        self.requests.read().await.get(&id).cloned()
    }

    /// Forget finished requests that have not changed for `max_age`
    pub async fn cleanup_old(&self, max_age: Duration) -> usize {
        let mut requests = self.requests.write().await;
        let now = Utc::now();
        let mut removed = 0;

        requests.retain(|id, info| {
            if !info.state.is_terminal() {
                return true;
            }
            let age = (now - info.last_updated).to_std().unwrap_or_default();
            if age >= max_age {
                debug!("Removing old request {} (age: {}ms)", id, age.as_millis());
                removed += 1;
                return false;
            }
            true
        });

        if removed > 0 {
            debug!("Cleaned up {} old requests", removed);
        }
        removed
    }

    pub async fn stats(&self) -> TrackerStats {
        let requests = self.requests.read().await;
        let mut stats = TrackerStats::default();
        let mut total_run_ms = 0u64;

        for info in requests.values() {
            stats.total += 1;
            match &info.state {
                RequestState::Queued => stats.queued += 1,
                RequestState::Running => stats.running += 1,
                RequestState::Completed { completion_tokens } => {
                    stats.completed += 1;
                    stats.completion_tokens += *completion_tokens as u64;
                    if let Some(duration) = info.run_time() {
                        total_run_ms += duration.num_milliseconds().max(0) as u64;
                    }
                }
                RequestState::Interrupted => stats.interrupted += 1,
                RequestState::Failed { .. } => stats.failed += 1,
            }
        }

        if stats.completed > 0 {
            stats.avg_run_time_ms = total_run_ms / stats.completed as u64;
        }
        stats
    }
}

/// Counters over tracked requests
#[derive(Debug, Default, Clone)]
pub struct TrackerStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub interrupted: usize,
    pub failed: usize,
    pub completion_tokens: u64,
    pub avg_run_time_ms: u64,
}

impl std::fmt::Display for TrackerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Requests: total={}, queued={}, running={}, completed={}, interrupted={}, failed={}, avg_time={}ms",
            self.total,
            self.queued,
            self.running,
            self.completed,
            self.interrupted,
            self.failed,
            self.avg_run_time_ms
        )
    }
}
