use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::protocol::ErrorReport;

/// Observable state of the runtime as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Asleep,
    Waking,
    Ready,
    Generating,
    Interrupted,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Asleep => "asleep",
            LifecycleState::Waking => "waking",
            LifecycleState::Ready => "ready",
            LifecycleState::Generating => "generating",
            LifecycleState::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Inputs of the lifecycle state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Start loading the named model
    Wake(String),
    Woke,
    WakeFailed,
    Begin,
    Interrupt,
    Finish,
    Sleep,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LifecycleError {
    #[error("Cannot apply {event:?} while {from}")]
    InvalidTransition { from: LifecycleState, event: LifecycleEvent },
}

/// Snapshot published to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub state: LifecycleState,
    pub current_model: Option<String>,
    /// Load progress in [0, 1]
    pub progress: f32,
    pub last_activity: DateTime<Utc>,
    pub last_error: Option<ErrorReport>,
}

impl Default for LifecycleRecord {
    fn default() -> Self {
        Self {
            state: LifecycleState::Asleep,
            current_model: None,
            progress: 0.0,
            last_activity: Utc::now(),
            last_error: None,
        }
    }
}

impl LifecycleRecord {
    /// Apply a transition in place
    fn apply(&mut self, event: &LifecycleEvent) -> Result<(), LifecycleError> {
        use LifecycleState::*;

        let next = match (self.state, event) {
            (Asleep | Waking | Ready, LifecycleEvent::Wake(model)) => {
                if self.current_model.as_deref() != Some(model.as_str()) {
                    self.progress = 0.0;
                }
                self.current_model = Some(model.clone());
                Waking
            }
            (Waking, LifecycleEvent::Woke) => {
                self.progress = 1.0;
                Ready
            }
            (Waking, LifecycleEvent::WakeFailed) => {
                self.current_model = None;
                self.progress = 0.0;
                Asleep
            }
            (Ready, LifecycleEvent::Begin) => Generating,
            (Generating, LifecycleEvent::Interrupt) => Interrupted,
            (Generating | Interrupted, LifecycleEvent::Finish) => Ready,
            (_, LifecycleEvent::Sleep) => {
                self.current_model = None;
                self.progress = 0.0;
                Asleep
            }
            (from, event) => {
                return Err(LifecycleError::InvalidTransition {
                    from,
                    event: event.clone(),
                })
            }
        };

        self.state = next;
        self.last_activity = Utc::now();
        Ok(())
    }
}

/// Shared lifecycle record with change notification.
///
/// Every transition happens under the watch channel's lock, so concurrent
/// callers never observe a half-applied change.
#[derive(Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<LifecycleRecord>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LifecycleRecord::default());
        Self { tx: Arc::new(tx) }
    }

    /// Apply `event`, returning the new state
    pub fn transition(&self, event: LifecycleEvent) -> Result<LifecycleState, LifecycleError> {
        let mut outcome = Ok(LifecycleState::Asleep);
        self.tx.send_if_modified(|record| {
            let from = record.state;
            match record.apply(&event) {
                Ok(()) => {
                    debug!("Lifecycle {} -> {} on {:?}", from, record.state, event);
                    outcome = Ok(record.state);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Apply `event` only while in `expected`
    pub fn transition_if(&self, expected: LifecycleState, event: LifecycleEvent) -> bool {
        self.tx.send_if_modified(|record| record.state == expected && record.apply(&event).is_ok())
    }

    pub fn set_progress(&self, progress: f32) {
        let progress = progress.clamp(0.0, 1.0);
        self.tx.send_if_modified(|record| {
            if (record.progress - progress).abs() < f32::EPSILON {
                return false;
            }
            record.progress = progress;
            true
        });
    }

    pub fn record_error(&self, report: ErrorReport) {
        self.tx.send_modify(|record| record.last_error = Some(report));
    }

    pub fn clear_error(&self) {
        self.tx.send_if_modified(|record| record.last_error.take().is_some());
    }

    /// Mark activity without a state change
    pub fn touch(&self) {
        self.tx.send_modify(|record| record.last_activity = Utc::now());
    }

    pub fn snapshot(&self) -> LifecycleRecord {
        self.tx.borrow().clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.tx.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleRecord> {
        self.tx.subscribe()
    }
}
