//! A cloneable handle for observing and stopping a streaming session.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::host::BufferId;

/// Unique identity of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a session stopped writing before its stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// The region no longer holds what the session last wrote
    RegionEdited,
    /// The user entered insert or replace mode in the target buffer
    EditingMode,
    /// Aborted through a handle or `Engine::interrupt`
    Requested,
    /// Cancelled to make room for a newer session on the same buffer
    Superseded,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The stream was exhausted and a fresh user prompt was appended
    Completed,
    Interrupted(InterruptReason),
    /// The provider or host failed; the message was shown to the user
    Failed(String),
    /// The target buffer was closed mid-stream
    BufferClosed,
}

/// Per-buffer state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
}

/// A cloneable handle to one streaming session.
///
/// All shared fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    buffer: BufferId,
    model: String,
    started_at: DateTime<Utc>,
    pub(crate) cancel: CancellationToken,
    reason: Arc<Mutex<Option<InterruptReason>>>,
    pub(crate) response: Arc<Mutex<String>>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    pub(crate) fn new(
        buffer: BufferId,
        model: impl Into<String>,
    ) -> (Self, watch::Sender<Option<SessionOutcome>>) {
        let (outcome_tx, outcome) = watch::channel(None);
        let handle = Self {
            id: SessionId::new(),
            buffer,
            model: model.into(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            response: Arc::new(Mutex::new(String::new())),
            outcome,
        };
        (handle, outcome_tx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Buffer the session writes into
    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Stop the session. Fragments already in flight are discarded.
    pub fn abort(&self) {
        self.interrupt(InterruptReason::Requested);
    }

    /// Record `reason` and cancel. The first reason recorded wins.
    pub(crate) fn interrupt(&self, reason: InterruptReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() && !self.cancel.is_cancelled() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    /// Reason recorded by the first interruption, if any
    pub(crate) fn interrupt_reason(&self) -> Option<InterruptReason> {
        *self.reason.lock()
    }

    /// Whether the session is still running
    pub fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }

    /// Wait for the session to end
    pub async fn wait(&self) -> SessionOutcome {
        let mut outcome = self.outcome.clone();
        match outcome.wait_for(Option::is_some).await {
            Ok(done) => done.clone().unwrap_or_else(|| {
                SessionOutcome::Failed("session ended without an outcome".into())
            }),
            Err(_) => self
                .outcome
                .borrow()
                .clone()
                .unwrap_or_else(|| SessionOutcome::Failed("session task was dropped".into())),
        }
    }

    /// Snapshot of the text received so far
    pub fn response(&self) -> String {
        self.response.lock().clone()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("buffer", &self.buffer)
            .field("model", &self.model)
            .field("running", &self.is_running())
            .finish()
    }
}
