//! Session event types

use serde::{Deserialize, Serialize};

use crate::host::BufferId;
use crate::session::{SessionId, SessionOutcome};

/// Events emitted while sessions stream into buffers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The assistant prefix line was inserted and streaming began
    Started {
        session: SessionId,
        buffer: BufferId,
        model: String,
        /// First line of the region
        line: usize,
    },

    /// Accumulated text was written into the region
    Flushed {
        session: SessionId,
        buffer: BufferId,
        /// Characters received since the previous flush
        delta: String,
        /// Lines the region occupies after the write
        lines: usize,
    },

    /// The session ended and released its buffer
    Finished {
        session: SessionId,
        buffer: BufferId,
        outcome: SessionOutcome,
        /// Everything received from the provider
        response: String,
    },
}

impl SessionEvent {
    pub fn session(&self) -> SessionId {
        match self {
            SessionEvent::Started { session, .. }
            | SessionEvent::Flushed { session, .. }
            | SessionEvent::Finished { session, .. } => *session,
        }
    }

    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Finished { .. })
    }
}
