//! chatvim-core: chat transcripts in a plain text buffer
//!
//! This crate provides the transcript parser that turns buffer lines into a
//! conversation, and the engine that streams a model's reply back into the
//! buffer while the user keeps editing it.

pub mod engine;
pub mod error;
pub mod events;
pub mod host;
pub mod memory;
pub mod region;
pub mod session;
pub mod transcript;
pub mod transport;

pub use engine::{AdmissionPolicy, Engine, EngineConfig, FlushPolicy, SessionRequest};
pub use error::{Error, Result};
pub use events::SessionEvent;
pub use host::{
    BufferId, EditEvent, EditorHost, EditorMode, HostDispatcher, HostJob, MainLoop, NoticeLevel,
    Position,
};
pub use memory::MemoryHost;
pub use session::{InterruptReason, SessionHandle, SessionId, SessionOutcome, SessionState};
pub use transcript::{Conversation, ConversationTurn, TranscriptFormat};
pub use transport::{CompletionRequest, ProviderTransport, RetryConfig, Transport};
