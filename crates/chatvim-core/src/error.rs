//! Error types for chatvim-core

use thiserror::Error;

use crate::host::BufferId;

/// Result type alias using chatvim-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dispatching a response
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the provider layer
    #[error(transparent)]
    Ai(#[from] chatvim_ai::Error),

    /// A response is already streaming into this buffer
    #[error("a response is already streaming into buffer {0}")]
    AdmissionConflict(BufferId),

    /// The conversation above the cursor has no turns
    #[error("nothing to send")]
    EmptyConversation,

    /// The target buffer is closed or unloaded
    #[error("buffer {0} is not loaded")]
    BufferUnavailable(BufferId),

    /// The editor's main loop is gone
    #[error("editor host is unavailable")]
    HostUnavailable,

    /// The host rejected an operation
    #[error("host error: {0}")]
    Host(String),

    /// Sessions need a tokio runtime to stream on
    #[error("no async runtime available to stream the response")]
    NoRuntime,
}

impl Error {
    /// Create a host error from any message
    pub fn host(message: impl Into<String>) -> Self {
        Self::Host(message.into())
    }
}
