//! The editor host interface and main-loop marshaling.
//!
//! The editor owns its buffers and mutates them from a single main loop.
//! Streaming sessions run on background tasks and never touch the host
//! directly: every read or write is packaged as a [`HostJob`], sent through
//! a [`HostDispatcher`], and executed by whoever drains the [`MainLoop`].

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

/// Host-assigned buffer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cursor position, 0-based line and column (byte offset).
///
/// Hosts with 1-based rows convert at their boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// Editing mode of the focused window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorMode {
    #[default]
    Normal,
    Insert,
    Replace,
    Visual,
    CommandLine,
}

impl EditorMode {
    /// Modes in which keystrokes go straight into the buffer text
    pub fn is_text_entry(&self) -> bool {
        matches!(self, EditorMode::Insert | EditorMode::Replace)
    }
}

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// Edit hooks a host reports for watched buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditEvent {
    /// The user entered insert or replace mode
    InsertEnter,
    /// The buffer text changed (by anyone, including the engine)
    TextChanged,
}

/// Buffer, cursor and notice operations the engine needs from an editor.
///
/// Implementations are only ever called from the host's own main loop.
pub trait EditorHost {
    /// Whether `buffer` is still open
    fn is_loaded(&self, buffer: BufferId) -> bool;

    /// Number of lines in `buffer`
    fn line_count(&self, buffer: BufferId) -> Result<usize>;

    /// Lines in `range`, clamped to the end of the buffer
    fn get_lines(&self, buffer: BufferId, range: Range<usize>) -> Result<Vec<String>>;

    /// Replace the lines in `range` with `lines` as one change. An empty
    /// range inserts before `range.start`.
    fn set_lines(&mut self, buffer: BufferId, range: Range<usize>, lines: Vec<String>)
    -> Result<()>;

    /// Buffer shown in the focused window
    fn current_buffer(&self) -> BufferId;

    /// Cursor of the focused window
    fn cursor(&self) -> Position;

    /// Move the cursor, if `buffer` is shown in the focused window
    fn set_cursor(&mut self, buffer: BufferId, position: Position) -> Result<()>;

    /// Mode of the focused window
    fn mode(&self) -> EditorMode;

    /// Show a non-blocking message to the user
    fn notify(&mut self, level: NoticeLevel, message: &str);

    /// Start reporting [`EditEvent`]s for `buffer`. Returns false when the
    /// host has no edit hooks; the engine then relies on content checks.
    fn watch_buffer(&mut self, _buffer: BufferId) -> bool {
        false
    }

    /// Stop reporting edit events for `buffer`
    fn unwatch_buffer(&mut self, _buffer: BufferId) {}
}

/// A unit of work to run on the host's main loop
pub type HostJob = Box<dyn FnOnce(&mut dyn EditorHost) + Send>;

/// Create a connected dispatcher / main loop pair
pub fn channel() -> (HostDispatcher, MainLoop) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HostDispatcher { tx }, MainLoop { rx })
}

/// Sends jobs to the main loop. Cheap to clone.
#[derive(Clone)]
pub struct HostDispatcher {
    tx: mpsc::UnboundedSender<HostJob>,
}

impl HostDispatcher {
    /// Queue a job without waiting for it to run. Jobs run in the order
    /// they were posted.
    pub fn post(&self, job: impl FnOnce(&mut dyn EditorHost) + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(job))
            .map_err(|_| Error::HostUnavailable)
    }

    /// Run `f` on the main loop and wait for its result
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn EditorHost) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move |host| {
            let _ = reply_tx.send(f(host));
        })?;
        reply_rx.await.map_err(|_| Error::HostUnavailable)
    }

    /// Whether the main loop has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving end of the job queue, drained by the host
pub struct MainLoop {
    rx: mpsc::UnboundedReceiver<HostJob>,
}

impl MainLoop {
    /// Wait for the next job. `None` once every dispatcher is dropped.
    pub async fn next_job(&mut self) -> Option<HostJob> {
        self.rx.recv().await
    }

    /// Run every job that is already queued, returning how many ran
    pub fn run_pending(&mut self, host: &mut dyn EditorHost) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job(&mut *host);
            ran += 1;
        }
        ran
    }
}
