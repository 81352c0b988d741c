//! An in-memory editor host.
//!
//! Backs the command-line host and the engine tests; an editor embedding
//! implements [`EditorHost`] over its own buffers instead.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::error::{Error, Result};
use crate::host::{BufferId, EditorHost, EditorMode, NoticeLevel, Position};

/// A notice shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Buffers held as line vectors, with a single focused window
#[derive(Debug, Default)]
pub struct MemoryHost {
    buffers: BTreeMap<BufferId, Vec<String>>,
    current: Option<BufferId>,
    cursor: Position,
    mode: EditorMode,
    notices: Vec<Notice>,
    hooks_supported: bool,
    watched: BTreeSet<BufferId>,
    next_id: u64,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report edit hooks to the engine (off by default)
    pub fn with_hooks(mut self) -> Self {
        self.hooks_supported = true;
        self
    }

    /// Open a buffer and focus it, cursor on its first line
    pub fn open_buffer(&mut self, lines: Vec<String>) -> BufferId {
        self.next_id += 1;
        let id = BufferId(self.next_id);
        self.buffers.insert(id, lines);
        self.current = Some(id);
        self.cursor = Position::default();
        id
    }

    /// Close a buffer, dropping its contents
    pub fn close_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.watched.remove(&buffer);
        if self.current == Some(buffer) {
            self.current = self.buffers.keys().next().copied();
            self.cursor = Position::default();
        }
    }

    pub fn set_mode(&mut self, mode: EditorMode) {
        self.mode = mode;
    }

    /// Move the cursor of the focused window without validation
    pub fn place_cursor(&mut self, position: Position) {
        self.cursor = position;
    }

    pub fn lines(&self, buffer: BufferId) -> Option<&[String]> {
        self.buffers.get(&buffer).map(Vec::as_slice)
    }

    /// Direct access for edits that bypass the engine (what a user types)
    pub fn lines_mut(&mut self, buffer: BufferId) -> Option<&mut Vec<String>> {
        self.buffers.get_mut(&buffer)
    }

    /// Replace a whole buffer's contents
    pub fn replace_all(&mut self, buffer: BufferId, lines: Vec<String>) -> Result<()> {
        let slot = self
            .buffers
            .get_mut(&buffer)
            .ok_or(Error::BufferUnavailable(buffer))?;
        *slot = lines;
        Ok(())
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn is_watched(&self, buffer: BufferId) -> bool {
        self.watched.contains(&buffer)
    }

    fn buffer(&self, buffer: BufferId) -> Result<&Vec<String>> {
        self.buffers
            .get(&buffer)
            .ok_or(Error::BufferUnavailable(buffer))
    }
}

impl EditorHost for MemoryHost {
    fn is_loaded(&self, buffer: BufferId) -> bool {
        self.buffers.contains_key(&buffer)
    }

    fn line_count(&self, buffer: BufferId) -> Result<usize> {
        Ok(self.buffer(buffer)?.len())
    }

    fn get_lines(&self, buffer: BufferId, range: Range<usize>) -> Result<Vec<String>> {
        let lines = self.buffer(buffer)?;
        let end = range.end.min(lines.len());
        let start = range.start.min(end);
        Ok(lines[start..end].to_vec())
    }

    fn set_lines(
        &mut self,
        buffer: BufferId,
        range: Range<usize>,
        replacement: Vec<String>,
    ) -> Result<()> {
        let lines = self
            .buffers
            .get_mut(&buffer)
            .ok_or(Error::BufferUnavailable(buffer))?;
        if range.start > lines.len() || range.start > range.end {
            return Err(Error::host(format!(
                "line range {}..{} out of bounds for buffer {} with {} lines",
                range.start,
                range.end,
                buffer,
                lines.len()
            )));
        }
        let end = range.end.min(lines.len());
        lines.splice(range.start..end, replacement);
        Ok(())
    }

    fn current_buffer(&self) -> BufferId {
        self.current.unwrap_or(BufferId(0))
    }

    fn cursor(&self) -> Position {
        self.cursor
    }

    fn set_cursor(&mut self, buffer: BufferId, position: Position) -> Result<()> {
        if self.current != Some(buffer) {
            return Ok(());
        }
        let lines = self.buffer(buffer)?;
        if position.line >= lines.len().max(1) {
            return Err(Error::host(format!(
                "cursor line {} past end of buffer {}",
                position.line, buffer
            )));
        }
        self.cursor = position;
        Ok(())
    }

    fn mode(&self) -> EditorMode {
        self.mode
    }

    fn notify(&mut self, level: NoticeLevel, message: &str) {
        self.notices.push(Notice {
            level,
            message: message.to_string(),
        });
    }

    fn watch_buffer(&mut self, buffer: BufferId) -> bool {
        if self.hooks_supported && self.buffers.contains_key(&buffer) {
            self.watched.insert(buffer);
            true
        } else {
            false
        }
    }

    fn unwatch_buffer(&mut self, buffer: BufferId) {
        self.watched.remove(&buffer);
    }
}
