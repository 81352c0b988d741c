//! An editor host backed by a file on disk.
//!
//! The file is the buffer. It is re-read before every marshaled job so
//! changes made by another program (an editor with the file open, say) are
//! seen the same way a user's keystrokes would be, and written back after
//! every change the engine makes.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chatvim_core::{
    BufferId, EditorHost, EditorMode, Error, MemoryHost, NoticeLevel, Position, Result,
};

pub struct FileHost {
    path: PathBuf,
    inner: MemoryHost,
    buffer: BufferId,
    trailing_newline: bool,
}

impl FileHost {
    /// Load `path` as the focused buffer
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let content =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let (lines, trailing_newline) = split_lines(&content);
        let mut inner = MemoryHost::new();
        let buffer = inner.open_buffer(lines);
        Ok(Self {
            path,
            inner,
            buffer,
            trailing_newline,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Current lines, empty once the file is gone
    pub fn lines(&self) -> &[String] {
        self.inner.lines(self.buffer).unwrap_or_default()
    }

    /// Put the cursor on `line` (0-based), clamped to the last line
    pub fn place_cursor(&mut self, line: usize) {
        let last = self.lines().len().saturating_sub(1);
        self.inner.place_cursor(Position::new(line.min(last), 0));
    }

    /// Pick up changes made to the file since the last read. A deleted file
    /// closes the buffer.
    pub fn sync(&mut self) {
        if !self.inner.is_loaded(self.buffer) {
            return;
        }
        match fs::read_to_string(&self.path) {
            Ok(content) => {
                let (lines, trailing_newline) = split_lines(&content);
                self.trailing_newline = trailing_newline;
                if lines != self.lines() {
                    tracing::debug!("{} changed on disk", self.path.display());
                    let _ = self.inner.replace_all(self.buffer, lines);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!("{} was removed", self.path.display());
                self.inner.close_buffer(self.buffer);
            }
            Err(e) => tracing::warn!("Failed to re-read {}: {}", self.path.display(), e),
        }
    }

    fn persist(&mut self) -> Result<()> {
        // An empty last line only survives a reload if it is terminated
        if self.lines().last().is_some_and(|line| line.is_empty()) {
            self.trailing_newline = true;
        }
        let mut content = self.lines().join("\n");
        if self.trailing_newline && !content.is_empty() {
            content.push('\n');
        }
        fs::write(&self.path, content)
            .map_err(|e| Error::host(format!("writing {}: {}", self.path.display(), e)))
    }
}

/// Split file content into lines, reporting whether the last one was
/// terminated. Only a single `\n` is taken as the terminator, so a file
/// ending in a blank line keeps it.
fn split_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (Vec::new(), true);
    }
    let (body, terminated) = match content.strip_suffix('\n') {
        Some(body) => (body, true),
        None => (content, false),
    };
    let lines = body
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    (lines, terminated)
}

impl EditorHost for FileHost {
    fn is_loaded(&self, buffer: BufferId) -> bool {
        self.inner.is_loaded(buffer)
    }

    fn line_count(&self, buffer: BufferId) -> Result<usize> {
        self.inner.line_count(buffer)
    }

    fn get_lines(&self, buffer: BufferId, range: Range<usize>) -> Result<Vec<String>> {
        self.inner.get_lines(buffer, range)
    }

    fn set_lines(
        &mut self,
        buffer: BufferId,
        range: Range<usize>,
        lines: Vec<String>,
    ) -> Result<()> {
        self.inner.set_lines(buffer, range, lines)?;
        self.persist()
    }

    fn current_buffer(&self) -> BufferId {
        self.inner.current_buffer()
    }

    fn cursor(&self) -> Position {
        self.inner.cursor()
    }

    fn set_cursor(&mut self, buffer: BufferId, position: Position) -> Result<()> {
        self.inner.set_cursor(buffer, position)
    }

    fn mode(&self) -> EditorMode {
        EditorMode::Normal
    }

    fn notify(&mut self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => eprintln!("{}", message),
            NoticeLevel::Warn => eprintln!("warning: {}", message),
            NoticeLevel::Error => eprintln!("error: {}", message),
        }
        self.inner.notify(level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chatvim_ai::FragmentStream;
    use chatvim_core::{CompletionRequest, Engine, EngineConfig, SessionOutcome, Transport};
    use futures::stream;
    use tokio_util::sync::CancellationToken;

    /// Answers every request with the same fragments
    struct FixedReply(Vec<&'static str>);

    #[async_trait]
    impl Transport for FixedReply {
        async fn open(
            &self,
            _request: &CompletionRequest,
            _cancel: CancellationToken,
        ) -> chatvim_ai::Result<FragmentStream> {
            let fragments: Vec<chatvim_ai::Result<String>> =
                self.0.iter().map(|s| Ok(s.to_string())).collect();
            Ok(Box::pin(stream::iter(fragments)))
        }
    }

    fn scratch_file(content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("chatvim-{}.chat", uuid::Uuid::new_v4()));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_writes_through() {
        let path = scratch_file("> hi\n");
        let mut host = FileHost::open(&path).unwrap();
        let buffer = host.buffer();

        host.set_lines(buffer, 1..1, vec!["LLM: hello".into(), "> ".into()])
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "> hi\nLLM: hello\n> \n");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_keeps_missing_trailing_newline() {
        let path = scratch_file("> hi");
        let mut host = FileHost::open(&path).unwrap();
        let buffer = host.buffer();

        host.set_lines(buffer, 1..1, vec!["LLM: x".into()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "> hi\nLLM: x");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_sync_sees_outside_edits() {
        let path = scratch_file("> hi\nLLM: \n");
        let mut host = FileHost::open(&path).unwrap();

        fs::write(&path, "> hi\nLLM: mine\n").unwrap();
        host.sync();
        assert_eq!(host.lines(), &["> hi".to_string(), "LLM: mine".to_string()]);

        fs::remove_file(&path).unwrap();
        host.sync();
        assert!(!host.is_loaded(host.buffer()));
        assert!(host.lines().is_empty());
    }

    #[test]
    fn test_place_cursor_clamps() {
        let path = scratch_file("a\nb\n");
        let mut host = FileHost::open(&path).unwrap();
        host.place_cursor(10);
        assert_eq!(host.cursor(), Position::new(1, 0));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_blank_last_line_survives_reload() {
        let path = scratch_file("> hi");
        let mut host = FileHost::open(&path).unwrap();
        let buffer = host.buffer();

        host.set_lines(buffer, 1..1, vec!["LLM: Hello".into(), "".into()])
            .unwrap();
        host.sync();
        assert_eq!(
            host.lines(),
            &["> hi".to_string(), "LLM: Hello".to_string(), String::new()]
        );

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_split_lines() {
        assert_eq!(split_lines(""), (vec![], true));
        assert_eq!(split_lines("a"), (vec!["a".to_string()], false));
        assert_eq!(split_lines("a\r\nb\n"), (vec!["a".to_string(), "b".to_string()], true));
        assert_eq!(split_lines("a\n\n"), (vec!["a".to_string(), String::new()], true));
    }

    #[tokio::test]
    async fn test_reply_streams_into_unterminated_file() {
        let path = scratch_file("> hi");
        let mut host = FileHost::open(&path).unwrap();
        host.place_cursor(0);

        let (dispatcher, main_loop) = chatvim_core::host::channel();
        let transport = Arc::new(FixedReply(vec!["Hello\n", "world"]));
        let engine = Engine::new(EngineConfig::default(), transport, dispatcher);
        let handle = engine.respond(&mut host).unwrap().unwrap();

        let mut echoed = Vec::new();
        let outcome = crate::drive(&mut host, main_loop, &engine, handle, &mut echoed).await;
        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(String::from_utf8(echoed).unwrap(), "Hello\nworld\n");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "> hi\nLLM: Hello\nworld\n> \n"
        );

        fs::remove_file(&path).unwrap();
    }
}
