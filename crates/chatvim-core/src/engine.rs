//! Session admission and the streaming reconciliation loop

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use chatvim_ai::{Error as AiError, StreamOptions};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::{
    error::{Error, Result},
    events::SessionEvent,
    host::{BufferId, EditEvent, EditorHost, HostDispatcher, NoticeLevel, Position},
    region::{Region, RegionCheck, WriteStep},
    session::{InterruptReason, SessionHandle, SessionOutcome, SessionState},
    transcript::{self, Conversation, TranscriptFormat},
    transport::{CompletionRequest, Transport},
};

/// What to do when a buffer already has a session streaming into it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionPolicy {
    /// Refuse the new request and tell the user
    #[default]
    Reject,
    /// Cancel the running session, then start the new one
    Replace,
}

/// When accumulated text is written into the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushPolicy {
    /// Characters to collect before writing a fragment without a line break
    pub min_chars: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self { min_chars: 20 }
    }
}

impl FlushPolicy {
    /// A fragment completing a line is always written; otherwise wait for
    /// `min_chars` unwritten characters.
    pub fn should_flush(&self, fragment: &str, pending_chars: usize) -> bool {
        fragment.contains('\n') || pending_chars >= self.min_chars
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Model used when the last user turn carries no tag
    pub model: String,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Sent as a system turn ahead of the conversation
    pub system_prompt: Option<String>,
    pub format: TranscriptFormat,
    pub flush: FlushPolicy,
    pub admission: AdmissionPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: None,
            temperature: None,
            system_prompt: None,
            format: TranscriptFormat::default(),
            flush: FlushPolicy::default(),
            admission: AdmissionPolicy::default(),
        }
    }
}

/// Everything needed to start one session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub conversation: Conversation,
    pub model: String,
    pub buffer: BufferId,
    /// The reply is inserted on the line after this one
    pub cursor_line: usize,
}

struct ActiveSession {
    handle: SessionHandle,
    region: Arc<Mutex<Region>>,
}

type Registry = Arc<Mutex<HashMap<BufferId, ActiveSession>>>;

/// Streams replies into editor buffers, at most one session per buffer
pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    dispatcher: HostDispatcher,
    sessions: Registry,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Engine {
    /// Create a new engine. Its sessions marshal every buffer access
    /// through `dispatcher`.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        dispatcher: HostDispatcher,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            transport,
            dispatcher,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle of the session streaming into `buffer`
    pub fn active_session(&self, buffer: BufferId) -> Option<SessionHandle> {
        self.sessions
            .lock()
            .get(&buffer)
            .map(|active| active.handle.clone())
    }

    pub fn state(&self, buffer: BufferId) -> SessionState {
        if self.sessions.lock().contains_key(&buffer) {
            SessionState::Streaming
        } else {
            SessionState::Idle
        }
    }

    /// Stop the session streaming into `buffer`. Returns false when there
    /// is none.
    pub fn interrupt(&self, buffer: BufferId) -> bool {
        match self.active_session(buffer) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Build the request for the conversation above the cursor of the
    /// focused window: parse, pick the model by tag, prepend the system
    /// prompt. `None` when there is nothing to send.
    pub fn request_at_cursor(&self, host: &dyn EditorHost) -> Result<Option<SessionRequest>> {
        let buffer = host.current_buffer();
        let cursor = host.cursor();
        let lines = host.get_lines(buffer, 0..cursor.line + 1)?;

        let conversation = transcript::parse(&self.config.format, &lines, lines.len());
        if conversation.is_empty() {
            tracing::debug!("Nothing to send above line {} of buffer {}", cursor.line, buffer);
            return Ok(None);
        }

        let model = conversation
            .model_tag
            .as_deref()
            .and_then(|tag| self.config.format.model_for_tag(tag))
            .unwrap_or(self.config.model.as_str())
            .to_string();
        let conversation = match &self.config.system_prompt {
            Some(prompt) => conversation.with_system_prompt(prompt),
            None => conversation,
        };

        Ok(Some(SessionRequest {
            conversation,
            model,
            buffer,
            cursor_line: cursor.line,
        }))
    }

    /// Respond to the conversation above the cursor of the focused window.
    ///
    /// Returns `Ok(None)` when there is nothing to send. Must run on the
    /// host's main loop.
    pub fn respond(&self, host: &mut dyn EditorHost) -> Result<Option<SessionHandle>> {
        match self.request_at_cursor(host)? {
            Some(request) => self.start_session(host, request).map(Some),
            None => Ok(None),
        }
    }

    /// Insert the assistant prefix line after `cursor_line` and start
    /// streaming the reply into it.
    ///
    /// Must run on the host's main loop, inside a tokio runtime; the region
    /// exists before this returns.
    pub fn start_session(
        &self,
        host: &mut dyn EditorHost,
        request: SessionRequest,
    ) -> Result<SessionHandle> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let SessionRequest {
            conversation,
            model,
            buffer,
            cursor_line,
        } = request;

        if conversation.is_empty() {
            return Err(Error::EmptyConversation);
        }
        if !host.is_loaded(buffer) {
            return Err(Error::BufferUnavailable(buffer));
        }

        let running = self.active_session(buffer);
        if let Some(running) = running {
            match self.config.admission {
                AdmissionPolicy::Reject => {
                    tracing::info!(
                        "Rejected request for buffer {}: session {} is streaming",
                        buffer,
                        running.id()
                    );
                    host.notify(
                        NoticeLevel::Warn,
                        "chatvim: a response is already streaming into this buffer",
                    );
                    return Err(Error::AdmissionConflict(buffer));
                }
                AdmissionPolicy::Replace => {
                    tracing::info!("Superseding session {} in buffer {}", running.id(), buffer);
                    running.interrupt(InterruptReason::Superseded);
                    self.sessions.lock().remove(&buffer);
                }
            }
        }

        let prefix = self.config.format.assistant_prefix.clone();
        let start = (cursor_line + 1).min(host.line_count(buffer)?);
        host.set_lines(buffer, start..start, vec![prefix.clone()])?;
        if let Err(e) = host.set_cursor(buffer, Position::new(start, prefix.len())) {
            tracing::debug!("Could not move cursor into the new region: {}", e);
        }
        let hooks = host.watch_buffer(buffer);

        let (handle, outcome_tx) = SessionHandle::new(buffer, model.as_str());
        let region = Arc::new(Mutex::new(Region::new(buffer, start, prefix)));
        self.sessions.lock().insert(
            buffer,
            ActiveSession {
                handle: handle.clone(),
                region: region.clone(),
            },
        );

        tracing::info!(
            "Session {} started in buffer {} at line {} with model {} ({} turns)",
            handle.id(),
            buffer,
            start,
            model,
            conversation.len()
        );
        let _ = self.event_tx.send(SessionEvent::Started {
            session: handle.id(),
            buffer,
            model: model.clone(),
            line: start,
        });

        let task = SessionTask {
            handle: handle.clone(),
            outcome_tx,
            request: CompletionRequest {
                model,
                messages: conversation.into_messages(),
                options: StreamOptions {
                    max_tokens: self.config.max_tokens,
                    temperature: self.config.temperature,
                },
            },
            region,
            hooks,
            format: self.config.format.clone(),
            flush: self.config.flush,
            transport: self.transport.clone(),
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            event_tx: self.event_tx.clone(),
        };
        runtime.spawn(task.run());

        Ok(handle)
    }

    /// Feed an edit hook reported by the host. Returns true when it
    /// interrupted a session. Must run on the host's main loop.
    pub fn handle_edit_event(
        &self,
        host: &dyn EditorHost,
        buffer: BufferId,
        event: EditEvent,
    ) -> bool {
        let (handle, region) = match self.sessions.lock().get(&buffer) {
            Some(active) => (active.handle.clone(), active.region.clone()),
            None => return false,
        };

        let reason = match event {
            EditEvent::InsertEnter if host.current_buffer() == buffer => {
                Some(InterruptReason::EditingMode)
            }
            EditEvent::InsertEnter => None,
            EditEvent::TextChanged => match region.lock().check(host) {
                RegionCheck::Interrupted(reason) => Some(reason),
                RegionCheck::Intact | RegionCheck::Gone => None,
            },
        };

        match reason {
            Some(reason) => {
                tracing::debug!("Session {} interrupted by {:?}", handle.id(), event);
                handle.interrupt(reason);
                true
            }
            None => false,
        }
    }
}

/// State owned by one session's background task
struct SessionTask {
    handle: SessionHandle,
    outcome_tx: watch::Sender<Option<SessionOutcome>>,
    request: CompletionRequest,
    region: Arc<Mutex<Region>>,
    hooks: bool,
    format: TranscriptFormat,
    flush: FlushPolicy,
    transport: Arc<dyn Transport>,
    dispatcher: HostDispatcher,
    sessions: Registry,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionTask {
    async fn run(self) {
        let outcome = self.stream().await;
        self.release(outcome).await;
    }

    fn interrupted(&self) -> SessionOutcome {
        SessionOutcome::Interrupted(
            self.handle
                .interrupt_reason()
                .unwrap_or(InterruptReason::Requested),
        )
    }

    /// Pull fragments until the stream ends or the session is stopped
    async fn stream(&self) -> SessionOutcome {
        let cancel = self.handle.cancel.clone();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.interrupted(),
            opened = self.transport.open(&self.request, cancel.clone()) => opened,
        };
        let mut fragments = match opened {
            Ok(fragments) => fragments,
            Err(AiError::Aborted) => return self.interrupted(),
            Err(e) => return SessionOutcome::Failed(e.to_string()),
        };

        let mut pending = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.interrupted(),
                next = fragments.next() => next,
            };
            let fragment = match next {
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => return SessionOutcome::Failed(e.to_string()),
                None => break,
            };
            if fragment.is_empty() {
                continue;
            }
            // in flight when the session was stopped
            if cancel.is_cancelled() {
                return self.interrupted();
            }

            self.handle.response.lock().push_str(&fragment);
            pending.push_str(&fragment);
            if self.flush.should_flush(&fragment, pending.chars().count()) {
                if let Err(outcome) = self.write(&pending, false).await {
                    return outcome;
                }
                pending.clear();
            }
        }
        drop(fragments);

        match self.write(&pending, true).await {
            Ok(()) => SessionOutcome::Completed,
            Err(outcome) => outcome,
        }
    }

    /// Write the whole response into the region on the main loop. The final
    /// write also appends a fresh user prompt after the region.
    async fn write(&self, delta: &str, finish: bool) -> std::result::Result<(), SessionOutcome> {
        let lines = transcript::render_region(&self.format, &self.handle.response());
        let prompt = finish.then(|| self.format.user_prompt.clone());
        let handle = self.handle.clone();
        let region = self.region.clone();

        let result = self
            .dispatcher
            .call(move |host| {
                if handle.cancel.is_cancelled() {
                    let reason = handle
                        .interrupt_reason()
                        .unwrap_or(InterruptReason::Requested);
                    return (WriteStep::Interrupted(reason), 0);
                }
                let mut region = region.lock();
                let step = region.write(host, lines);
                if step != WriteStep::Written {
                    return (step, region.occupied());
                }
                if let Some(prompt) = prompt {
                    let end = region.end();
                    let column = prompt.len();
                    if let Err(e) = host.set_lines(region.buffer, end..end, vec![prompt]) {
                        return (WriteStep::Failed(e.to_string()), region.occupied());
                    }
                    let _ = host.set_cursor(region.buffer, Position::new(end, column));
                }
                (WriteStep::Written, region.occupied())
            })
            .await;

        let (step, occupied) = match result {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!("Session {} lost the editor host: {}", self.handle.id(), e);
                return Err(SessionOutcome::BufferClosed);
            }
        };

        match step {
            WriteStep::Written => {
                tracing::debug!(
                    "Session {} flushed {} chars, region is {} lines",
                    self.handle.id(),
                    delta.len(),
                    occupied
                );
                let _ = self.event_tx.send(SessionEvent::Flushed {
                    session: self.handle.id(),
                    buffer: self.handle.buffer(),
                    delta: delta.to_string(),
                    lines: occupied,
                });
                Ok(())
            }
            WriteStep::Interrupted(reason) => {
                self.handle.interrupt(reason);
                Err(self.interrupted())
            }
            WriteStep::BufferClosed => Err(SessionOutcome::BufferClosed),
            WriteStep::Failed(message) => Err(SessionOutcome::Failed(message)),
        }
    }

    /// Drop the registry entry, stop hooks, report failures and publish the
    /// outcome. Runs for every session however it ended.
    async fn release(self, outcome: SessionOutcome) {
        let id = self.handle.id();
        let buffer = self.handle.buffer();
        {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(&buffer)
                .is_some_and(|active| active.handle.id() == id)
            {
                sessions.remove(&buffer);
            }
        }

        let notice = match &outcome {
            SessionOutcome::Failed(message) => Some(format!("chatvim: {}", message)),
            _ => None,
        };
        if self.hooks || notice.is_some() {
            let hooks = self.hooks;
            let sessions = self.sessions.clone();
            let released = self
                .dispatcher
                .call(move |host| {
                    if hooks && !sessions.lock().contains_key(&buffer) {
                        host.unwatch_buffer(buffer);
                    }
                    if let Some(notice) = notice {
                        host.notify(NoticeLevel::Error, &notice);
                    }
                })
                .await;
            if let Err(e) = released {
                tracing::debug!("Could not clean up session {} on the host: {}", id, e);
            }
        }

        let elapsed = (Utc::now() - self.handle.started_at()).num_milliseconds();
        match &outcome {
            SessionOutcome::Failed(message) => tracing::warn!(
                "Session {} in buffer {} failed after {}ms: {}",
                id,
                buffer,
                elapsed,
                message
            ),
            outcome => tracing::info!(
                "Session {} in buffer {} ended after {}ms: {:?}",
                id,
                buffer,
                elapsed,
                outcome
            ),
        }

        let _ = self.event_tx.send(SessionEvent::Finished {
            session: id,
            buffer,
            outcome: outcome.clone(),
            response: self.handle.response(),
        });
        self.outcome_tx.send_replace(Some(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chatvim_ai::{FragmentStream, Role};
    use futures::stream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_util::sync::CancellationToken;

    use crate::host::{self, EditorMode};
    use crate::memory::MemoryHost;

    type Fragment = chatvim_ai::Result<String>;

    /// A transport that replays scripted streams, one per request
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<chatvim_ai::Result<FragmentStream>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedTransport {
        fn push_fragments(&self, items: &[&str]) {
            let items: Vec<Fragment> = items.iter().map(|s| Ok(s.to_string())).collect();
            self.scripts
                .lock()
                .push_back(Ok(Box::pin(stream::iter(items))));
        }

        fn push_items(&self, items: Vec<Fragment>) {
            self.scripts
                .lock()
                .push_back(Ok(Box::pin(stream::iter(items))));
        }

        /// A stream fed by the test, open until the sender is dropped
        fn push_channel(&self) -> mpsc::UnboundedSender<Fragment> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts
                .lock()
                .push_back(Ok(Box::pin(UnboundedReceiverStream::new(rx))));
            tx
        }

        fn push_error(&self, error: AiError) {
            self.scripts.lock().push_back(Err(error));
        }

        fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(
            &self,
            request: &CompletionRequest,
            _cancel: CancellationToken,
        ) -> chatvim_ai::Result<FragmentStream> {
            self.requests.lock().push(request.clone());
            let next = self.scripts.lock().pop_front();
            next.unwrap_or_else(|| Ok(Box::pin(stream::empty())))
        }
    }

    struct Harness {
        host: Arc<Mutex<MemoryHost>>,
        engine: Engine,
        transport: Arc<ScriptedTransport>,
        buffer: BufferId,
        _main_loop: JoinHandle<()>,
    }

    impl Harness {
        fn new(buffer_lines: &[&str]) -> Self {
            Self::with(MemoryHost::new(), buffer_lines, EngineConfig::default())
        }

        fn with(mut host: MemoryHost, buffer_lines: &[&str], config: EngineConfig) -> Self {
            let buffer = host.open_buffer(lines(buffer_lines));
            let host = Arc::new(Mutex::new(host));
            let (dispatcher, mut main_loop) = host::channel();
            let transport = Arc::new(ScriptedTransport::default());
            let engine = Engine::new(config, transport.clone(), dispatcher);

            let loop_host = host.clone();
            let main_loop = tokio::spawn(async move {
                while let Some(job) = main_loop.next_job().await {
                    job(&mut *loop_host.lock());
                }
            });

            Self {
                host,
                engine,
                transport,
                buffer,
                _main_loop: main_loop,
            }
        }

        fn start(&self, cursor_line: usize) -> Result<SessionHandle> {
            let request = SessionRequest {
                conversation: Conversation {
                    turns: vec![chatvim_ai::Message::user("hi")],
                    model_tag: None,
                },
                model: "gpt-4o-mini".into(),
                buffer: self.buffer,
                cursor_line,
            };
            self.engine.start_session(&mut *self.host.lock(), request)
        }

        fn lines(&self) -> Vec<String> {
            self.host.lock().lines(self.buffer).unwrap_or_default().to_vec()
        }
    }

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    async fn next_flush(events: &mut broadcast::Receiver<SessionEvent>) -> String {
        loop {
            if let SessionEvent::Flushed { delta, .. } = events.recv().await.unwrap() {
                return delta;
            }
        }
    }

    #[test]
    fn test_flush_policy() {
        let policy = FlushPolicy::default();
        assert!(policy.should_flush("a\n", 2));
        assert!(!policy.should_flush("abc", 3));
        assert!(policy.should_flush("abc", 20));
    }

    #[test]
    fn test_start_without_runtime() {
        let (dispatcher, _main_loop) = host::channel();
        let engine = Engine::new(
            EngineConfig::default(),
            Arc::new(ScriptedTransport::default()),
            dispatcher,
        );
        let mut host = MemoryHost::new();
        let buffer = host.open_buffer(lines(&["> hi"]));
        let request = SessionRequest {
            conversation: Conversation {
                turns: vec![chatvim_ai::Message::user("hi")],
                model_tag: None,
            },
            model: "gpt-4".into(),
            buffer,
            cursor_line: 0,
        };
        assert!(matches!(
            engine.start_session(&mut host, request),
            Err(Error::NoRuntime)
        ));
        assert_eq!(host.lines(buffer).unwrap(), lines(&["> hi"]).as_slice());
    }

    #[tokio::test]
    async fn test_normal_completion() {
        let h = Harness::new(&["> hi"]);
        h.transport.push_fragments(&["Hel", "lo"]);

        let handle = h.start(0).unwrap();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);

        assert_eq!(h.lines(), lines(&["> hi", "LLM: Hello", "> "]));
        assert_eq!(h.host.lock().cursor(), Position::new(2, 2));
        assert_eq!(handle.response(), "Hello");
        assert_eq!(h.engine.state(h.buffer), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_region_is_inserted_before_streaming() {
        let h = Harness::new(&["> hi", "trailing"]);
        let _tx = h.transport.push_channel();

        let handle = h.start(0).unwrap();
        assert_eq!(h.lines(), lines(&["> hi", "LLM: ", "trailing"]));
        assert_eq!(h.host.lock().cursor(), Position::new(1, 5));
        assert!(handle.is_running());
        assert_eq!(h.engine.state(h.buffer), SessionState::Streaming);
    }

    #[tokio::test]
    async fn test_multiline_reply_round_trips() {
        let h = Harness::new(&["> hi"]);
        h.transport.push_fragments(&["Hello\nwor", "ld", "\n\nbye"]);

        let handle = h.start(0).unwrap();
        assert_eq!(handle.wait().await, SessionOutcome::Completed);

        let buffer = h.lines();
        assert_eq!(
            buffer,
            lines(&["> hi", "LLM: Hello", "world", "", "bye", "> "])
        );
        let reparsed = transcript::parse(&TranscriptFormat::default(), &buffer, buffer.len() - 1);
        let last = reparsed.turns.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, handle.response());
    }

    #[tokio::test]
    async fn test_newline_flushes_immediately() {
        let h = Harness::new(&["> hi"]);
        let tx = h.transport.push_channel();
        let mut events = h.engine.subscribe();
        let handle = h.start(0).unwrap();

        tx.send(Ok("short\n".into())).unwrap();
        assert_eq!(next_flush(&mut events).await, "short\n");
        assert_eq!(h.lines(), lines(&["> hi", "LLM: short", ""]));

        drop(tx);
        assert_eq!(handle.wait().await, SessionOutcome::Completed);
        assert_eq!(h.lines(), lines(&["> hi", "LLM: short", "", "> "]));
    }

    #[tokio::test]
    async fn test_small_fragments_are_batched() {
        let h = Harness::new(&["> hi"]);
        let tx = h.transport.push_channel();
        let mut events = h.engine.subscribe();
        let _handle = h.start(0).unwrap();

        for piece in ["0123456789", "0123456789"] {
            tx.send(Ok(piece.into())).unwrap();
        }
        assert_eq!(next_flush(&mut events).await, "01234567890123456789");
    }

    #[tokio::test]
    async fn test_region_edit_stops_writes() {
        let h = Harness::new(&["> hi"]);
        let tx = h.transport.push_channel();
        let mut events = h.engine.subscribe();
        let handle = h.start(0).unwrap();

        tx.send(Ok("Hel\n".into())).unwrap();
        next_flush(&mut events).await;

        h.host.lock().lines_mut(h.buffer).unwrap()[1] = "LLM: Hel, my edit".into();
        tx.send(Ok("lo\n".into())).unwrap();
        drop(tx);

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Interrupted(InterruptReason::RegionEdited)
        );
        assert_eq!(h.lines(), lines(&["> hi", "LLM: Hel, my edit", ""]));
    }

    #[tokio::test]
    async fn test_insert_mode_stops_writes() {
        let h = Harness::new(&["> hi"]);
        let tx = h.transport.push_channel();
        let handle = h.start(0).unwrap();

        h.host.lock().set_mode(EditorMode::Insert);
        tx.send(Ok("Hello\n".into())).unwrap();

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Interrupted(InterruptReason::EditingMode)
        );
        assert_eq!(h.lines(), lines(&["> hi", "LLM: "]));
    }

    #[tokio::test]
    async fn test_reject_second_session() {
        let h = Harness::new(&["> hi"]);
        let _tx = h.transport.push_channel();
        let first = h.start(0).unwrap();

        let second = h.start(0);
        assert!(matches!(second, Err(Error::AdmissionConflict(b)) if b == h.buffer));
        assert!(first.is_running());
        assert_eq!(h.lines(), lines(&["> hi", "LLM: "]));

        let host = h.host.lock();
        let notice = host.notices().last().unwrap();
        assert_eq!(notice.level, NoticeLevel::Warn);
        assert!(notice.message.contains("already streaming"));
    }

    #[tokio::test]
    async fn test_replace_supersedes_running_session() {
        let config = EngineConfig {
            admission: AdmissionPolicy::Replace,
            ..EngineConfig::default()
        };
        let h = Harness::with(MemoryHost::new(), &["> hi"], config);
        let first_tx = h.transport.push_channel();
        let mut events = h.engine.subscribe();

        let first = h.start(0).unwrap();
        first_tx.send(Ok("one\n".into())).unwrap();
        next_flush(&mut events).await;

        h.transport.push_fragments(&["second"]);
        let second = h.start(0).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(h.engine.active_session(h.buffer).unwrap().id(), second.id());
        first_tx.send(Ok("stale\n".into())).unwrap();

        assert_eq!(
            first.wait().await,
            SessionOutcome::Interrupted(InterruptReason::Superseded)
        );
        assert_eq!(second.wait().await, SessionOutcome::Completed);

        assert_eq!(
            h.lines(),
            lines(&["> hi", "LLM: second", "> ", "LLM: one", ""])
        );
        assert!(h.engine.active_session(h.buffer).is_none());
    }

    #[tokio::test]
    async fn test_abort_leaves_buffer_alone() {
        let h = Harness::new(&["> hi"]);
        let tx = h.transport.push_channel();
        let mut events = h.engine.subscribe();
        let handle = h.start(0).unwrap();

        tx.send(Ok("partial\n".into())).unwrap();
        next_flush(&mut events).await;
        assert!(h.engine.interrupt(h.buffer));
        tx.send(Ok("more\n".into())).ok();

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Interrupted(InterruptReason::Requested)
        );
        assert_eq!(h.lines(), lines(&["> hi", "LLM: partial", ""]));
        assert!(!h.engine.interrupt(h.buffer));
    }

    #[tokio::test]
    async fn test_stream_failure_notifies() {
        let h = Harness::new(&["> hi"]);
        h.transport.push_items(vec![
            Ok("partial\n".into()),
            Err(AiError::api("server_error", "boom")),
        ]);

        let handle = h.start(0).unwrap();
        let outcome = handle.wait().await;
        assert!(matches!(&outcome, SessionOutcome::Failed(m) if m.contains("boom")));

        assert_eq!(h.lines(), lines(&["> hi", "LLM: partial", ""]));
        let host = h.host.lock();
        let notice = host.notices().last().unwrap();
        assert_eq!(notice.level, NoticeLevel::Error);
        assert!(notice.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_open_failure_notifies() {
        let h = Harness::new(&["> hi"]);
        h.transport.push_error(AiError::InvalidApiKey);

        let handle = h.start(0).unwrap();
        assert!(matches!(handle.wait().await, SessionOutcome::Failed(_)));
        assert_eq!(h.lines(), lines(&["> hi", "LLM: "]));
        assert_eq!(h.host.lock().notices().len(), 1);
    }

    #[tokio::test]
    async fn test_buffer_closed_mid_stream() {
        let h = Harness::new(&["> hi"]);
        let tx = h.transport.push_channel();
        let handle = h.start(0).unwrap();

        h.host.lock().close_buffer(h.buffer);
        tx.send(Ok("late\n".into())).unwrap();

        assert_eq!(handle.wait().await, SessionOutcome::BufferClosed);
        assert!(h.engine.active_session(h.buffer).is_none());
    }

    #[tokio::test]
    async fn test_edit_hooks_interrupt_without_fragments() {
        let h = Harness::with(MemoryHost::new().with_hooks(), &["> hi"], EngineConfig::default());
        let _tx = h.transport.push_channel();
        let handle = h.start(0).unwrap();
        assert!(h.host.lock().is_watched(h.buffer));

        {
            let host = h.host.lock();
            assert!(!h.engine.handle_edit_event(&*host, h.buffer, EditEvent::TextChanged));
        }
        {
            let mut host = h.host.lock();
            host.lines_mut(h.buffer).unwrap()[1] = "LLM: typed".into();
            assert!(h.engine.handle_edit_event(&*host, h.buffer, EditEvent::TextChanged));
        }

        assert_eq!(
            handle.wait().await,
            SessionOutcome::Interrupted(InterruptReason::RegionEdited)
        );
        assert!(!h.host.lock().is_watched(h.buffer));
    }

    #[tokio::test]
    async fn test_insert_enter_hook() {
        let h = Harness::with(MemoryHost::new().with_hooks(), &["> hi"], EngineConfig::default());
        let _tx = h.transport.push_channel();
        let handle = h.start(0).unwrap();

        assert!(h.engine.handle_edit_event(&*h.host.lock(), h.buffer, EditEvent::InsertEnter));
        assert_eq!(
            handle.wait().await,
            SessionOutcome::Interrupted(InterruptReason::EditingMode)
        );
    }

    #[tokio::test]
    async fn test_respond_parses_above_cursor() {
        let config = EngineConfig {
            system_prompt: Some("Be brief.".into()),
            ..EngineConfig::default()
        };
        let h = Harness::with(
            MemoryHost::new(),
            &["# notes", "> first", "LLM: answer", "4> second", "more", "> below cursor"],
            config,
        );
        h.host.lock().place_cursor(Position::new(4, 0));
        h.transport.push_fragments(&["ok"]);

        let handle = h.engine.respond(&mut *h.host.lock()).unwrap().unwrap();
        assert_eq!(handle.model(), "gpt-4");
        assert_eq!(handle.wait().await, SessionOutcome::Completed);

        let request = &h.transport.requests()[0];
        assert_eq!(request.model, "gpt-4");
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert_eq!(request.messages[3].content, "second\nmore");

        assert_eq!(
            h.lines(),
            lines(&[
                "# notes",
                "> first",
                "LLM: answer",
                "4> second",
                "more",
                "LLM: ok",
                "> ",
                "> below cursor"
            ])
        );
    }

    #[tokio::test]
    async fn test_request_at_cursor_uses_default_model() {
        let h = Harness::new(&["4> old question", "LLM: old answer", ">> fresh start", "go on"]);
        h.host.lock().place_cursor(Position::new(3, 0));

        let request = h.engine.request_at_cursor(&*h.host.lock()).unwrap().unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.cursor_line, 3);
        assert_eq!(
            request.conversation.turns,
            vec![chatvim_ai::Message::user("fresh start\ngo on")]
        );
        assert!(h.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_respond_with_nothing_to_send() {
        let h = Harness::new(&["# just a comment", "stray text"]);
        h.host.lock().place_cursor(Position::new(1, 0));
        assert!(h.engine.respond(&mut *h.host.lock()).unwrap().is_none());
        assert!(h.transport.requests().is_empty());
        assert_eq!(h.lines(), lines(&["# just a comment", "stray text"]));
    }

    #[tokio::test]
    async fn test_events_bracket_session() {
        let h = Harness::new(&["> hi"]);
        h.transport.push_fragments(&["done\n"]);
        let mut events = h.engine.subscribe();

        let handle = h.start(0).unwrap();
        handle.wait().await;

        let started = events.recv().await.unwrap();
        assert!(matches!(started, SessionEvent::Started { line: 1, .. }));
        let mut last = started;
        while let Ok(event) = events.try_recv() {
            last = event;
        }
        assert!(last.is_terminal());
        assert_eq!(last.session(), handle.id());
    }
}
