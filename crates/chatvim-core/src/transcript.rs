//! Transcript parsing: buffer lines to conversation turns and back.
//!
//! A transcript is plain text with line-prefix conventions:
//!
//! ```text
//! # comments start with `#` or `//`
//! > a user turn
//! continuation lines belong to the turn above
//! LLM: an assistant turn
//! >> a reset marker; history above it is not sent
//! 4> a user turn that asks for the model tagged "4"
//! ```
//!
//! A line starting with `>>>` (an interactive-session prompt pasted into the
//! chat) is ordinary text, never a marker.

use std::collections::BTreeMap;

use chatvim_ai::{Message, Role};
use serde::{Deserialize, Serialize};

/// One message of the conversation, attributed to user, assistant or system
pub type ConversationTurn = Message;

const USER_MARKER: char = '>';
const RESET_MARKER: &str = ">>";
const SESSION_PROMPT: &str = ">>>";
const COMMENT_MARKERS: &[&str] = &["//", "#"];

/// Line-prefix conventions of a transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptFormat {
    /// Written at the start of every assistant turn. Parsing accepts it with
    /// or without its trailing whitespace.
    pub assistant_prefix: String,
    /// Written on the fresh line after a completed reply
    pub user_prompt: String,
    /// Tag prefixes for user lines (`4> ...`) mapped to the model they select
    pub model_tags: BTreeMap<String, String>,
}

impl Default for TranscriptFormat {
    fn default() -> Self {
        Self {
            assistant_prefix: "LLM: ".to_string(),
            user_prompt: "> ".to_string(),
            model_tags: BTreeMap::from([
                ("3".to_string(), "gpt-3.5-turbo".to_string()),
                ("4".to_string(), "gpt-4".to_string()),
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind<'a> {
    Comment,
    Assistant(&'a str),
    User {
        content: &'a str,
        reset: bool,
        tag: Option<&'a str>,
    },
    Text(&'a str),
}

impl TranscriptFormat {
    fn classify<'a>(&'a self, line: &'a str) -> LineKind<'a> {
        if COMMENT_MARKERS.iter().any(|m| line.starts_with(m)) {
            return LineKind::Comment;
        }

        let assistant = self.assistant_prefix.trim_end();
        if !assistant.is_empty() {
            if let Some(rest) = line.strip_prefix(assistant) {
                return LineKind::Assistant(rest.trim());
            }
        }

        let (tag, rest) = self.split_tag(line);
        if rest.starts_with(SESSION_PROMPT) || !rest.starts_with(USER_MARKER) {
            return LineKind::Text(line);
        }
        LineKind::User {
            content: rest.trim_start_matches(USER_MARKER).trim(),
            reset: rest.starts_with(RESET_MARKER),
            tag,
        }
    }

    /// Split a model tag off a user line. Longer tags win so `35>` is not
    /// read as tag `3` followed by text.
    fn split_tag<'a>(&'a self, line: &'a str) -> (Option<&'a str>, &'a str) {
        let mut tags: Vec<&str> = self
            .model_tags
            .keys()
            .map(String::as_str)
            .filter(|t| !t.is_empty())
            .collect();
        tags.sort_by_key(|t| std::cmp::Reverse(t.len()));

        for tag in tags {
            if let Some(rest) = line.strip_prefix(tag) {
                if rest.starts_with(USER_MARKER) {
                    return (Some(tag), rest);
                }
            }
        }
        (None, line)
    }

    /// Whether `line` discards all history above it
    pub fn is_reset_marker(&self, line: &str) -> bool {
        matches!(self.classify(line), LineKind::User { reset: true, .. })
    }

    /// Model selected by a tag, if the tag is known
    pub fn model_for_tag(&self, tag: &str) -> Option<&str> {
        self.model_tags.get(tag).map(String::as_str)
    }
}

/// The turns sent to the model for one request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    pub turns: Vec<ConversationTurn>,
    /// Tag of the last user turn, when it carried one
    pub model_tag: Option<String>,
}

impl Conversation {
    /// True when there is nothing to send
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Put a system turn in front of the conversation. Blank prompts are ignored.
    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        if !prompt.trim().is_empty() {
            self.turns.insert(0, Message::new(Role::System, prompt));
        }
        self
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.turns
    }
}

/// Parse the lines before `end` (exclusive) into a conversation.
///
/// History starts at the last reset marker before `end`, or at the top of
/// the buffer when there is none.
pub fn parse<S: AsRef<str>>(format: &TranscriptFormat, lines: &[S], end: usize) -> Conversation {
    let prefix = &lines[..end.min(lines.len())];
    let start = prefix
        .iter()
        .rposition(|line| format.is_reset_marker(line.as_ref()))
        .unwrap_or(0);

    let mut conversation = Conversation::default();
    for line in &prefix[start..] {
        match format.classify(line.as_ref()) {
            LineKind::Comment => {}
            LineKind::Assistant(content) => {
                conversation.turns.push(Message::assistant(content));
            }
            LineKind::User { content, tag, .. } => {
                conversation.turns.push(Message::user(content));
                conversation.model_tag = tag.map(str::to_string);
            }
            LineKind::Text(text) => {
                if let Some(last) = conversation.turns.last_mut() {
                    last.content.push('\n');
                    last.content.push_str(text.trim());
                }
            }
        }
    }
    conversation
}

/// The buffer lines an assistant reply occupies: the reply split on line
/// breaks, with the assistant prefix on the first line.
pub fn render_region(format: &TranscriptFormat, response: &str) -> Vec<String> {
    let mut lines: Vec<String> = response
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    lines[0].insert_str(0, &format.assistant_prefix);
    lines
}
