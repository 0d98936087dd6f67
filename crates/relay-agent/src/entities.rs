//! Conversation value types.
//!
//! A [`Conversation`] is the value most middlewares pass along: an ordered
//! list of [`Message`]s plus the flags that drive the inference loop.
//! Conversations also have a plain-text form used for prompt and
//! transcript files: `role:content` blocks separated by
//! [`TRANSCRIPT_SEPARATOR`].

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Delimiter between blocks of a transcript file.
pub const TRANSCRIPT_SEPARATOR: &str = "\n__-__\n";

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// The author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Developer,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Developer => "developer",
            Self::Tool => "tool",
        }
    }
}

impl FromStr for Role {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            // Shorthand used in hand-written prompt files.
            "A" => Ok(Self::Assistant),
            other => match other.to_ascii_lowercase().as_str() {
                "system" => Ok(Self::System),
                "user" => Ok(Self::User),
                "assistant" => Ok(Self::Assistant),
                "developer" => Ok(Self::Developer),
                "tool" => Ok(Self::Tool),
                _ => Err(AgentError::InvalidRole {
                    role: other.to_string(),
                }),
            },
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single message in a conversation.
///
/// The content at creation time is kept as `original_content` so a
/// middleware can re-derive `content` from it more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    original_content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            role,
            original_content: content.clone(),
            content,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn developer(content: impl Into<String>) -> Self {
        Self::new(Role::Developer, content)
    }

    /// The content this message was created with.
    pub fn original_content(&self) -> &str {
        &self.original_content
    }

    /// Replace `content` with `parser` applied to the original content.
    pub fn reparse(&mut self, parser: impl FnOnce(&str) -> String) {
        self.content = parser(&self.original_content);
    }

    /// `true` when role and content both match `other`.
    pub fn same_turn(&self, other: &Message) -> bool {
        self.role == other.role && self.content == other.content
    }
}

/// Wire form of a message sent to the inference collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// An ordered list of messages plus inference-loop flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
    /// Model selector for the next inference round.
    pub llm: Option<String>,
    /// Request another inference round before the pipeline moves on.
    pub should_infer: bool,
    /// Completed inference rounds.
    pub hops: u32,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut Message> {
        self.messages.last_mut()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// This conversation with `message` appended.
    #[must_use]
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// This conversation with every message of `other` appended.  Flags
    /// are kept from `self`.
    #[must_use]
    pub fn concat(mut self, other: &Conversation) -> Self {
        self.messages.extend(other.messages.iter().cloned());
        self
    }

    /// The last `n` messages (all of them if fewer), with this
    /// conversation's flags.
    #[must_use]
    pub fn tail(&self, n: usize) -> Self {
        let start = self.messages.len().saturating_sub(n);
        Self {
            messages: self.messages[start..].to_vec(),
            llm: self.llm.clone(),
            should_infer: self.should_infer,
            hops: self.hops,
        }
    }

    /// A copy with a new `role` message appended and another inference
    /// round requested.
    #[must_use]
    pub fn rehop(&self, content: impl Into<String>, role: Role) -> Self {
        let mut next = self.clone().with_message(Message::new(role, content));
        next.should_infer = true;
        next
    }

    /// Turns for the inference collaborator.  Every role other than
    /// `assistant` is sent as `user`.
    pub fn to_turns(&self) -> Vec<Turn> {
        self.messages
            .iter()
            .map(|m| Turn {
                role: if m.role == Role::Assistant {
                    Role::Assistant
                } else {
                    Role::User
                },
                content: m.content.clone(),
            })
            .collect()
    }

    // -- Text form -----------------------------------------------------------

    /// Encode as transcript text.
    pub fn to_transcript(&self) -> String {
        let separator = format!("\n\n{TRANSCRIPT_SEPARATOR}\n\n");
        self.messages
            .iter()
            .map(|m| format!("{}:{}", m.role, m.content))
            .collect::<Vec<_>>()
            .join(&separator)
    }

    /// Decode transcript text.  Blank blocks are skipped.
    pub fn parse_transcript(text: &str) -> Result<Self> {
        let mut messages = Vec::new();
        for block in text.split(TRANSCRIPT_SEPARATOR) {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }
            let (role, content) = block.split_once(':').ok_or_else(|| AgentError::Transcript {
                reason: format!("block has no `role:` prefix: {block:.40}"),
            })?;
            messages.push(Message::new(role.parse()?, content));
        }
        Ok(Self::from_messages(messages))
    }

    /// Read a conversation file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::parse_transcript(&fs::read_to_string(path)?)
    }

    /// Write a conversation file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_transcript())?;
        Ok(())
    }
}

impl fmt::Display for Conversation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_transcript())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parsing_accepts_shorthand() {
        assert_eq!("A".parse::<Role>().unwrap(), Role::Assistant);
        assert_eq!(" user ".parse::<Role>().unwrap(), Role::User);
        assert!("narrator".parse::<Role>().is_err());
    }

    #[test]
    fn reparse_uses_original_content() {
        let mut msg = Message::user("Hello");
        msg.reparse(|s| s.to_uppercase());
        msg.reparse(|s| format!("{s}!"));
        assert_eq!(msg.content, "Hello!");
        assert_eq!(msg.original_content(), "Hello");
    }

    #[test]
    fn rehop_appends_and_requests_inference() {
        let conv = Conversation::new().with_message(Message::user("q"));
        let next = conv.rehop("a", Role::Assistant);
        assert_eq!(conv.len(), 1);
        assert_eq!(next.len(), 2);
        assert!(next.should_infer);
        assert_eq!(next.last().map(|m| m.role), Some(Role::Assistant));
    }

    #[test]
    fn turns_collapse_non_assistant_roles() {
        let conv = Conversation::from_messages(vec![
            Message::system("s"),
            Message::developer("d"),
            Message::assistant("a"),
        ]);
        let roles: Vec<Role> = conv.to_turns().into_iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::User, Role::Assistant]);
    }

    #[test]
    fn transcript_text_is_decodable() {
        let conv = Conversation::from_messages(vec![
            Message::system("You are terse.\nVery terse."),
            Message::user("key: value"),
        ]);
        let text = conv.to_transcript();
        assert!(text.contains("\n\n\n__-__\n\n\n"));

        let parsed = Conversation::parse_transcript(&text).unwrap();
        assert_eq!(parsed.messages()[0].content, "You are terse.\nVery terse.");
        assert_eq!(parsed.messages()[1].content, "key: value");
    }

    #[test]
    fn hand_written_prompt_with_shorthand() {
        let text = "system: be kind\n__-__\nA: sure\n__-__\n\n";
        let parsed = Conversation::parse_transcript(text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.messages()[1].role, Role::Assistant);
        assert_eq!(parsed.messages()[1].content, " sure");
    }

    #[test]
    fn tail_keeps_last_messages() {
        let conv = Conversation::from_messages(
            (0..5).map(|i| Message::user(i.to_string())).collect(),
        );
        let tail = conv.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.messages()[0].content, "3");
        assert_eq!(conv.tail(10).len(), 5);
    }
}
