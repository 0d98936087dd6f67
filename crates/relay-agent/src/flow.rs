//! Values threaded through a pipeline.

use std::fmt;

use serde_json::{Value, json};

use crate::entities::Conversation;
use crate::error::{AgentError, Result};

/// The value a stage receives and returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Text(String),
    Conversation(Conversation),
    Json(Value),
}

impl Flow {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Conversation(_) => "conversation",
            Self::Json(_) => "json",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_conversation(&self) -> Option<&Conversation> {
        match self {
            Self::Conversation(conv) => Some(conv),
            _ => None,
        }
    }

    /// The text carried by this value (a JSON string counts).
    pub fn into_text(self) -> Result<String> {
        match self {
            Self::Text(text) | Self::Json(Value::String(text)) => Ok(text),
            other => Err(AgentError::UnexpectedValue {
                expected: "text",
                found: other.kind(),
            }),
        }
    }

    pub fn into_conversation(self) -> Result<Conversation> {
        match self {
            Self::Conversation(conv) => Ok(conv),
            other => Err(AgentError::UnexpectedValue {
                expected: "conversation",
                found: other.kind(),
            }),
        }
    }

    /// JSON view; conversations become `[{role, content}, ..]`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Json(value) => value.clone(),
            Self::Conversation(conv) => Value::Array(
                conv.messages()
                    .iter()
                    .map(|m| json!({ "role": m.role, "content": m.content }))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Flow {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Flow {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Conversation> for Flow {
    fn from(conv: Conversation) -> Self {
        Self::Conversation(conv)
    }
}

impl From<Value> for Flow {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Conversation(conv) => write!(f, "{conv}"),
            Self::Json(value) => write!(f, "{value}"),
        }
    }
}
