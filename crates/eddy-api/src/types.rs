//! Core types for the chat service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A conversation as listed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Opaque server identifier
    pub id: String,
    /// Display name, absent for untitled conversations
    #[serde(default)]
    pub name: Option<String>,
    #[serde(
        default,
        with = "chrono::serde::ts_seconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// Name shown to the user
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => "New conversation",
        }
    }
}

/// Stable identity of a message.
///
/// In-flight turns get a locally generated id; persisted messages carry the
/// server's id verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    const LOCAL_PREFIX: &'static str = "local-";

    /// Generate a fresh local id
    pub fn local() -> Self {
        Self(format!("{}{}", Self::LOCAL_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Whether this id was generated on the client
    pub fn is_local(&self) -> bool {
        self.0.starts_with(Self::LOCAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Approve/disapprove rating on an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Like,
    Dislike,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Like => "like",
            Rating::Dislike => "dislike",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feedback attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: Rating,
}

/// One conversation turn: the user's query and the (possibly partial) answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub feedback: Option<Feedback>,
}

impl Message {
    /// Create an in-flight turn with an empty answer
    pub fn pending(id: MessageId, query: impl Into<String>) -> Self {
        Self {
            id,
            conversation_id: None,
            query: query.into(),
            answer: String::new(),
            feedback: None,
        }
    }

    /// Current rating, if any
    pub fn rating(&self) -> Option<Rating> {
        self.feedback.map(|f| f.rating)
    }
}

/// How the server should deliver the answer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    #[default]
    Streaming,
    Blocking,
}

/// Outgoing generation request
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    /// Application inputs; always sent, usually empty
    pub inputs: serde_json::Map<String, serde_json::Value>,
    pub query: String,
    pub response_mode: ResponseMode,
    /// Empty to start a new conversation
    pub conversation_id: String,
    pub user: String,
}

impl ChatRequest {
    /// Build a streaming request
    pub fn streaming(
        user: impl Into<String>,
        conversation_id: Option<&str>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            inputs: serde_json::Map::new(),
            query: query.into(),
            response_mode: ResponseMode::Streaming,
            conversation_id: conversation_id.unwrap_or_default().to_string(),
            user: user.into(),
        }
    }
}

/// One decoded `data:` line of the response stream.
///
/// Every field is optional; fields this client does not use are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerEvent {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default, rename = "answer")]
    pub answer_fragment: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServerEvent {
    pub fn task_id(&self) -> Option<&str> {
        non_empty(&self.task_id)
    }

    pub fn message_id(&self) -> Option<&str> {
        non_empty(&self.message_id)
    }

    pub fn conversation_id(&self) -> Option<&str> {
        non_empty(&self.conversation_id)
    }

    /// The answer text carried by this event, if any
    pub fn answer_fragment(&self) -> Option<&str> {
        non_empty(&self.answer_fragment)
    }

    /// Whether the server is reporting a failure
    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}
