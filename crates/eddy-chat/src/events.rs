//! Chat event types

use eddy_api::{MessageId, Rating};
use serde::Serialize;

/// How a generation ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// The stream reached its natural end
    Completed,
    /// `stop` was requested
    Stopped,
    /// Transport, protocol or server error; the partial answer is kept
    Failed { error: String },
}

/// Events emitted by the chat controller
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    /// A placeholder message was appended for a new query
    Submitted { message_id: MessageId, query: String },

    /// The server assigned a task id to the running generation
    TaskStarted { message_id: MessageId, task_id: String },

    /// The answer grew; carries the full text so far
    AnswerUpdated { message_id: MessageId, answer: String },

    /// The generation reached a terminal state.
    ///
    /// `message_id` is the id the message is stored under afterwards,
    /// which is the server's id when one was reported.
    Finished {
        message_id: MessageId,
        outcome: Outcome,
    },

    /// Feedback on a message was persisted
    FeedbackChanged {
        message_id: MessageId,
        rating: Option<Rating>,
    },

    /// The store was replaced with a conversation's history
    HistoryLoaded {
        conversation_id: Option<String>,
        count: usize,
    },
}

impl ChatEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Finished { .. })
    }
}
