//! Ordered message storage keyed by message id.

use std::collections::HashSet;

use eddy_api::{Feedback, Message, MessageId, Rating};

use crate::error::{Error, Result};

/// Chronological list of conversation turns.
///
/// Ids are unique at all times. Answers and feedback are only changed
/// through the update-by-id operations.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the end
    pub fn append(&mut self, message: Message) -> Result<()> {
        if self.contains(&message.id) {
            return Err(Error::DuplicateMessage(message.id));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Replace the answer of a message. Returns `false` when the id is
    /// not present, which is not an error: a store reset may race a
    /// running generation.
    pub fn update_answer(&mut self, id: &MessageId, answer: &str) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.answer.clear();
                message.answer.push_str(answer);
                true
            }
            None => false,
        }
    }

    /// Set or clear the feedback of a message
    pub fn update_feedback(&mut self, id: &MessageId, rating: Option<Rating>) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.feedback = rating.map(|rating| Feedback { rating });
                true
            }
            None => false,
        }
    }

    /// Replace the whole content, keeping the given order.
    ///
    /// A list containing duplicate ids is rejected and the store is left
    /// untouched.
    pub fn replace_all(&mut self, messages: Vec<Message>) -> Result<()> {
        let mut seen = HashSet::with_capacity(messages.len());
        for message in &messages {
            if !seen.insert(&message.id) {
                return Err(Error::DuplicateMessage(message.id.clone()));
            }
        }
        self.messages = messages;
        Ok(())
    }

    /// Move a message to a new id, e.g. once the server has persisted it
    pub fn rekey(&mut self, old: &MessageId, new: MessageId) -> Result<()> {
        if old == &new {
            return Ok(());
        }
        if self.contains(&new) {
            return Err(Error::DuplicateMessage(new));
        }
        let message = self
            .get_mut(old)
            .ok_or_else(|| Error::UnknownMessage(old.clone()))?;
        message.id = new;
        Ok(())
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.get(id).is_some()
    }

    /// Most recent message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
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
}
