//! Incremental plain-text rendering of controller events

use eddy_api::MessageId;
use eddy_chat::{ChatEvent, Outcome};

/// Turns `AnswerUpdated` snapshots into the text not printed yet.
#[derive(Debug, Default)]
pub struct AnswerPrinter {
    current: Option<MessageId>,
    printed: usize,
}

impl AnswerPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to write to stdout for `event`, if any
    pub fn render(&mut self, event: &ChatEvent) -> Option<String> {
        match event {
            ChatEvent::Submitted { message_id, .. } => {
                self.current = Some(message_id.clone());
                self.printed = 0;
                None
            }
            ChatEvent::AnswerUpdated { message_id, answer } => {
                if self.current.as_ref() != Some(message_id) {
                    self.current = Some(message_id.clone());
                    self.printed = 0;
                }
                let suffix = answer.get(self.printed..).filter(|s| !s.is_empty())?;
                self.printed = answer.len();
                Some(suffix.to_string())
            }
            ChatEvent::Finished { outcome, .. } => {
                let printed_any = self.printed > 0;
                self.current = None;
                self.printed = 0;
                let lead = if printed_any { "\n" } else { "" };
                Some(match outcome {
                    Outcome::Completed => lead.to_string(),
                    Outcome::Stopped => format!("{}[stopped]\n", lead),
                    Outcome::Failed { error } => format!("{}[error: {}]\n", lead, error),
                })
            }
            _ => None,
        }
    }
}
