//! Text listings for /history and /conversations

use eddy_api::{Conversation, Message, Rating};

use crate::utils::truncate_chars;

const PREVIEW_CHARS: usize = 72;

/// Numbered list of messages, oldest first
pub fn format_history(messages: &[Message]) -> String {
    if messages.is_empty() {
        return "No messages yet.".to_string();
    }

    let mut output = String::new();
    for (i, message) in messages.iter().enumerate() {
        let marker = match message.rating() {
            Some(Rating::Like) => " [+]",
            Some(Rating::Dislike) => " [-]",
            None => "",
        };
        output.push_str(&format!(
            "{:>3}. {}{}\n",
            i + 1,
            truncate_chars(&message.query, PREVIEW_CHARS),
            marker
        ));
        if !message.answer.is_empty() {
            let answer = message.answer.replace('\n', " ");
            output.push_str(&format!("     {}\n", truncate_chars(&answer, PREVIEW_CHARS)));
        }
    }
    output.pop();
    output
}

pub fn format_conversations(conversations: &[Conversation], current: Option<&str>) -> String {
    if conversations.is_empty() {
        return "No conversations.".to_string();
    }

    conversations
        .iter()
        .map(|c| {
            let marker = if current == Some(c.id.as_str()) { "*" } else { " " };
            let created = c
                .created_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            format!("{} {}  {:<16}  {}", marker, c.id, created, c.display_name())
        })
        .collect::<Vec<_>>()
        .join("\n")
}
