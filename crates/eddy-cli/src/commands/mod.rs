//! Slash commands for interactive mode

mod feedback;
mod history;

pub use feedback::FeedbackCommand;
pub use history::{format_conversations, format_history};

use eddy_api::Rating;

/// Result of parsing a slash command
#[derive(Debug, PartialEq, Eq)]
pub enum CommandResult {
    /// Stop the running generation
    Stop,
    /// Submit the last query again
    Resend,
    /// Toggle a rating on the message at a 1-based position in the history
    Feedback { index: usize, rating: Rating },
    /// Print the messages of the current conversation
    History,
    /// Print the user's conversations
    Conversations,
    /// Load a conversation by id
    Open(String),
    /// Start a new conversation
    New,
    /// Show a message to the user
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse a slash command. Returns `None` for plain input.
pub fn execute_command(input: &str) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next().unwrap_or("").to_lowercase();
    let args = parts.next().map(str::trim).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "stop" => CommandResult::Stop,

        "resend" | "r" => CommandResult::Resend,

        "like" => FeedbackCommand::execute(args, Rating::Like),

        "dislike" => FeedbackCommand::execute(args, Rating::Dislike),

        "history" => CommandResult::History,

        "conversations" | "ls" => CommandResult::Conversations,

        "open" | "o" => {
            if args.is_empty() {
                CommandResult::Message("Usage: /open <conversation id>".to_string())
            } else {
                CommandResult::Open(args.to_string())
            }
        }

        "new" | "n" => CommandResult::New,

        "quit" | "exit" | "q" => CommandResult::Exit,

        _ => CommandResult::Unknown(command),
    })
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?          Show this help message
  /stop                  Stop the answer being generated (also Ctrl-C)
  /resend, /r            Ask the last question again
  /like N, /dislike N    Toggle a rating on message N (see /history)
  /history               Show the messages of this conversation
  /conversations, /ls    List your conversations
  /open, /o ID           Switch to a conversation
  /new, /n               Start a new conversation
  /quit, /exit, /q       Exit eddy

Anything else is sent as a question."#
        .to_string()
}
