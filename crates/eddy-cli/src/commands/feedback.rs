//! /like and /dislike

use super::CommandResult;
use eddy_api::Rating;

pub struct FeedbackCommand;

impl FeedbackCommand {
    pub fn execute(args: &str, rating: Rating) -> CommandResult {
        match args.parse::<usize>() {
            Ok(index) if index > 0 => CommandResult::Feedback { index, rating },
            _ => CommandResult::Message(format!(
                "Usage: /{} N, where N is the message number shown by /history",
                rating
            )),
        }
    }
}
