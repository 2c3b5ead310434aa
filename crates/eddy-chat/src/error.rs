//! Error types for eddy-chat

use eddy_api::MessageId;
use thiserror::Error;

/// Result type alias using eddy-chat Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during chat operations
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the service layer
    #[error(transparent)]
    Api(#[from] eddy_api::Error),

    /// A generation is already in flight
    #[error("A response is still being generated")]
    Busy,

    /// The query is empty after trimming
    #[error("Query is empty")]
    EmptyQuery,

    /// Resend requested with no previous message
    #[error("No previous message to resend")]
    NoHistory,

    /// A message id was inserted twice
    #[error("Duplicate message id: {0}")]
    DuplicateMessage(MessageId),

    /// Operation on a message that is not in the store
    #[error("Unknown message id: {0}")]
    UnknownMessage(MessageId),

    /// The message has no server id yet, so the server cannot address it
    #[error("Message {0} has not been saved by the server")]
    NotPersisted(MessageId),
}

impl Error {
    /// Whether the caller may simply try again later
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Busy | Error::EmptyQuery | Error::NoHistory => true,
            Error::Api(e) => e.is_transport(),
            Error::DuplicateMessage(_) | Error::UnknownMessage(_) | Error::NotPersisted(_) => {
                false
            }
        }
    }
}
