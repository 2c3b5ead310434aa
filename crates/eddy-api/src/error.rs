//! Error types for eddy-api

use thiserror::Error;

/// Result type alias using eddy-api Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to the chat service
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request failed or the response body could not be read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status
    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    /// A `data:` line carried a payload that is not a well-formed event
    #[error("Malformed event payload {payload:?}: {source}")]
    Protocol {
        payload: String,
        #[source]
        source: serde_json::Error,
    },

    /// The server reported an error inside the event stream
    #[error("Server error: {message} (code: {code})")]
    Server { code: String, message: String },

    /// Request aborted before the stream opened
    #[error("Request aborted")]
    Aborted,
}

impl Error {
    /// Create an API error from a status code and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// The request could not be sent or the response could not be read
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Api { .. })
    }

    /// The event stream itself was malformed
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol { .. })
    }
}
