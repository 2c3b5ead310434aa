//! eddy-chat: chat runtime on top of eddy-api
//!
//! This crate drives generation sessions against a streaming chat service,
//! keeps the ordered message store and exposes the controller a front end
//! talks to.

pub mod controller;
pub mod error;
pub mod events;
pub mod session;
pub mod store;

#[cfg(test)]
mod testing;

pub use controller::ChatController;
pub use error::{Error, Result};
pub use events::{ChatEvent, Outcome};
pub use session::{
    GenerationSession, SessionEnd, SessionHandle, SessionReport, SessionState, SessionUpdate,
};
pub use store::MessageStore;
