//! eddy-api: client side of a streaming chat service
//!
//! This crate provides the wire types, the event stream decoder and the
//! collaborator endpoints (`ChatApi`) with an HTTP implementation.

pub mod client;
pub mod error;
pub mod stream;
pub mod types;

pub use client::{ChatApi, HttpChatApi};
pub use error::{Error, Result};
pub use stream::{ByteStream, EventStream, EventStreamDecoder, decode_events};
pub use types::*;
