//! Client side of the chat backend.
//!
//! The backend owns search, planning, image generation and conversation
//! persistence. This module provides:
//! - The [`ChatBackend`] capability trait
//! - An HTTP implementation over reqwest
//! - Decoding of chunked reply bodies into cumulative text events

pub mod client;
pub mod stream;
pub mod types;

#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod fake;

pub use client::{BackendFuture, ChatBackend, HttpBackend};
pub use stream::{CumulativeText, ReplyStream, cumulative_stream};
pub use types::{ReplyChunk, ReplyMode, ReplyRequest};
