//! Error types for the playground client.

use thiserror::Error;

use crate::conversation::ids::ConversationId;

/// Errors that can occur while talking to the chat backend or mutating local state.
#[derive(Debug, Error)]
pub enum PlaygroundError {
    /// HTTP request failed before a response was received, or while reading the body.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("{endpoint} returned status {status}")]
    Status {
        /// Endpoint path that was called.
        endpoint: String,
        /// HTTP status code.
        status: u16,
    },

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The conversation is not present in the local store.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// A send was requested while no conversation is selected.
    #[error("No conversation is selected")]
    NoActiveConversation,

    /// A reply is already streaming into this conversation.
    #[error("A reply is already streaming into conversation {0}")]
    SessionActive(ConversationId),

    /// A compare-and-swap lost against a concurrent writer.
    #[error("Stale revision for conversation {id}: expected {expected}, found {found}")]
    StaleRevision {
        /// Conversation that was being updated.
        id: ConversationId,
        /// Revision the caller read.
        expected: u64,
        /// Revision currently stored.
        found: u64,
    },

    /// A reorder request was malformed.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// The stream session was cancelled.
    #[error("Stream session cancelled")]
    Cancelled,

    /// The stream session already reached a terminal phase.
    #[error("Stream session already closed")]
    SessionClosed,
}

impl PlaygroundError {
    /// Whether this error belongs to the transport class (network, status, body decoding).
    ///
    /// Transport errors inside a stream session are recovered into the fallback message.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Status { .. } | Self::Json(_) | Self::Io(_)
        )
    }
}

/// Convenience result alias for playground operations.
pub type PlaygroundResult<T> = Result<T, PlaygroundError>;
