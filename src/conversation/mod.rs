//! Conversation model, the shared in-memory store and lifecycle management.

pub mod ids;
pub mod manager;
pub mod store;
pub mod types;

pub use ids::{ConversationId, StreamSessionId};
pub use manager::ConversationManager;
pub use store::{ConversationStore, Versioned};
pub use types::{Conversation, HistoryEntry, Message, Role};
