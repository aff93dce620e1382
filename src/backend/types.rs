//! Wire types for the chat backend's JSON API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::conversation::ids::ConversationId;
use crate::conversation::types::{Conversation, HistoryEntry, Message};
use crate::error::PlaygroundError;

/// Which reply endpoint a send goes to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyMode {
    /// Conversational web search (`POST /search`).
    #[default]
    Search,
    /// Exhaustive planning agent (`POST /plan`).
    Plan,
}

impl ReplyMode {
    /// Endpoint path relative to the backend base.
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Plan => "plan",
        }
    }
}

impl fmt::Display for ReplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for ReplyMode {
    type Err = PlaygroundError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "search" => Ok(Self::Search),
            "plan" => Ok(Self::Plan),
            other => Err(PlaygroundError::Config(format!(
                "unknown reply mode {other:?}, expected search or plan"
            ))),
        }
    }
}

/// Body of `POST /search` and `POST /plan`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRequest {
    /// The new user message.
    pub query: String,
    /// Prior messages of the conversation, oldest first.
    pub chat_history: Vec<HistoryEntry>,
}

/// One event of a reply stream.
///
/// `text` is always the full reply produced so far, never a delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplyChunk {
    /// Cumulative reply text.
    pub text: String,
    /// Set on the final event, after the body has ended.
    pub done: bool,
}

impl ReplyChunk {
    /// A non-terminal event.
    #[must_use]
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: false,
        }
    }

    /// The terminal event.
    #[must_use]
    pub fn terminal(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            done: true,
        }
    }
}

/// One conversation as returned by `GET /conversations`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Display name.
    pub name: String,
    /// Stored messages.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Persisted sidebar position, absent for conversations never reordered.
    #[serde(default)]
    pub order: Option<u32>,
}

impl ConversationRecord {
    /// Build the local model with an already-normalized order.
    #[must_use]
    pub fn into_conversation(self, id: ConversationId, order: u32) -> Conversation {
        Conversation {
            id,
            name: self.name,
            messages: self.messages,
            order,
        }
    }
}

/// Body of `POST /conversation/new`.
#[derive(Clone, Debug, Serialize)]
pub struct NewConversationRequest<'a> {
    /// Display name.
    pub name: &'a str,
}

/// Response of `POST /conversation/new`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct CreatedConversation {
    /// Backend-issued identifier.
    pub id: ConversationId,
    /// Display name as stored.
    pub name: String,
}

/// Body of `POST /conversation/delete`.
#[derive(Clone, Debug, Serialize)]
pub struct DeleteConversationRequest<'a> {
    /// Conversation to delete.
    pub id: &'a ConversationId,
}

/// Body of `POST /conversation/add_message`.
#[derive(Clone, Debug, Serialize)]
pub struct AddMessageRequest<'a> {
    /// Target conversation.
    pub id: &'a ConversationId,
    /// Message to persist.
    pub message: &'a Message,
}

/// Body of `POST /conversations/order`.
#[derive(Clone, Debug, Serialize)]
pub struct OrderRequest<'a> {
    /// Conversation ids in display order.
    pub order: &'a [ConversationId],
}

/// Response of `GET /images_list`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ImageListing {
    /// Filenames of generated images.
    #[serde(default)]
    pub images: Vec<String>,
}

/// Body of `POST /news`.
#[derive(Clone, Debug, Serialize)]
pub struct NewsQuery {
    /// Search terms.
    pub query: String,
    /// Number of results.
    pub k: u32,
    /// Brave freshness filter (`pd`, `pw`, `pm`, `py`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freshness: Option<String>,
}

impl NewsQuery {
    /// News query with the backend's default result count.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            k: 5,
            freshness: None,
        }
    }
}

/// Body of `POST /links`.
#[derive(Clone, Debug, Serialize)]
pub struct LinksQuery {
    /// Search terms.
    pub query: String,
    /// Number of search results to mine for links.
    pub k: u32,
}

impl LinksQuery {
    /// Links query with the backend's default result count.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            k: 5,
        }
    }
}
