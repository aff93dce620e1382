//! Conversation and message model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ConversationId;

/// Author of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message typed by the user.
    User,
    /// Reply produced by the backend.
    Assistant,
}

impl Role {
    /// Stable string form used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(value.to_string()),
        }
    }
}

/// A single message in a conversation.
///
/// Assistant content is rewritten while its reply streams; everything else is fixed
/// once the message is appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Generated image filenames attributed to this message.
    #[serde(default)]
    pub images: Vec<String>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Build a user message stamped with the current time.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Build the empty assistant message that reserves a reply's position.
    #[must_use]
    pub fn assistant_placeholder() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Project to the role/content pair sent as chat history.
    #[must_use]
    pub fn to_history(&self) -> HistoryEntry {
        HistoryEntry {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// Role and content of a prior message, as sent in `chat_history`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
}

/// A conversation as displayed in the sidebar and chat view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Backend identifier.
    pub id: ConversationId,
    /// Display name.
    pub name: String,
    /// Messages in display order.
    pub messages: Vec<Message>,
    /// Sidebar position.
    pub order: u32,
}

impl Conversation {
    /// Create an empty conversation.
    #[must_use]
    pub fn new(id: ConversationId, name: impl Into<String>, order: u32) -> Self {
        Self {
            id,
            name: name.into(),
            messages: Vec::new(),
            order,
        }
    }

    /// Role/content history of every message currently in the conversation.
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.messages.iter().map(Message::to_history).collect()
    }

    /// Last message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}
