//! Events published by the assembler for views to follow a reply.

use crate::conversation::ids::{ConversationId, StreamSessionId};

/// Progress of a stream session, broadcast to every subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssemblerEvent {
    /// The placeholder now holds `content` (the cumulative reply text).
    ContentUpdated {
        /// Session that wrote.
        session: StreamSessionId,
        /// Conversation written to.
        conversation: ConversationId,
        /// Full reply text so far.
        content: String,
    },
    /// The loading indicator for the conversation should be cleared. Sent once per session.
    LoadingFinished {
        /// Session that finished loading.
        session: StreamSessionId,
        /// Conversation it targets.
        conversation: ConversationId,
    },
    /// The reply finished and was persisted.
    Completed {
        /// Session that completed.
        session: StreamSessionId,
        /// Conversation it targets.
        conversation: ConversationId,
        /// Images attributed to the reply.
        images: Vec<String>,
    },
    /// The reply failed; the placeholder shows the fallback message.
    Failed {
        /// Session that failed.
        session: StreamSessionId,
        /// Conversation it targets.
        conversation: ConversationId,
        /// Description of the underlying error.
        error: String,
    },
    /// The session stopped before the end of the reply.
    Cancelled {
        /// Session that stopped.
        session: StreamSessionId,
        /// Conversation it targeted.
        conversation: ConversationId,
    },
}

impl AssemblerEvent {
    /// Session the event belongs to.
    #[must_use]
    pub const fn session(&self) -> StreamSessionId {
        match self {
            Self::ContentUpdated { session, .. }
            | Self::LoadingFinished { session, .. }
            | Self::Completed { session, .. }
            | Self::Failed { session, .. }
            | Self::Cancelled { session, .. } => *session,
        }
    }

    /// Conversation the event belongs to.
    #[must_use]
    pub const fn conversation(&self) -> &ConversationId {
        match self {
            Self::ContentUpdated { conversation, .. }
            | Self::LoadingFinished { conversation, .. }
            | Self::Completed { conversation, .. }
            | Self::Failed { conversation, .. }
            | Self::Cancelled { conversation, .. } => conversation,
        }
    }

    /// Whether this is the last event of its session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}
