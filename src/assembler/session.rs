//! Stream sessions and the per-conversation session registry.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::stream::ReplyStream;
use crate::backend::types::ReplyMode;
use crate::conversation::ids::{ConversationId, StreamSessionId};
use crate::error::{PlaygroundError, PlaygroundResult};

use super::events::AssemblerEvent;

/// Lifecycle phase of a stream session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    /// Request issued, nothing received yet.
    Sending,
    /// At least one chunk applied.
    Streaming,
    /// Terminal chunk applied, images attributed, reply persisted.
    Done,
    /// Transport failure; the placeholder holds the fallback message.
    Errored,
    /// Cancelled, or its conversation disappeared; writes stopped.
    Cancelled,
}

impl SessionPhase {
    /// Whether the session reached a terminal phase.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Done | Self::Errored | Self::Cancelled)
    }
}

/// How a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The reply streamed to the end.
    Completed {
        /// Final reply text.
        content: String,
        /// Images attributed to the reply.
        images: Vec<String>,
    },
    /// The reply failed and the placeholder shows the fallback message.
    Failed {
        /// The fallback message written into the placeholder.
        message: String,
    },
    /// The session stopped applying updates before the end.
    Cancelled {
        /// Text applied before cancellation.
        partial: String,
    },
}

/// Cancellation handle for one session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: StreamSessionId,
    conversation_id: ConversationId,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Session this handle controls.
    #[must_use]
    pub const fn id(&self) -> StreamSessionId {
        self.id
    }

    /// Conversation the session writes into.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Stop the session. Later chunks are dropped without touching the conversation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the session was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Registry entry for the session currently targeting a conversation.
#[derive(Clone, Debug)]
pub(crate) struct SessionSlot {
    pub(crate) id: StreamSessionId,
    pub(crate) cancel: CancellationToken,
    pub(crate) loading: Arc<AtomicBool>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            id: StreamSessionId::new(),
            cancel: CancellationToken::new(),
            loading: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// At most one in-flight session per conversation.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    slots: DashMap<ConversationId, SessionSlot>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the conversation for a new session.
    pub(crate) fn claim(&self, conversation: &ConversationId) -> PlaygroundResult<SessionSlot> {
        match self.slots.entry(conversation.clone()) {
            Entry::Occupied(_) => Err(PlaygroundError::SessionActive(conversation.clone())),
            Entry::Vacant(vacant) => {
                let slot = SessionSlot::new();
                vacant.insert(slot.clone());
                Ok(slot)
            }
        }
    }

    /// Free the conversation, but only if `session` still owns it.
    pub(crate) fn release(&self, conversation: &ConversationId, session: StreamSessionId) {
        self.slots.remove_if(conversation, |_, slot| slot.id == session);
    }

    /// Cancel the session targeting `conversation`. Returns whether one was running.
    pub fn cancel(&self, conversation: &ConversationId) -> bool {
        self.slots.get(conversation).is_some_and(|slot| {
            slot.cancel.cancel();
            true
        })
    }

    /// Cancel every running session (teardown).
    pub fn cancel_all(&self) {
        for slot in &self.slots {
            slot.cancel.cancel();
        }
    }

    /// Whether a session targets `conversation`.
    #[must_use]
    pub fn is_active(&self, conversation: &ConversationId) -> bool {
        self.slots.contains_key(conversation)
    }

    /// Whether `conversation` is waiting for the first token of its reply.
    #[must_use]
    pub fn is_loading(&self, conversation: &ConversationId) -> bool {
        self.slots
            .get(conversation)
            .is_some_and(|slot| slot.loading.load(Ordering::Acquire))
    }

    /// Conversations with a session in flight.
    #[must_use]
    pub fn active_conversations(&self) -> HashSet<ConversationId> {
        self.slots.iter().map(|slot| slot.key().clone()).collect()
    }
}

/// One in-flight send: fills the placeholder at `placeholder_index` of `conversation_id`.
///
/// Dropping a session that has not reached a terminal phase cancels it and
/// frees its conversation. The placeholder keeps the text applied so far.
pub struct StreamSession {
    pub(crate) id: StreamSessionId,
    pub(crate) conversation_id: ConversationId,
    pub(crate) placeholder_index: usize,
    pub(crate) mode: ReplyMode,
    pub(crate) phase: SessionPhase,
    pub(crate) buffer: String,
    pub(crate) images: Vec<String>,
    pub(crate) cancel: CancellationToken,
    pub(crate) loading: Arc<AtomicBool>,
    pub(crate) stream: Option<ReplyStream>,
    registry: Arc<SessionRegistry>,
    events: broadcast::Sender<AssemblerEvent>,
}

impl StreamSession {
    pub(crate) fn open(
        slot: SessionSlot,
        registry: Arc<SessionRegistry>,
        events: broadcast::Sender<AssemblerEvent>,
        conversation_id: ConversationId,
        placeholder_index: usize,
        mode: ReplyMode,
    ) -> Self {
        Self {
            id: slot.id,
            conversation_id,
            placeholder_index,
            mode,
            phase: SessionPhase::Sending,
            buffer: String::new(),
            images: Vec::new(),
            cancel: slot.cancel,
            loading: slot.loading,
            stream: None,
            registry,
            events,
        }
    }

    /// Session identifier.
    #[must_use]
    pub const fn id(&self) -> StreamSessionId {
        self.id
    }

    /// Conversation the session writes into.
    #[must_use]
    pub const fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    /// Index of the placeholder message being filled.
    #[must_use]
    pub const fn placeholder_index(&self) -> usize {
        self.placeholder_index
    }

    /// Reply endpoint used.
    #[must_use]
    pub const fn mode(&self) -> ReplyMode {
        self.mode
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether the session reached a terminal phase.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.phase.is_closed()
    }

    /// Text applied so far.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.buffer
    }

    /// Cancellation handle.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            conversation_id: self.conversation_id.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Outcome as of the current phase; open sessions report what they applied so far.
    #[must_use]
    pub fn outcome(&self) -> SessionOutcome {
        match self.phase {
            SessionPhase::Done => SessionOutcome::Completed {
                content: self.buffer.clone(),
                images: self.images.clone(),
            },
            SessionPhase::Errored => SessionOutcome::Failed {
                message: self.buffer.clone(),
            },
            SessionPhase::Sending | SessionPhase::Streaming | SessionPhase::Cancelled => {
                SessionOutcome::Cancelled {
                    partial: self.buffer.clone(),
                }
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.phase.is_closed() {
            return;
        }
        self.cancel.cancel();
        self.phase = SessionPhase::Cancelled;
        self.registry.release(&self.conversation_id, self.id);
        debug!(session = %self.id, conversation = %self.conversation_id, "Open reply session dropped");
        // Sending fails only when nobody subscribed.
        if self.loading.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(AssemblerEvent::LoadingFinished {
                session: self.id,
                conversation: self.conversation_id.clone(),
            });
        }
        let _ = self.events.send(AssemblerEvent::Cancelled {
            session: self.id,
            conversation: self.conversation_id.clone(),
        });
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("conversation_id", &self.conversation_id)
            .field("placeholder_index", &self.placeholder_index)
            .field("mode", &self.mode)
            .field("phase", &self.phase)
            .field("content_len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}
