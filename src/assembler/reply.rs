//! Streaming reply assembly.
//!
//! A send appends the user message and an empty assistant placeholder to the
//! target conversation, then fills the placeholder from the cumulative reply
//! stream. Every write goes through [`ConversationStore::update`] keyed by the
//! conversation the session was opened for, so switching the visible
//! conversation mid-stream never redirects text. On the terminal chunk the image
//! listing is diffed against the previous snapshot and the new files are
//! attached to the reply before it is persisted.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::backend::client::ChatBackend;
use crate::backend::types::{ReplyMode, ReplyRequest};
use crate::config::PlaygroundConfig;
use crate::conversation::ids::ConversationId;
use crate::conversation::store::ConversationStore;
use crate::conversation::types::Message;
use crate::error::{PlaygroundError, PlaygroundResult};

use super::events::AssemblerEvent;
use super::images::diff_images;
use super::session::{SessionOutcome, SessionPhase, SessionRegistry, StreamSession};

/// Drives stream sessions from a send to a persisted reply.
pub struct StreamingReplyAssembler {
    backend: Arc<dyn ChatBackend>,
    store: Arc<ConversationStore>,
    sessions: Arc<SessionRegistry>,
    events: broadcast::Sender<AssemblerEvent>,
    error_message: String,
}

impl StreamingReplyAssembler {
    /// Create an assembler writing into `store`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<ConversationStore>,
        sessions: Arc<SessionRegistry>,
        config: &PlaygroundConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            backend,
            store,
            sessions,
            events,
            error_message: config.error_message.clone(),
        }
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AssemblerEvent> {
        self.events.subscribe()
    }

    /// Whether `conversation` waits for the first non-empty chunk of its reply.
    #[must_use]
    pub fn is_loading(&self, conversation: &ConversationId) -> bool {
        self.sessions.is_loading(conversation)
    }

    /// Registry of in-flight sessions.
    #[must_use]
    pub const fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Start a send: append the user message and a placeholder, then open the reply stream.
    ///
    /// The history sent to the backend is the conversation as it was before this
    /// send. If the request cannot be issued the session comes back already
    /// closed in [`SessionPhase::Errored`].
    ///
    /// # Errors
    /// Returns `ConversationNotFound` for an unknown conversation and
    /// `SessionActive` if a reply is already streaming into it.
    pub async fn begin(
        &self,
        conversation_id: &ConversationId,
        user_text: &str,
        mode: ReplyMode,
    ) -> PlaygroundResult<StreamSession> {
        if !self.store.contains(conversation_id) {
            return Err(PlaygroundError::ConversationNotFound(conversation_id.clone()));
        }
        let slot = self.sessions.claim(conversation_id)?;
        let session_id = slot.id;

        let user_message = Message::user(user_text);
        let staged = self.store.update(conversation_id, |conversation| {
            let history = conversation.history();
            conversation.messages.push(user_message.clone());
            conversation.messages.push(Message::assistant_placeholder());
            (history, conversation.messages.len() - 1)
        });
        let (history, placeholder_index) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                self.sessions.release(conversation_id, session_id);
                return Err(err);
            }
        };

        let mut session = StreamSession::open(
            slot,
            Arc::clone(&self.sessions),
            self.events.clone(),
            conversation_id.clone(),
            placeholder_index,
            mode,
        );
        info!(
            session = %session.id,
            conversation = %conversation_id,
            %mode,
            history = history.len(),
            "Reply session opened"
        );

        self.prime_image_snapshot().await;
        if let Err(err) = self.backend.add_message(conversation_id, &user_message).await {
            warn!(conversation = %conversation_id, error = %err, "Failed to persist user message");
        }

        if session.cancel.is_cancelled() {
            self.close_cancelled(&mut session);
            return Ok(session);
        }

        let request = ReplyRequest {
            query: user_text.to_string(),
            chat_history: history,
        };
        match self.backend.open_reply(mode, request).await {
            Ok(stream) => session.stream = Some(stream),
            Err(err) => self.fail(&mut session, &err),
        }
        Ok(session)
    }

    /// Apply one cumulative reply event.
    ///
    /// `cumulative` replaces the placeholder content. A terminal event also
    /// attributes new images, persists the reply and closes the session.
    ///
    /// # Errors
    /// Returns `SessionClosed` if the session already ended, `Cancelled` if it was
    /// cancelled, and `ConversationNotFound` if its conversation was deleted. The
    /// last two close the session.
    pub async fn on_chunk(
        &self,
        session: &mut StreamSession,
        cumulative: &str,
        is_terminal: bool,
    ) -> PlaygroundResult<()> {
        if session.is_closed() {
            return Err(PlaygroundError::SessionClosed);
        }
        if session.cancel.is_cancelled() {
            self.close_cancelled(session);
            return Err(PlaygroundError::Cancelled);
        }
        if session.phase == SessionPhase::Sending {
            session.phase = SessionPhase::Streaming;
            debug!(session = %session.id, "First reply chunk");
        }
        if !cumulative.starts_with(session.buffer.as_str()) {
            debug!(session = %session.id, "Reply text rewritten instead of extended");
        }

        if let Err(err) = self.write_placeholder(session, |message| {
            message.content.clear();
            message.content.push_str(cumulative);
        }) {
            self.close_cancelled(session);
            return Err(err);
        }
        session.buffer.clear();
        session.buffer.push_str(cumulative);
        self.emit(AssemblerEvent::ContentUpdated {
            session: session.id,
            conversation: session.conversation_id.clone(),
            content: session.buffer.clone(),
        });

        if !cumulative.is_empty() {
            self.finish_loading(session);
        }
        if is_terminal {
            self.complete(session).await?;
        }
        Ok(())
    }

    /// Pump the session's reply stream until the session closes.
    ///
    /// A stream that ends without a terminal event is completed with the text
    /// received so far. A read error fails the session.
    pub async fn drive(&self, mut session: StreamSession) -> SessionOutcome {
        let Some(mut stream) = session.stream.take() else {
            return session.outcome();
        };
        let cancel = session.cancel.clone();

        while !session.is_closed() {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };
            let result = match step {
                None => {
                    self.close_cancelled(&mut session);
                    Ok(())
                }
                Some(Some(Ok(chunk))) => self.on_chunk(&mut session, &chunk.text, chunk.done).await,
                Some(Some(Err(err))) => {
                    self.fail(&mut session, &err);
                    Ok(())
                }
                Some(None) => {
                    let text = session.buffer.clone();
                    self.on_chunk(&mut session, &text, true).await
                }
            };
            if let Err(err) = result {
                debug!(session = %session.id, error = %err, "Reply session stopped");
            }
        }
        session.outcome()
    }

    /// Send `text` into `conversation_id` and stream the reply to the end.
    ///
    /// # Errors
    /// Returns the errors of [`Self::begin`]. Transport failures are not errors:
    /// they yield [`SessionOutcome::Failed`].
    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        text: &str,
        mode: ReplyMode,
    ) -> PlaygroundResult<SessionOutcome> {
        let session = self.begin(conversation_id, text, mode).await?;
        Ok(self.drive(session).await)
    }

    async fn prime_image_snapshot(&self) {
        if self.store.image_snapshot().is_some() {
            return;
        }
        match self.backend.list_images().await {
            Ok(listing) => {
                if self.store.image_snapshot().is_none() {
                    self.store.replace_image_snapshot(listing);
                }
            }
            Err(err) => warn!(error = %err, "Failed to take initial image listing"),
        }
    }

    async fn attribute_images(&self) -> Vec<String> {
        match self.backend.list_images().await {
            Ok(current) => match self.store.replace_image_snapshot(current.clone()) {
                Some(previous) => diff_images(&previous, &current),
                None => {
                    debug!("No earlier image listing, nothing attributed");
                    Vec::new()
                }
            },
            Err(err) => {
                warn!(error = %err, "Image listing failed, reply keeps no images");
                Vec::new()
            }
        }
    }

    async fn complete(&self, session: &mut StreamSession) -> PlaygroundResult<()> {
        let images = self.attribute_images().await;
        if session.cancel.is_cancelled() {
            self.close_cancelled(session);
            return Err(PlaygroundError::Cancelled);
        }

        let index = session.placeholder_index;
        let finished = self.store.update(&session.conversation_id, |conversation| {
            conversation.messages.get_mut(index).map(|message| {
                message.images.clone_from(&images);
                message.clone()
            })
        });
        let message = match finished {
            Ok(Some(message)) => message,
            Ok(None) | Err(_) => {
                self.close_cancelled(session);
                return Err(PlaygroundError::ConversationNotFound(
                    session.conversation_id.clone(),
                ));
            }
        };

        if let Err(err) = self.backend.add_message(&session.conversation_id, &message).await {
            warn!(
                conversation = %session.conversation_id,
                error = %err,
                "Failed to persist assistant reply"
            );
        }

        session.images = images;
        self.finish_loading(session);
        session.phase = SessionPhase::Done;
        self.sessions.release(&session.conversation_id, session.id);
        info!(
            session = %session.id,
            conversation = %session.conversation_id,
            chars = session.buffer.chars().count(),
            images = session.images.len(),
            "Reply completed"
        );
        self.emit(AssemblerEvent::Completed {
            session: session.id,
            conversation: session.conversation_id.clone(),
            images: session.images.clone(),
        });
        Ok(())
    }

    fn fail(&self, session: &mut StreamSession, err: &PlaygroundError) {
        if session.is_closed() {
            return;
        }
        if session.cancel.is_cancelled() {
            self.close_cancelled(session);
            return;
        }
        warn!(
            session = %session.id,
            conversation = %session.conversation_id,
            error = %err,
            "Reply failed"
        );

        let fallback = self.error_message.clone();
        if let Err(write_err) = self.write_placeholder(session, |message| {
            message.content.clone_from(&fallback);
            message.images.clear();
        }) {
            debug!(error = %write_err, "Placeholder gone, fallback not written");
            self.close_cancelled(session);
            return;
        }
        session.buffer = fallback;
        session.images.clear();
        self.finish_loading(session);
        session.phase = SessionPhase::Errored;
        self.sessions.release(&session.conversation_id, session.id);
        self.emit(AssemblerEvent::Failed {
            session: session.id,
            conversation: session.conversation_id.clone(),
            error: err.to_string(),
        });
    }

    fn close_cancelled(&self, session: &mut StreamSession) {
        if session.is_closed() {
            return;
        }
        self.finish_loading(session);
        session.phase = SessionPhase::Cancelled;
        self.sessions.release(&session.conversation_id, session.id);
        info!(session = %session.id, conversation = %session.conversation_id, "Reply session cancelled");
        self.emit(AssemblerEvent::Cancelled {
            session: session.id,
            conversation: session.conversation_id.clone(),
        });
    }

    fn write_placeholder<F>(&self, session: &StreamSession, mut apply: F) -> PlaygroundResult<()>
    where
        F: FnMut(&mut Message),
    {
        let index = session.placeholder_index;
        let written = self.store.update(&session.conversation_id, |conversation| {
            conversation.messages.get_mut(index).map(&mut apply).is_some()
        })?;
        if written {
            Ok(())
        } else {
            Err(PlaygroundError::ConversationNotFound(
                session.conversation_id.clone(),
            ))
        }
    }

    fn finish_loading(&self, session: &StreamSession) {
        if session.loading.swap(false, Ordering::AcqRel) {
            debug!(session = %session.id, "Loading finished");
            self.emit(AssemblerEvent::LoadingFinished {
                session: session.id,
                conversation: session.conversation_id.clone(),
            });
        }
    }

    fn emit(&self, event: AssemblerEvent) {
        // Sending fails only when nobody subscribed.
        let _ = self.events.send(event);
    }
}
