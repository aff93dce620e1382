//! Conversation lifecycle: loading, creation, deletion, ordering and images.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use crate::assembler::session::SessionRegistry;
use crate::backend::client::ChatBackend;
use crate::backend::types::ConversationRecord;
use crate::error::{PlaygroundError, PlaygroundResult};

use super::ids::ConversationId;
use super::store::ConversationStore;
use super::types::Conversation;

/// Keeps the local store and the backend in step for conversation CRUD.
pub struct ConversationManager {
    backend: Arc<dyn ChatBackend>,
    store: Arc<ConversationStore>,
    sessions: Arc<SessionRegistry>,
}

/// Sidebar order of server records: explicit orders first, then by name and id.
fn compare_records(
    (left_id, left): &(ConversationId, ConversationRecord),
    (right_id, right): &(ConversationId, ConversationRecord),
) -> Ordering {
    match (left.order, right.order) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| left.name.cmp(&right.name))
    .then_with(|| left_id.cmp(right_id))
}

impl ConversationManager {
    /// Create a manager over shared state.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        store: Arc<ConversationStore>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            backend,
            store,
            sessions,
        }
    }

    /// Fetch every conversation from the backend and merge it into the store.
    ///
    /// Conversations with a reply in flight keep their local messages. The
    /// image snapshot is taken if none exists yet, and the first conversation
    /// becomes active when nothing valid is selected.
    ///
    /// # Errors
    /// Returns an error if the listing cannot be fetched.
    pub async fn load(&self) -> PlaygroundResult<Vec<Conversation>> {
        let records = self.backend.list_conversations().await?;
        let mut records: Vec<(ConversationId, ConversationRecord)> = records.into_iter().collect();
        records.sort_by(compare_records);

        let mut remote = Vec::with_capacity(records.len());
        for (position, (id, record)) in records.into_iter().enumerate() {
            let order = u32::try_from(position)
                .map_err(|_| PlaygroundError::InvalidOrder("too many conversations".to_string()))?;
            remote.push(record.into_conversation(id, order));
        }
        let count = remote.len();
        self.store.merge_remote(remote, &self.sessions.active_conversations());

        if self.store.image_snapshot().is_none() {
            match self.backend.list_images().await {
                Ok(listing) => {
                    self.store.replace_image_snapshot(listing);
                }
                Err(err) => warn!(error = %err, "Failed to take initial image listing"),
            }
        }

        let conversations = self.store.list();
        let selected = self.store.active().filter(|id| self.store.contains(id));
        if let (None, Some(first)) = (selected, conversations.first()) {
            self.store.set_active(&first.id)?;
        }
        info!(count, "Conversations loaded");
        Ok(conversations)
    }

    /// Conversations in sidebar order.
    #[must_use]
    pub fn list(&self) -> Vec<Conversation> {
        self.store.list()
    }

    /// Create a conversation on the backend, append it locally and make it active.
    ///
    /// # Errors
    /// Returns an error if the backend call fails.
    pub async fn create(&self, name: &str) -> PlaygroundResult<Conversation> {
        let created = self.backend.create_conversation(name).await?;
        let conversation = Conversation::new(created.id, created.name, self.store.next_order());
        self.store.insert(conversation.clone());
        self.store.set_active(&conversation.id)?;
        info!(id = %conversation.id, title = %conversation.name, "Conversation created");
        Ok(conversation)
    }

    /// Delete a conversation, stopping any reply still streaming into it.
    ///
    /// If it was active, the first remaining conversation becomes active.
    ///
    /// # Errors
    /// Returns `ConversationNotFound` for an unknown id or an error from the backend.
    pub async fn delete(&self, id: &ConversationId) -> PlaygroundResult<()> {
        if !self.store.contains(id) {
            return Err(PlaygroundError::ConversationNotFound(id.clone()));
        }
        self.backend.delete_conversation(id).await?;
        if self.sessions.cancel(id) {
            debug!(%id, "Cancelled reply of deleted conversation");
        }
        let was_active = self.store.active().as_ref() == Some(id);
        self.store.remove(id);
        let fallback = self.store.list().into_iter().next();
        if let (true, Some(next)) = (was_active, fallback) {
            self.store.set_active(&next.id)?;
        }
        info!(%id, "Conversation deleted");
        Ok(())
    }

    /// Rename a conversation locally. The backend has no rename call.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist.
    pub fn rename(&self, id: &ConversationId, name: &str) -> PlaygroundResult<()> {
        self.store.rename(id, name)?;
        info!(%id, title = name, "Conversation renamed");
        Ok(())
    }

    /// Move `ids` to the top of the sidebar, in that sequence, and persist the order.
    ///
    /// # Errors
    /// Returns an error for unknown or duplicate ids, or if the order cannot be saved.
    pub async fn reorder(&self, ids: &[ConversationId]) -> PlaygroundResult<Vec<ConversationId>> {
        let order = self.store.reorder(ids)?;
        self.backend.save_order(&order).await?;
        info!(count = order.len(), "Conversation order saved");
        Ok(order)
    }

    /// Show a conversation and return its current content, partial replies included.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist.
    pub fn switch_to(&self, id: &ConversationId) -> PlaygroundResult<Conversation> {
        self.store.set_active(id)?;
        debug!(%id, "Switched conversation");
        self.store
            .get(id)
            .ok_or_else(|| PlaygroundError::ConversationNotFound(id.clone()))
    }

    /// Current image gallery. Does not touch the attribution snapshot.
    ///
    /// # Errors
    /// Returns an error if the listing cannot be fetched.
    pub async fn list_images(&self) -> PlaygroundResult<Vec<String>> {
        self.backend.list_images().await
    }

    /// Delete a generated image and forget it locally.
    ///
    /// # Errors
    /// Returns an error if the backend refuses the deletion.
    pub async fn delete_image(&self, name: &str) -> PlaygroundResult<()> {
        self.backend.delete_image(name).await?;
        self.store.remove_image(name);
        info!(image = name, "Image deleted");
        Ok(())
    }

    /// URL an image can be fetched from.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be built.
    pub fn image_url(&self, name: &str) -> PlaygroundResult<Url> {
        self.backend.image_url(name)
    }
}
