//! In-memory conversation store shared by the assembler, the manager and the UI.
//!
//! Every conversation carries a revision counter. Writers go through
//! [`ConversationStore::update`], which reads a snapshot, applies the change to a
//! copy and swaps it in only if nobody else wrote in between. A stale swap is
//! retried against the fresh snapshot, so two async operations that both
//! "read messages, build a new list, write it back" cannot drop each other's work.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::debug;

use crate::error::{PlaygroundError, PlaygroundResult};

use super::ids::ConversationId;
use super::types::Conversation;

/// Maximum compare-and-swap attempts before `update` gives up.
const MAX_CAS_ATTEMPTS: usize = 16;

/// A value tagged with the revision it was read at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    /// Monotonic revision, bumped on every successful write.
    pub revision: u64,
    /// The value.
    pub value: T,
}

/// Shared conversation state owned by the application root.
#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: DashMap<ConversationId, Versioned<Conversation>>,
    active: Mutex<Option<ConversationId>>,
    image_snapshot: Mutex<Option<Vec<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConversationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a conversation. Replacing bumps the revision.
    pub fn insert(&self, conversation: Conversation) {
        let id = conversation.id.clone();
        let revision = self
            .conversations
            .get(&id)
            .map_or(0, |existing| existing.revision + 1);
        self.conversations.insert(
            id,
            Versioned {
                revision,
                value: conversation,
            },
        );
    }

    /// Clone of a conversation.
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<Conversation> {
        self.conversations.get(id).map(|entry| entry.value.clone())
    }

    /// Clone of a conversation together with its revision.
    #[must_use]
    pub fn snapshot(&self, id: &ConversationId) -> Option<Versioned<Conversation>> {
        self.conversations.get(id).map(|entry| entry.clone())
    }

    /// Whether the conversation exists.
    #[must_use]
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.conversations.contains_key(id)
    }

    /// Number of conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether the store holds no conversations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// All conversations sorted by display order.
    #[must_use]
    pub fn list(&self) -> Vec<Conversation> {
        let mut all: Vec<Conversation> = self
            .conversations
            .iter()
            .map(|entry| entry.value.clone())
            .collect();
        all.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Remove a conversation, clearing the active view if it pointed at it.
    pub fn remove(&self, id: &ConversationId) -> Option<Conversation> {
        let removed = self.conversations.remove(id).map(|(_, entry)| entry.value);
        let mut active = lock(&self.active);
        if active.as_ref() == Some(id) {
            *active = None;
        }
        removed
    }

    /// Replace a conversation only if it is still at `expected_revision`.
    ///
    /// Returns the new revision.
    ///
    /// # Errors
    /// Returns `StaleRevision` if another writer got there first, or
    /// `ConversationNotFound` if the conversation is gone.
    pub fn compare_and_swap(
        &self,
        id: &ConversationId,
        expected_revision: u64,
        mut next: Conversation,
    ) -> PlaygroundResult<u64> {
        let mut entry = self
            .conversations
            .get_mut(id)
            .ok_or_else(|| PlaygroundError::ConversationNotFound(id.clone()))?;

        if entry.revision != expected_revision {
            return Err(PlaygroundError::StaleRevision {
                id: id.clone(),
                expected: expected_revision,
                found: entry.revision,
            });
        }

        next.id = id.clone();
        entry.value = next;
        entry.revision += 1;
        Ok(entry.revision)
    }

    /// Apply `f` to a copy of the conversation and swap it in, retrying on stale reads.
    ///
    /// `f` may run more than once and must only depend on the conversation it is given.
    ///
    /// # Errors
    /// Returns `ConversationNotFound` if the conversation is missing, or
    /// `StaleRevision` if every attempt lost a race.
    pub fn update<T, F>(&self, id: &ConversationId, mut f: F) -> PlaygroundResult<T>
    where
        F: FnMut(&mut Conversation) -> T,
    {
        let mut last_error = None;
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .snapshot(id)
                .ok_or_else(|| PlaygroundError::ConversationNotFound(id.clone()))?;
            let mut next = current.value;
            let output = f(&mut next);

            match self.compare_and_swap(id, current.revision, next) {
                Ok(_) => return Ok(output),
                Err(err @ PlaygroundError::StaleRevision { .. }) => {
                    debug!(%id, attempt, "Conversation changed underneath update, retrying");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.unwrap_or_else(|| PlaygroundError::ConversationNotFound(id.clone())))
    }

    /// Rename a conversation.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist.
    pub fn rename(&self, id: &ConversationId, name: &str) -> PlaygroundResult<()> {
        self.update(id, |conversation| conversation.name = name.to_string())
    }

    /// Order value for a newly created conversation (after every existing one).
    #[must_use]
    pub fn next_order(&self) -> u32 {
        self.conversations
            .iter()
            .map(|entry| entry.value.order.saturating_add(1))
            .max()
            .unwrap_or(0)
    }

    /// Reorder conversations: `ids` first in the given sequence, then the rest in
    /// their current order. Orders are renumbered `0..n`.
    ///
    /// Returns the full resulting order.
    ///
    /// # Errors
    /// Returns `InvalidOrder` on duplicates and `ConversationNotFound` on unknown ids.
    pub fn reorder(&self, ids: &[ConversationId]) -> PlaygroundResult<Vec<ConversationId>> {
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                return Err(PlaygroundError::InvalidOrder(format!(
                    "conversation {id} listed twice"
                )));
            }
            if !self.contains(id) {
                return Err(PlaygroundError::ConversationNotFound(id.clone()));
            }
        }

        let mut order: Vec<ConversationId> = ids.to_vec();
        order.extend(
            self.list()
                .into_iter()
                .map(|conversation| conversation.id)
                .filter(|id| !seen.contains(id)),
        );

        for (position, id) in order.iter().enumerate() {
            let position = u32::try_from(position)
                .map_err(|_| PlaygroundError::InvalidOrder("too many conversations".to_string()))?;
            self.update(id, |conversation| conversation.order = position)?;
        }
        Ok(order)
    }

    /// Replace local state with a listing fetched from the backend.
    ///
    /// Conversations in `keep` (those with a reply still streaming) retain their
    /// local messages and only take the remote name and order.
    pub fn merge_remote(&self, remote: Vec<Conversation>, keep: &HashSet<ConversationId>) {
        let remote_ids: HashSet<ConversationId> =
            remote.iter().map(|conversation| conversation.id.clone()).collect();

        for conversation in remote {
            if keep.contains(&conversation.id) && self.contains(&conversation.id) {
                let name = conversation.name.clone();
                let order = conversation.order;
                if let Err(err) = self.update(&conversation.id, |local| {
                    local.name.clone_from(&name);
                    local.order = order;
                }) {
                    debug!(?err, "Skipped merge for in-flight conversation");
                }
            } else {
                self.insert(conversation);
            }
        }

        let stale: Vec<ConversationId> = self
            .conversations
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !remote_ids.contains(id) && !keep.contains(id))
            .collect();
        for id in stale {
            self.remove(&id);
        }
    }

    /// Set the conversation shown in the chat view.
    ///
    /// # Errors
    /// Returns an error if the conversation does not exist.
    pub fn set_active(&self, id: &ConversationId) -> PlaygroundResult<()> {
        if !self.contains(id) {
            return Err(PlaygroundError::ConversationNotFound(id.clone()));
        }
        *lock(&self.active) = Some(id.clone());
        Ok(())
    }

    /// Identifier of the conversation shown in the chat view.
    #[must_use]
    pub fn active(&self) -> Option<ConversationId> {
        lock(&self.active).clone()
    }

    /// Current content of the conversation shown in the chat view.
    #[must_use]
    pub fn active_view(&self) -> Option<Conversation> {
        self.active().and_then(|id| self.get(&id))
    }

    /// Last recorded image listing, if one was taken.
    #[must_use]
    pub fn image_snapshot(&self) -> Option<Vec<String>> {
        lock(&self.image_snapshot).clone()
    }

    /// Record a new image listing and return the previous one.
    pub fn replace_image_snapshot(&self, current: Vec<String>) -> Option<Vec<String>> {
        lock(&self.image_snapshot).replace(current)
    }

    /// Forget an image: drop it from the snapshot and from every message.
    pub fn remove_image(&self, name: &str) {
        if let Some(snapshot) = lock(&self.image_snapshot).as_mut() {
            snapshot.retain(|image| image != name);
        }

        let holders: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|entry| {
                entry
                    .value
                    .messages
                    .iter()
                    .any(|message| message.images.iter().any(|image| image == name))
            })
            .map(|entry| entry.key().clone())
            .collect();

        for id in holders {
            let result = self.update(&id, |conversation| {
                for message in &mut conversation.messages {
                    message.images.retain(|image| image != name);
                }
            });
            if let Err(err) = result {
                debug!(%id, ?err, "Image holder vanished before cleanup");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::conversation::types::Message;

    fn id(raw: &str) -> ConversationId {
        ConversationId::from(raw)
    }

    fn seeded(names: &[&str]) -> ConversationStore {
        let store = ConversationStore::new();
        for (order, name) in (0u32..).zip(names) {
            store.insert(Conversation::new(id(name), *name, order));
        }
        store
    }

    #[test]
    fn test_compare_and_swap_rejects_stale_revision() -> PlaygroundResult<()> {
        let store = seeded(&["a"]);
        let snapshot = store
            .snapshot(&id("a"))
            .ok_or_else(|| PlaygroundError::ConversationNotFound(id("a")))?;

        let mut first = snapshot.value.clone();
        first.name = "first".to_string();
        assert_eq!(store.compare_and_swap(&id("a"), snapshot.revision, first)?, 1);

        let mut second = snapshot.value;
        second.name = "second".to_string();
        let result = store.compare_and_swap(&id("a"), snapshot.revision, second);
        assert!(matches!(
            result,
            Err(PlaygroundError::StaleRevision { expected: 0, found: 1, .. })
        ));
        assert_eq!(store.get(&id("a")).map(|c| c.name), Some("first".to_string()));
        Ok(())
    }

    #[test]
    fn test_update_missing_conversation() {
        let store = ConversationStore::new();
        let result = store.update(&id("ghost"), |c| c.messages.len());
        assert!(matches!(result, Err(PlaygroundError::ConversationNotFound(_))));
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_writes() {
        let store = Arc::new(seeded(&["a"]));
        std::thread::scope(|scope| {
            for worker in 0..8 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for n in 0..25 {
                        let text = format!("{worker}-{n}");
                        let mut result = store.update(&id("a"), |c| {
                            c.messages.push(Message::user(text.clone()));
                        });
                        while matches!(result, Err(PlaygroundError::StaleRevision { .. })) {
                            result = store.update(&id("a"), |c| {
                                c.messages.push(Message::user(text.clone()));
                            });
                        }
                    }
                });
            }
        });
        assert_eq!(store.get(&id("a")).map(|c| c.messages.len()), Some(200));
    }

    #[test]
    fn test_reorder_is_dense_and_unique() {
        let store = seeded(&["a", "b", "c", "d"]);
        store.remove(&id("b"));

        let order = store.reorder(&[id("d"), id("a")]).unwrap_or_default();
        assert_eq!(order, vec![id("d"), id("a"), id("c")]);

        let orders: Vec<(ConversationId, u32)> =
            store.list().into_iter().map(|c| (c.id, c.order)).collect();
        assert_eq!(orders, vec![(id("d"), 0), (id("a"), 1), (id("c"), 2)]);
    }

    #[test]
    fn test_reorder_rejects_bad_input() {
        let store = seeded(&["a", "b"]);
        assert!(matches!(
            store.reorder(&[id("a"), id("a")]),
            Err(PlaygroundError::InvalidOrder(_))
        ));
        assert!(matches!(
            store.reorder(&[id("zzz")]),
            Err(PlaygroundError::ConversationNotFound(_))
        ));
    }

    #[test]
    fn test_next_order_after_gaps() {
        let store = seeded(&["a", "b", "c"]);
        store.remove(&id("a"));
        assert_eq!(store.next_order(), 3);
        assert_eq!(ConversationStore::new().next_order(), 0);
    }

    #[test]
    fn test_merge_remote_preserves_in_flight_messages() {
        let store = seeded(&["a", "b", "gone"]);
        let _ = store.update(&id("a"), |c| {
            c.messages.push(Message::user("hello"));
            c.messages.push(Message::assistant_placeholder());
        });

        let remote = vec![
            Conversation::new(id("a"), "renamed", 1),
            Conversation::new(id("b"), "b", 0),
        ];
        let keep: HashSet<ConversationId> = [id("a")].into_iter().collect();
        store.merge_remote(remote, &keep);

        let a = store.get(&id("a"));
        assert_eq!(a.as_ref().map(|c| c.messages.len()), Some(2));
        assert_eq!(a.map(|c| (c.name, c.order)), Some(("renamed".to_string(), 1)));
        assert!(!store.contains(&id("gone")));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_active_view_follows_removal() {
        let store = seeded(&["a", "b"]);
        assert!(store.set_active(&id("b")).is_ok());
        assert_eq!(store.active(), Some(id("b")));
        store.remove(&id("b"));
        assert_eq!(store.active(), None);
        assert!(store.set_active(&id("b")).is_err());
    }

    #[test]
    fn test_remove_image_everywhere() {
        let store = seeded(&["a"]);
        let _ = store.update(&id("a"), |c| {
            let mut reply = Message::assistant_placeholder();
            reply.images = vec!["x.png".to_string(), "y.png".to_string()];
            c.messages.push(reply);
        });
        store.replace_image_snapshot(vec!["x.png".to_string(), "y.png".to_string()]);

        store.remove_image("x.png");

        assert_eq!(store.image_snapshot(), Some(vec!["y.png".to_string()]));
        let images = store
            .get(&id("a"))
            .and_then(|c| c.last_message().map(|m| m.images.clone()));
        assert_eq!(images, Some(vec!["y.png".to_string()]));
    }
}
