//! Scriptable in-memory backend for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use url::Url;

use crate::conversation::ids::ConversationId;
use crate::conversation::types::Message;
use crate::error::{PlaygroundError, PlaygroundResult};

use super::client::{BackendFuture, ChatBackend};
use super::stream::{ReplyStream, cumulative_stream};
use super::types::{ConversationRecord, CreatedConversation, ReplyMode, ReplyRequest};

/// How the next `open_reply` call behaves.
pub enum ScriptedReply {
    /// Stream these raw chunks, then end the body.
    Chunks(Vec<&'static str>),
    /// Stream these chunks, then fail the body read.
    BreakAfter(Vec<&'static str>),
    /// Stream these chunks, then never yield again.
    Stall(Vec<&'static str>),
    /// Fail before any response arrives.
    Refuse,
}

#[derive(Default)]
pub struct FakeState {
    pub replies: VecDeque<ScriptedReply>,
    pub image_listings: VecDeque<Vec<String>>,
    pub last_listing: Vec<String>,
    pub fail_listing: bool,
    pub fail_delete: bool,
    pub requests: Vec<(ReplyMode, ReplyRequest)>,
    pub persisted: Vec<(ConversationId, Message)>,
    pub conversations: HashMap<ConversationId, ConversationRecord>,
    pub orders: Vec<Vec<ConversationId>>,
    pub deleted: Vec<ConversationId>,
    pub deleted_images: Vec<String>,
    pub next_id: u32,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

fn transport_error(what: &str) -> PlaygroundError {
    PlaygroundError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        what.to_string(),
    ))
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn script(&self, reply: ScriptedReply) {
        self.state().replies.push_back(reply);
    }

    /// Queue image listings returned by successive `list_images` calls; the last
    /// one repeats.
    pub fn listings(&self, listings: &[&[&str]]) {
        let mut state = self.state();
        for listing in listings {
            state
                .image_listings
                .push_back(listing.iter().map(|name| (*name).to_string()).collect());
        }
    }
}

impl ChatBackend for FakeBackend {
    fn open_reply(
        &self,
        mode: ReplyMode,
        request: ReplyRequest,
    ) -> BackendFuture<'_, PlaygroundResult<ReplyStream>> {
        Box::pin(async move {
            let reply = {
                let mut state = self.state();
                state.requests.push((mode, request));
                state
                    .replies
                    .pop_front()
                    .unwrap_or(ScriptedReply::Chunks(Vec::new()))
            };
            match reply {
                ScriptedReply::Chunks(parts) => {
                    let items: Vec<PlaygroundResult<&'static str>> =
                        parts.into_iter().map(Ok).collect();
                    Ok(cumulative_stream(futures::stream::iter(items)))
                }
                ScriptedReply::BreakAfter(parts) => {
                    let mut items: Vec<PlaygroundResult<&'static str>> =
                        parts.into_iter().map(Ok).collect();
                    items.push(Err(transport_error("stream reset")));
                    Ok(cumulative_stream(futures::stream::iter(items)))
                }
                ScriptedReply::Stall(parts) => {
                    let items: Vec<PlaygroundResult<&'static str>> =
                        parts.into_iter().map(Ok).collect();
                    let stalled = futures::stream::iter(items).chain(futures::stream::pending());
                    Ok(cumulative_stream(stalled))
                }
                ScriptedReply::Refuse => Err(transport_error("connection refused")),
            }
        })
    }

    fn list_conversations(
        &self,
    ) -> BackendFuture<'_, PlaygroundResult<HashMap<ConversationId, ConversationRecord>>> {
        Box::pin(async move { Ok(self.state().conversations.clone()) })
    }

    fn create_conversation(
        &self,
        name: &str,
    ) -> BackendFuture<'_, PlaygroundResult<CreatedConversation>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut state = self.state();
            state.next_id += 1;
            let id = ConversationId::new(format!("conv-{}", state.next_id));
            state.conversations.insert(
                id.clone(),
                ConversationRecord {
                    name: name.clone(),
                    messages: Vec::new(),
                    order: None,
                },
            );
            Ok(CreatedConversation { id, name })
        })
    }

    fn delete_conversation(&self, id: &ConversationId) -> BackendFuture<'_, PlaygroundResult<()>> {
        let id = id.clone();
        Box::pin(async move {
            let mut state = self.state();
            if state.fail_delete {
                return Err(transport_error("delete refused"));
            }
            state.conversations.remove(&id);
            state.deleted.push(id);
            Ok(())
        })
    }

    fn add_message(
        &self,
        id: &ConversationId,
        message: &Message,
    ) -> BackendFuture<'_, PlaygroundResult<()>> {
        let id = id.clone();
        let message = message.clone();
        Box::pin(async move {
            self.state().persisted.push((id, message));
            Ok(())
        })
    }

    fn save_order(&self, order: &[ConversationId]) -> BackendFuture<'_, PlaygroundResult<()>> {
        let order = order.to_vec();
        Box::pin(async move {
            self.state().orders.push(order);
            Ok(())
        })
    }

    fn list_images(&self) -> BackendFuture<'_, PlaygroundResult<Vec<String>>> {
        Box::pin(async move {
            let mut state = self.state();
            if state.fail_listing {
                return Err(transport_error("listing unavailable"));
            }
            if let Some(next) = state.image_listings.pop_front() {
                state.last_listing = next;
            }
            Ok(state.last_listing.clone())
        })
    }

    fn delete_image(&self, name: &str) -> BackendFuture<'_, PlaygroundResult<()>> {
        let name = name.to_string();
        Box::pin(async move {
            self.state().deleted_images.push(name);
            Ok(())
        })
    }

    fn image_url(&self, name: &str) -> PlaygroundResult<Url> {
        Ok(Url::parse("http://fake.local/images/")?.join(name)?)
    }
}
