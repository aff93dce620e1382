//! Application root wiring the backend, store, manager and assembler together.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::assembler::events::AssemblerEvent;
use crate::assembler::reply::StreamingReplyAssembler;
use crate::assembler::session::{SessionOutcome, SessionRegistry};
use crate::backend::client::{ChatBackend, HttpBackend};
use crate::backend::types::{LinksQuery, NewsQuery, ReplyMode};
use crate::config::PlaygroundConfig;
use crate::conversation::ids::ConversationId;
use crate::conversation::manager::ConversationManager;
use crate::conversation::store::ConversationStore;
use crate::conversation::types::Conversation;
use crate::error::{PlaygroundError, PlaygroundResult};

/// The single object a front end holds.
pub struct Playground {
    config: PlaygroundConfig,
    http: Option<Arc<HttpBackend>>,
    store: Arc<ConversationStore>,
    sessions: Arc<SessionRegistry>,
    assembler: Arc<StreamingReplyAssembler>,
    manager: ConversationManager,
}

impl Playground {
    /// Build a playground talking to the HTTP backend named in `config`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client cannot be built.
    pub fn new(config: PlaygroundConfig) -> PlaygroundResult<Self> {
        config.validate()?;
        let http = Arc::new(HttpBackend::new(config.clone())?);
        info!(backend = %http.base_url(), mode = %config.default_mode, "Playground ready");
        let backend: Arc<dyn ChatBackend> = Arc::clone(&http) as Arc<dyn ChatBackend>;
        Ok(Self::assemble(config, backend, Some(http)))
    }

    /// Build a playground over any backend implementation.
    #[must_use]
    pub fn with_backend(config: PlaygroundConfig, backend: Arc<dyn ChatBackend>) -> Self {
        Self::assemble(config, backend, None)
    }

    fn assemble(
        config: PlaygroundConfig,
        backend: Arc<dyn ChatBackend>,
        http: Option<Arc<HttpBackend>>,
    ) -> Self {
        let store = Arc::new(ConversationStore::new());
        let sessions = Arc::new(SessionRegistry::new());
        let assembler = Arc::new(StreamingReplyAssembler::new(
            Arc::clone(&backend),
            Arc::clone(&store),
            Arc::clone(&sessions),
            &config,
        ));
        let manager = ConversationManager::new(backend, Arc::clone(&store), Arc::clone(&sessions));
        Self {
            config,
            http,
            store,
            sessions,
            assembler,
            manager,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &PlaygroundConfig {
        &self.config
    }

    /// Shared conversation store.
    #[must_use]
    pub const fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Conversation lifecycle operations.
    #[must_use]
    pub const fn manager(&self) -> &ConversationManager {
        &self.manager
    }

    /// Reply assembler.
    #[must_use]
    pub const fn assembler(&self) -> &Arc<StreamingReplyAssembler> {
        &self.assembler
    }

    /// Load conversations from the backend.
    ///
    /// # Errors
    /// Returns an error if the listing cannot be fetched.
    pub async fn load(&self) -> PlaygroundResult<Vec<Conversation>> {
        self.manager.load().await
    }

    /// Conversation currently shown.
    #[must_use]
    pub fn active(&self) -> Option<Conversation> {
        self.store.active_view()
    }

    /// Subscribe to reply progress.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AssemblerEvent> {
        self.assembler.subscribe()
    }

    /// Whether the conversation waits for the first token of its reply.
    #[must_use]
    pub fn is_loading(&self, id: &ConversationId) -> bool {
        self.assembler.is_loading(id)
    }

    /// Send `text` to the active conversation with the configured default mode.
    ///
    /// # Errors
    /// Returns `NoActiveConversation` when nothing is selected, or the errors of
    /// [`StreamingReplyAssembler::send`].
    pub async fn send(&self, text: &str) -> PlaygroundResult<SessionOutcome> {
        self.send_with_mode(text, self.config.default_mode).await
    }

    /// Send `text` to the active conversation through the given reply endpoint.
    ///
    /// The target is fixed when the send starts; switching conversations
    /// afterwards does not move the reply.
    ///
    /// # Errors
    /// Returns `NoActiveConversation` when nothing is selected, or the errors of
    /// [`StreamingReplyAssembler::send`].
    pub async fn send_with_mode(&self, text: &str, mode: ReplyMode) -> PlaygroundResult<SessionOutcome> {
        let target = self.store.active().ok_or(PlaygroundError::NoActiveConversation)?;
        self.assembler.send(&target, text, mode).await
    }

    /// Recent news on a topic, as returned by the backend.
    ///
    /// # Errors
    /// Returns an error without an HTTP backend or if the request fails.
    pub async fn news(&self, query: &str) -> PlaygroundResult<serde_json::Value> {
        self.http_backend()?.news(&NewsQuery::new(query)).await
    }

    /// Interesting links on a topic, as returned by the backend.
    ///
    /// # Errors
    /// Returns an error without an HTTP backend or if the request fails.
    pub async fn links(&self, query: &str) -> PlaygroundResult<serde_json::Value> {
        self.http_backend()?.links(&LinksQuery::new(query)).await
    }

    fn http_backend(&self) -> PlaygroundResult<&HttpBackend> {
        self.http
            .as_deref()
            .ok_or_else(|| PlaygroundError::Config("news and links need the HTTP backend".to_string()))
    }

    /// Cancel every reply still streaming.
    pub fn shutdown(&self) {
        self.sessions.cancel_all();
    }
}
