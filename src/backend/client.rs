//! Backend client: the capability trait and its reqwest implementation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::PlaygroundConfig;
use crate::conversation::ids::ConversationId;
use crate::conversation::types::Message;
use crate::error::{PlaygroundError, PlaygroundResult};

use super::stream::{ReplyStream, cumulative_stream};
use super::types::{
    AddMessageRequest, ConversationRecord, CreatedConversation, DeleteConversationRequest,
    ImageListing, LinksQuery, NewConversationRequest, NewsQuery, OrderRequest, ReplyMode,
    ReplyRequest,
};

/// Boxed future type for backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Operations the chat backend provides.
pub trait ChatBackend: Send + Sync {
    /// Start a reply and return its cumulative text stream.
    fn open_reply(
        &self,
        mode: ReplyMode,
        request: ReplyRequest,
    ) -> BackendFuture<'_, PlaygroundResult<ReplyStream>>;

    /// Fetch every stored conversation keyed by id.
    fn list_conversations(
        &self,
    ) -> BackendFuture<'_, PlaygroundResult<HashMap<ConversationId, ConversationRecord>>>;

    /// Create a conversation.
    fn create_conversation(&self, name: &str) -> BackendFuture<'_, PlaygroundResult<CreatedConversation>>;

    /// Delete a conversation.
    fn delete_conversation(&self, id: &ConversationId) -> BackendFuture<'_, PlaygroundResult<()>>;

    /// Persist one message into a conversation.
    fn add_message(
        &self,
        id: &ConversationId,
        message: &Message,
    ) -> BackendFuture<'_, PlaygroundResult<()>>;

    /// Persist the sidebar order.
    fn save_order(&self, order: &[ConversationId]) -> BackendFuture<'_, PlaygroundResult<()>>;

    /// List generated image filenames.
    fn list_images(&self) -> BackendFuture<'_, PlaygroundResult<Vec<String>>>;

    /// Delete one generated image.
    fn delete_image(&self, name: &str) -> BackendFuture<'_, PlaygroundResult<()>>;

    /// URL an image can be fetched from.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be built.
    fn image_url(&self, name: &str) -> PlaygroundResult<Url>;
}

/// reqwest implementation of [`ChatBackend`].
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
    config: PlaygroundConfig,
}

impl HttpBackend {
    /// Create a backend client from the configuration.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: PlaygroundConfig) -> PlaygroundResult<Self> {
        let base = config.backend_base()?;
        let client = Self::build_client(&config)?;
        Ok(Self {
            client,
            base,
            config,
        })
    }

    /// Base URL every endpoint is resolved against.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base
    }

    fn build_client(config: &PlaygroundConfig) -> PlaygroundResult<reqwest::Client> {
        let mut headers = HeaderMap::new();
        let agent = format!("brave-playground/{}", env!("CARGO_PKG_VERSION"));
        if let Ok(value) = HeaderValue::from_str(&agent) {
            headers.insert(USER_AGENT, value);
        }

        // No overall timeout: replies stream for as long as the agent works.
        reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(PlaygroundError::from)
    }

    fn endpoint(&self, path: &str) -> PlaygroundResult<Url> {
        Ok(self.base.join(path)?)
    }

    fn check_status(path: &str, response: reqwest::Response) -> PlaygroundResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(PlaygroundError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            })
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> PlaygroundResult<T> {
        let response = self
            .client
            .get(self.endpoint(path)?)
            .header(ACCEPT, "application/json")
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        let response = Self::check_status(path, response)?;
        Ok(response.json().await?)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> PlaygroundResult<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint(path)?)
            .json(body)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        Self::check_status(path, response)
    }

    /// Ask the backend for recent news on a topic.
    ///
    /// The payload is the backend's tool output and is returned untouched.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    pub async fn news(&self, query: &NewsQuery) -> PlaygroundResult<serde_json::Value> {
        let response = self.post_json("news", query).await?;
        Ok(response.json().await?)
    }

    /// Ask the backend for interesting links on a topic.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    pub async fn links(&self, query: &LinksQuery) -> PlaygroundResult<serde_json::Value> {
        let response = self.post_json("links", query).await?;
        Ok(response.json().await?)
    }
}

impl ChatBackend for HttpBackend {
    fn open_reply(
        &self,
        mode: ReplyMode,
        request: ReplyRequest,
    ) -> BackendFuture<'_, PlaygroundResult<ReplyStream>> {
        Box::pin(async move {
            let path = mode.path();
            debug!(%mode, history = request.chat_history.len(), "Opening reply stream");
            let response = self
                .client
                .post(self.endpoint(path)?)
                .header(ACCEPT, "text/plain")
                .json(&request)
                .send()
                .await?;
            let response = Self::check_status(path, response)?;
            Ok(cumulative_stream(response.bytes_stream()))
        })
    }

    fn list_conversations(
        &self,
    ) -> BackendFuture<'_, PlaygroundResult<HashMap<ConversationId, ConversationRecord>>> {
        Box::pin(async move { self.get_json("conversations").await })
    }

    fn create_conversation(&self, name: &str) -> BackendFuture<'_, PlaygroundResult<CreatedConversation>> {
        let name = name.to_string();
        Box::pin(async move {
            let response = self
                .post_json("conversation/new", &NewConversationRequest { name: &name })
                .await?;
            Ok(response.json().await?)
        })
    }

    fn delete_conversation(&self, id: &ConversationId) -> BackendFuture<'_, PlaygroundResult<()>> {
        let id = id.clone();
        Box::pin(async move {
            self.post_json("conversation/delete", &DeleteConversationRequest { id: &id })
                .await?;
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
            self.post_json(
                "conversation/add_message",
                &AddMessageRequest {
                    id: &id,
                    message: &message,
                },
            )
            .await?;
            Ok(())
        })
    }

    fn save_order(&self, order: &[ConversationId]) -> BackendFuture<'_, PlaygroundResult<()>> {
        let order = order.to_vec();
        Box::pin(async move {
            self.post_json("conversations/order", &OrderRequest { order: &order })
                .await?;
            Ok(())
        })
    }

    fn list_images(&self) -> BackendFuture<'_, PlaygroundResult<Vec<String>>> {
        Box::pin(async move {
            let listing: ImageListing = self.get_json("images_list").await?;
            Ok(listing.images)
        })
    }

    fn delete_image(&self, name: &str) -> BackendFuture<'_, PlaygroundResult<()>> {
        let name = name.to_string();
        Box::pin(async move {
            let url = self.image_url(&name)?;
            let response = self
                .client
                .delete(url)
                .timeout(self.config.request_timeout)
                .send()
                .await?;
            Self::check_status("images", response)?;
            Ok(())
        })
    }

    fn image_url(&self, name: &str) -> PlaygroundResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| PlaygroundError::Config(format!("{} cannot be a base", self.base)))?
            .pop_if_empty()
            .push("images")
            .push(name);
        Ok(url)
    }
}
