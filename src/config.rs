//! Configuration for the playground client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::types::ReplyMode;
use crate::error::{PlaygroundError, PlaygroundResult};

/// Default backend base URL (the chat service's development address).
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:5000/";

/// Message written into the placeholder when a reply cannot be streamed.
pub const DEFAULT_ERROR_MESSAGE: &str =
    "Sorry, something went wrong while contacting the server. Please try again.";

/// Environment variable for the backend base URL.
pub const BACKEND_URL_ENV: &str = "PLAYGROUND_BACKEND_URL";
/// Environment variable for the default reply mode (`search` or `plan`).
pub const MODE_ENV: &str = "PLAYGROUND_MODE";
/// Environment variable for the request timeout in seconds.
pub const TIMEOUT_ENV: &str = "PLAYGROUND_TIMEOUT_SECS";
/// Environment variable for the connect timeout in seconds.
pub const CONNECT_TIMEOUT_ENV: &str = "PLAYGROUND_CONNECT_TIMEOUT_SECS";
/// Environment variable overriding the fallback error message.
pub const ERROR_MESSAGE_ENV: &str = "PLAYGROUND_ERROR_MESSAGE";

/// Configuration for the playground client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaygroundConfig {
    /// Base URL of the chat backend.
    pub backend_url: String,
    /// Reply endpoint used for plain sends.
    pub default_mode: ReplyMode,
    /// Timeout for non-streaming requests.
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,
    /// Connection timeout for every request.
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,
    /// Fixed user-visible text substituted when a reply fails.
    pub error_message: String,
    /// Capacity of the assembler event channel.
    pub event_capacity: usize,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            default_mode: ReplyMode::Search,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            error_message: DEFAULT_ERROR_MESSAGE.to_string(),
            event_capacity: 256,
        }
    }
}

impl PlaygroundConfig {
    /// Create a new config with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from `PLAYGROUND_*` environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable is set but cannot be parsed.
    pub fn from_env() -> PlaygroundResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns an error if a variable is set but cannot be parsed, or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> PlaygroundResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(BACKEND_URL_ENV) {
            config.backend_url = raw.trim().to_string();
        }
        if let Some(raw) = lookup(MODE_ENV) {
            config.default_mode = raw.parse()?;
        }
        if let Some(raw) = lookup(TIMEOUT_ENV) {
            config.request_timeout = parse_secs(TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(CONNECT_TIMEOUT_ENV) {
            config.connect_timeout = parse_secs(CONNECT_TIMEOUT_ENV, &raw)?;
        }
        if let Some(raw) = lookup(ERROR_MESSAGE_ENV) {
            config.error_message = raw;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the backend base URL.
    #[must_use]
    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self
    }

    /// Set the default reply mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ReplyMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the fallback error message.
    #[must_use]
    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Parse the backend URL as a base that relative endpoint paths can be joined onto.
    ///
    /// A trailing slash is added when missing so `search` resolves below the base path.
    ///
    /// # Errors
    /// Returns an error if the URL does not parse or is not http(s).
    pub fn backend_base(&self) -> PlaygroundResult<Url> {
        let mut url = Url::parse(self.backend_url.trim())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PlaygroundError::Config(format!(
                "backend_url must be http or https, got {}",
                url.scheme()
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// Check that the configuration is usable.
    ///
    /// # Errors
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> PlaygroundResult<()> {
        self.backend_base()?;
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(PlaygroundError::Config(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.error_message.trim().is_empty() {
            return Err(PlaygroundError::Config(
                "error_message must not be empty".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(PlaygroundError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_secs(key: &str, raw: &str) -> PlaygroundResult<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| PlaygroundError::Config(format!("{key}: {e}")))
}

/// Serde module for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
