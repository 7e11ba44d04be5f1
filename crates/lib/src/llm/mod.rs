//! Model gateway: the boundary to the local LLM daemon.
//!
//! `ModelGateway` is what the rest of the crate talks to; `OllamaClient` implements it against
//! the Ollama HTTP API. Daemon payloads are normalized here into `ModelDescriptor`,
//! `PullProgress` and plain text increments so nothing past this module looks at raw JSON.

mod catalog;
mod ollama;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::conversation::Turn;
use crate::params::GenerationParams;

pub use catalog::{filter_descriptors, DEFAULT_CATALOG};
pub use ollama::OllamaClient;

/// Lazy stream of text increments for one generation.
pub type ChatStream = BoxStream<'static, Result<String, GatewayError>>;

/// Lazy stream of download progress for one pull.
pub type PullStream = BoxStream<'static, Result<PullProgress, GatewayError>>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("ollama is not reachable ({0}); start it with `ollama serve`")]
    Unavailable(String),
    #[error("invalid filter pattern: {0}")]
    InvalidFilter(String),
    #[error("pull of {model} failed: {reason}")]
    PullFailed { model: String, reason: String },
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("generation interrupted: {reason}")]
    StreamInterrupted { partial: String, reason: String },
    #[error("ollama api error: {0}")]
    Api(String),
    #[error("unexpected response from ollama: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            GatewayError::Unavailable(e.to_string())
        } else if e.is_decode() {
            GatewayError::Decode(e.to_string())
        } else {
            GatewayError::Api(e.to_string())
        }
    }
}

/// A model known to the daemon (local) or pullable from the registry (remote).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    pub is_local: bool,
}

impl ModelDescriptor {
    pub fn remote(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            family: None,
            size_bytes: None,
            is_local: false,
        }
    }
}

/// Model id without its tag (`llama3:latest` -> `llama3`).
pub fn base_name(id: &str) -> &str {
    id.split(':').next().unwrap_or(id)
}

/// One progress frame of a model download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullProgress {
    pub status: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

impl PullProgress {
    /// Whole-number percentage, 0 when the total is not known yet.
    pub fn percent(&self) -> u64 {
        if self.bytes_total == 0 {
            0
        } else {
            (self.bytes_done.min(self.bytes_total) * 100) / self.bytes_total
        }
    }
}

/// Role + content pair sent to the daemon as part of a chat request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

impl From<&Turn> for ChatMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
        }
    }
}

/// Operations the chat core needs from the LLM daemon. Implementations must be safe to share
/// across sessions; each call is independent.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    /// Models installed locally.
    async fn list_local(&self) -> Result<Vec<ModelDescriptor>, GatewayError>;

    /// Pullable models, optionally filtered by a case-insensitive regex on the id.
    async fn list_remote(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ModelDescriptor>, GatewayError>;

    /// Start downloading a model. The stream ends after the final progress frame, or with
    /// `PullFailed`.
    async fn pull(&self, model_id: &str) -> Result<PullStream, GatewayError>;

    async fn delete(&self, model_id: &str) -> Result<(), GatewayError>;

    /// Start a streamed generation. Each item is a non-empty text fragment; a mid-stream failure
    /// is yielded as `StreamInterrupted` carrying the text emitted so far.
    async fn chat_stream(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<ChatStream, GatewayError>;
}
