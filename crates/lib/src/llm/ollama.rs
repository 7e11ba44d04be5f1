//! Ollama API client (http://127.0.0.1:11434 by default).
//! Chat and pull are streamed as NDJSON; list and delete are plain JSON calls.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::catalog::{filter_descriptors, DEFAULT_CATALOG};
use super::{
    base_name, ChatMessage, ChatStream, GatewayError, ModelDescriptor, ModelGateway,
    PullProgress, PullStream,
};
use crate::params::GenerationParams;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
    catalog: Vec<String>,
}

impl OllamaClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
            catalog: DEFAULT_CATALOG.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the pullable catalog used by `list_remote`. An empty list keeps the default.
    pub fn with_catalog(mut self, catalog: Vec<String>) -> Self {
        if !catalog.is_empty() {
            self.catalog = catalog;
        }
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn error_body(res: reqwest::Response) -> String {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        format!("{} {}", status, message.trim())
    }
}

#[async_trait]
impl ModelGateway for OllamaClient {
    /// GET /api/tags
    async fn list_local(&self) -> Result<Vec<ModelDescriptor>, GatewayError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            return Err(GatewayError::Api(Self::error_body(res).await));
        }
        let data: TagsResponse = res.json().await?;
        let models: Vec<ModelDescriptor> = data
            .models
            .unwrap_or_default()
            .into_iter()
            .filter_map(TagModel::into_descriptor)
            .collect();
        log::debug!("ollama: {} local model(s)", models.len());
        Ok(models)
    }

    async fn list_remote(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ModelDescriptor>, GatewayError> {
        let catalog = self
            .catalog
            .iter()
            .map(|id| ModelDescriptor::remote(id.as_str()))
            .collect();
        let mut models = filter_descriptors(catalog, filter)?;
        if models.is_empty() {
            return Ok(models);
        }
        match self.list_local().await {
            Ok(local) => {
                for m in &mut models {
                    m.is_local = local.iter().any(|l| is_same_install(&m.id, &l.id));
                }
            }
            Err(e) => log::debug!("ollama: local listing for catalog skipped: {}", e),
        }
        Ok(models)
    }

    /// POST /api/pull with stream: true.
    async fn pull(&self, model_id: &str) -> Result<PullStream, GatewayError> {
        let url = format!("{}/api/pull", self.base_url);
        let body = PullRequest {
            model: model_id.to_string(),
            stream: true,
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            return Err(GatewayError::PullFailed {
                model: model_id.to_string(),
                reason: Self::error_body(res).await,
            });
        }
        log::info!("ollama: pulling {}", model_id);
        let model = model_id.to_string();
        let mut bytes = res.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::default();
            let mut total = 0u64;
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(GatewayError::PullFailed { model: model.clone(), reason: e.to_string() });
                        return;
                    }
                };
                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    let frame: PullFrame = match serde_json::from_str(&line) {
                        Ok(f) => f,
                        Err(e) => {
                            log::debug!("ollama: skipping pull frame ({}): {}", e, line);
                            continue;
                        }
                    };
                    if let Some(reason) = frame.error {
                        yield Err(GatewayError::PullFailed { model: model.clone(), reason });
                        return;
                    }
                    if let Some(t) = frame.total {
                        total = t;
                    }
                    let status = frame.status.unwrap_or_default();
                    if status == "success" {
                        yield Ok(PullProgress { status, bytes_done: total, bytes_total: total });
                        return;
                    }
                    yield Ok(PullProgress {
                        status,
                        bytes_done: frame.completed.unwrap_or(0),
                        bytes_total: total,
                    });
                }
            }
            yield Err(GatewayError::PullFailed {
                model: model.clone(),
                reason: "stream closed before completion".to_string(),
            });
        };
        Ok(Box::pin(stream))
    }

    /// DELETE /api/delete
    async fn delete(&self, model_id: &str) -> Result<(), GatewayError> {
        let url = format!("{}/api/delete", self.base_url);
        let body = DeleteRequest {
            model: model_id.to_string(),
        };
        let res = self.client.delete(&url).json(&body).send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(model_id.to_string()));
        }
        if !res.status().is_success() {
            return Err(GatewayError::Api(Self::error_body(res).await));
        }
        log::info!("ollama: deleted {}", model_id);
        Ok(())
    }

    /// POST /api/chat with stream: true. Each NDJSON frame's `message.content` is one increment;
    /// the frame with `done: true` ends the generation.
    async fn chat_stream(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<ChatStream, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest::new(model_id, messages, params);
        log::debug!(
            "ollama: chat with {} ({} message(s), options {:?})",
            model_id,
            body.messages.len(),
            body.options
        );
        let res = self.client.post(&url).json(&body).send().await?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(model_id.to_string()));
        }
        if !res.status().is_success() {
            return Err(GatewayError::Api(Self::error_body(res).await));
        }
        let mut bytes = res.bytes_stream();
        let stream = async_stream::stream! {
            let mut lines = LineBuffer::default();
            let mut emitted = String::new();
            let mut finished = false;
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(GatewayError::StreamInterrupted { partial: emitted.clone(), reason: e.to_string() });
                        return;
                    }
                };
                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    let frame: ChatFrame = match serde_json::from_str(&line) {
                        Ok(f) => f,
                        Err(e) => {
                            log::debug!("ollama: skipping chat frame ({}): {}", e, line);
                            continue;
                        }
                    };
                    if let Some(reason) = frame.error {
                        yield Err(GatewayError::StreamInterrupted { partial: emitted.clone(), reason });
                        return;
                    }
                    if let Some(msg) = frame.message {
                        if !msg.content.is_empty() {
                            emitted.push_str(&msg.content);
                            yield Ok(msg.content);
                        }
                    }
                    if frame.done {
                        finished = true;
                        break 'read;
                    }
                }
            }
            if !finished {
                yield Err(GatewayError::StreamInterrupted {
                    partial: emitted,
                    reason: "stream closed before completion".to_string(),
                });
            }
        };
        Ok(Box::pin(stream))
    }
}

/// True when a catalog id refers to the same install as a local id (`mistral` ~ `mistral:latest`).
fn is_same_install(catalog_id: &str, local_id: &str) -> bool {
    if catalog_id == local_id {
        return true;
    }
    !catalog_id.contains(':') && base_name(local_id) == catalog_id && local_id.ends_with(":latest")
}

/// Splits a byte stream into trimmed, non-empty lines.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            let i = self.buf.iter().position(|&b| b == b'\n')?;
            let line_bytes: Vec<u8> = self.buf.drain(..i).collect();
            self.buf.drain(..1);
            let line = String::from_utf8_lossy(&line_bytes).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

/// Ollama's option names: the generation cap is `num_predict`.
#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl ChatRequest {
    fn new(model: &str, messages: Vec<ChatMessage>, params: &GenerationParams) -> Self {
        Self {
            model: model.to_string(),
            messages,
            stream: true,
            options: ChatOptions {
                temperature: params.temperature(),
                top_p: params.nucleus_p(),
                num_predict: params.max_tokens(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatFrame {
    #[serde(default)]
    message: Option<FrameMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct PullRequest {
    model: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct PullFrame {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    completed: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeleteRequest {
    model: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Option<Vec<TagModel>>,
}

/// Entry of /api/tags. Older daemons only send `name`; newer ones send both `name` and `model`.
#[derive(Debug, Deserialize)]
struct TagModel {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    details: Option<TagDetails>,
}

#[derive(Debug, Deserialize)]
struct TagDetails {
    #[serde(default)]
    family: Option<String>,
}

impl TagModel {
    fn into_descriptor(self) -> Option<ModelDescriptor> {
        let id = self
            .model
            .filter(|s| !s.trim().is_empty())
            .or(self.name.filter(|s| !s.trim().is_empty()));
        let Some(id) = id else {
            log::warn!("ollama: model entry without name or model field, skipped");
            return None;
        };
        Some(ModelDescriptor {
            id,
            family: self.details.and_then(|d| d.family),
            size_bytes: self.size,
            is_local: true,
        })
    }
}
