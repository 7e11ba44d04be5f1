//! Shared fakes for integration tests: a scripted model gateway and a recording surface.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use lib::llm::{
    filter_descriptors, ChatMessage, ChatStream, GatewayError, ModelDescriptor, ModelGateway,
    PullProgress, PullStream,
};
use lib::params::GenerationParams;
use lib::surface::ChatSurface;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// How the next `chat_stream` call behaves.
pub enum ChatScript {
    /// Yield these fragments, then end normally.
    Complete(Vec<&'static str>),
    /// Yield these fragments, then fail mid-stream.
    Interrupt(Vec<&'static str>, &'static str),
    /// Fail before any stream is returned.
    Refuse(GatewayError),
    /// Items are fed by the test through the paired sender; dropping it ends the stream.
    Channel(mpsc::UnboundedReceiver<Result<String, GatewayError>>),
}

/// One recorded `chat_stream` call.
#[derive(Debug, Clone)]
pub struct ChatCall {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub params: GenerationParams,
}

#[derive(Default)]
pub struct ScriptedGateway {
    pub local: Mutex<Vec<ModelDescriptor>>,
    pub catalog: Vec<ModelDescriptor>,
    pub offline: bool,
    scripts: Mutex<VecDeque<ChatScript>>,
    calls: Mutex<Vec<ChatCall>>,
}

pub fn local_model(id: &str) -> ModelDescriptor {
    ModelDescriptor {
        id: id.to_string(),
        family: Some("llama".to_string()),
        size_bytes: Some(4_700_000_000),
        is_local: true,
    }
}

impl ScriptedGateway {
    pub fn with_local(ids: &[&str]) -> Self {
        Self {
            local: Mutex::new(ids.iter().map(|id| local_model(id)).collect()),
            catalog: ["llama3", "gpt-oss", "gpt-mini", "mistral"]
                .iter()
                .map(|id| ModelDescriptor::remote(*id))
                .collect(),
            ..Self::default()
        }
    }

    pub fn offline() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn script(&self, s: ChatScript) {
        self.scripts.lock().unwrap().push_back(s);
    }

    /// Queue a channel-driven stream and return its sender.
    pub fn script_channel(&self) -> mpsc::UnboundedSender<Result<String, GatewayError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script(ChatScript::Channel(rx));
        tx
    }

    pub fn calls(&self) -> Vec<ChatCall> {
        self.calls.lock().unwrap().clone()
    }

    fn unavailable() -> GatewayError {
        GatewayError::Unavailable("connection refused".to_string())
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn list_local(&self) -> Result<Vec<ModelDescriptor>, GatewayError> {
        if self.offline {
            return Err(Self::unavailable());
        }
        Ok(self.local.lock().unwrap().clone())
    }

    async fn list_remote(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ModelDescriptor>, GatewayError> {
        filter_descriptors(self.catalog.clone(), filter)
    }

    async fn pull(&self, model_id: &str) -> Result<PullStream, GatewayError> {
        if self.offline {
            return Err(Self::unavailable());
        }
        self.local.lock().unwrap().push(local_model(model_id));
        let frames = vec![
            Ok(PullProgress {
                status: "pulling manifest".to_string(),
                bytes_done: 0,
                bytes_total: 0,
            }),
            Ok(PullProgress {
                status: "downloading".to_string(),
                bytes_done: 50,
                bytes_total: 100,
            }),
            Ok(PullProgress {
                status: "success".to_string(),
                bytes_done: 100,
                bytes_total: 100,
            }),
        ];
        Ok(stream::iter(frames).boxed())
    }

    async fn delete(&self, model_id: &str) -> Result<(), GatewayError> {
        let mut local = self.local.lock().unwrap();
        let before = local.len();
        local.retain(|m| m.id != model_id);
        if local.len() == before {
            return Err(GatewayError::NotFound(model_id.to_string()));
        }
        Ok(())
    }

    async fn chat_stream(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<ChatStream, GatewayError> {
        self.calls.lock().unwrap().push(ChatCall {
            model: model_id.to_string(),
            messages,
            params: params.clone(),
        });
        if self.offline {
            return Err(Self::unavailable());
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ChatScript::Complete(vec!["ok"]));
        match script {
            ChatScript::Complete(frags) => {
                let items: Vec<Result<String, GatewayError>> =
                    frags.into_iter().map(|f| Ok(f.to_string())).collect();
                Ok(stream::iter(items).boxed())
            }
            ChatScript::Interrupt(frags, reason) => {
                let partial: String = frags.concat();
                let mut items: Vec<Result<String, GatewayError>> =
                    frags.into_iter().map(|f| Ok(f.to_string())).collect();
                items.push(Err(GatewayError::StreamInterrupted {
                    partial,
                    reason: reason.to_string(),
                }));
                Ok(stream::iter(items).boxed())
            }
            ChatScript::Refuse(e) => Err(e),
            ChatScript::Channel(rx) => Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Increment(String, String),
    Final(String, String, bool),
    Error(String, String),
    Progress(String, String, u64, u64),
    Notice(String, String),
}

#[derive(Default)]
pub struct RecordingSurface {
    events: Mutex<Vec<Rendered>>,
}

impl RecordingSurface {
    pub fn events(&self) -> Vec<Rendered> {
        self.events.lock().unwrap().clone()
    }

    pub fn increments(&self, session: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Rendered::Increment(s, f) if s == session => Some(f),
                _ => None,
            })
            .collect()
    }

    pub fn finals(&self, session: &str) -> Vec<(String, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Rendered::Final(s, t, truncated) if s == session => Some((t, truncated)),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, session: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Rendered::Error(s, m) if s == session => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self, session: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Rendered::Notice(s, c) if s == session => Some(c),
                _ => None,
            })
            .collect()
    }

    /// Poll until `cond` holds (up to 2s).
    pub async fn wait_until(&self, cond: impl Fn(&[Rendered]) -> bool) {
        for _ in 0..200 {
            if cond(&self.events()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("surface condition not met; events: {:?}", self.events());
    }

    fn push(&self, e: Rendered) {
        self.events.lock().unwrap().push(e);
    }
}

impl ChatSurface for RecordingSurface {
    fn render_increment(&self, session_id: &str, fragment: &str) {
        self.push(Rendered::Increment(session_id.into(), fragment.into()));
    }

    fn render_final(&self, session_id: &str, full_text: &str, truncated: bool) {
        self.push(Rendered::Final(session_id.into(), full_text.into(), truncated));
    }

    fn render_error(&self, session_id: &str, message: &str) {
        self.push(Rendered::Error(session_id.into(), message.into()));
    }

    fn render_progress(&self, session_id: &str, model: &str, done: u64, total: u64) {
        self.push(Rendered::Progress(session_id.into(), model.into(), done, total));
    }

    fn render_notice(&self, session_id: &str, content: &str) {
        self.push(Rendered::Notice(session_id.into(), content.into()));
    }
}
