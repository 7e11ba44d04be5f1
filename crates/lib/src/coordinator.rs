//! Streaming coordinator: drives one generation from request to terminal state.
//!
//! Phases run `Idle -> Requesting -> Streaming -> {Completed, Cancelled, Failed}`. The
//! coordinator only talks to the gateway and the surface. Recording the outcome in the session
//! (and clearing the `streaming` flag) is the caller's job, see `StreamOutcome::turn`; the
//! caller then calls `report`, so a client reacting to the terminal event finds the session idle.

use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::conversation::Turn;
use crate::llm::{ChatMessage, GatewayError, ModelGateway};
use crate::params::GenerationParams;
use crate::surface::ChatSurface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Requesting,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl StreamPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamPhase::Completed | StreamPhase::Cancelled | StreamPhase::Failed
        )
    }
}

/// How a generation ended, with whatever text was produced.
#[derive(Debug)]
pub enum StreamOutcome {
    Completed(String),
    Cancelled(String),
    Failed { partial: String, error: GatewayError },
}

impl StreamOutcome {
    pub fn phase(&self) -> StreamPhase {
        match self {
            StreamOutcome::Completed(_) => StreamPhase::Completed,
            StreamOutcome::Cancelled(_) => StreamPhase::Cancelled,
            StreamOutcome::Failed { .. } => StreamPhase::Failed,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            StreamOutcome::Completed(t) | StreamOutcome::Cancelled(t) => t,
            StreamOutcome::Failed { partial, .. } => partial,
        }
    }

    /// Assistant turn to append. Early endings keep their partial text as a truncated turn;
    /// an early ending with no text adds nothing.
    pub fn turn(&self) -> Option<Turn> {
        match self {
            StreamOutcome::Completed(text) => Some(Turn::assistant(text.as_str())),
            StreamOutcome::Cancelled(partial) | StreamOutcome::Failed { partial, .. } => {
                (!partial.is_empty()).then(|| Turn::truncated(partial.as_str()))
            }
        }
    }
}

/// Messages for one request: system prompt (if any), prior turns, then the new user text.
pub fn build_prompt(
    params: &GenerationParams,
    history: &[Turn],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(prompt) = params.system_prompt() {
        messages.push(ChatMessage::system(prompt));
    }
    messages.extend(history.iter().map(ChatMessage::from));
    messages.push(ChatMessage::user(user_text));
    messages
}

pub struct StreamCoordinator {
    gateway: Arc<dyn ModelGateway>,
    surface: Arc<dyn ChatSurface>,
    session_id: String,
    phase: StreamPhase,
}

impl StreamCoordinator {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        surface: Arc<dyn ChatSurface>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            surface,
            session_id: session_id.into(),
            phase: StreamPhase::Idle,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    fn transition(&mut self, next: StreamPhase) {
        log::debug!(
            "session {} stream {:?} -> {:?}",
            self.session_id,
            self.phase,
            next
        );
        self.phase = next;
    }

    /// Run one generation to a terminal state, rendering increments as they arrive. Cancellation
    /// is observed while waiting for the request and between increments.
    pub async fn run(
        &mut self,
        model_id: &str,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
        cancel: CancellationToken,
    ) -> StreamOutcome {
        self.transition(StreamPhase::Requesting);
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.gateway.chat_stream(model_id, messages, params) => Some(r),
        };
        let mut stream = match opened {
            None => return self.cancelled(String::new()),
            Some(Err(e)) => return self.failed(String::new(), e),
            Some(Ok(stream)) => stream,
        };
        self.transition(StreamPhase::Streaming);

        let mut buffer = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                item = stream.next() => Some(item),
            };
            match next {
                None => {
                    // Close the HTTP body before recording anything.
                    drop(stream);
                    return self.cancelled(buffer);
                }
                Some(Some(Ok(fragment))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    self.surface.render_increment(&self.session_id, &fragment);
                    buffer.push_str(&fragment);
                }
                Some(Some(Err(e))) => {
                    drop(stream);
                    return self.failed(buffer, e);
                }
                Some(None) => {
                    self.transition(StreamPhase::Completed);
                    return StreamOutcome::Completed(buffer);
                }
            }
        }
    }

    /// Render the terminal event for `outcome`.
    pub fn report(&self, outcome: &StreamOutcome) {
        match outcome {
            StreamOutcome::Completed(text) => {
                self.surface.render_final(&self.session_id, text, false)
            }
            StreamOutcome::Cancelled(partial) => {
                self.surface.render_final(&self.session_id, partial, true)
            }
            StreamOutcome::Failed { error, .. } => {
                self.surface.render_error(&self.session_id, &error.to_string())
            }
        }
    }

    fn cancelled(&mut self, partial: String) -> StreamOutcome {
        self.transition(StreamPhase::Cancelled);
        StreamOutcome::Cancelled(partial)
    }

    fn failed(&mut self, partial: String, error: GatewayError) -> StreamOutcome {
        self.transition(StreamPhase::Failed);
        log::warn!("session {} generation failed: {}", self.session_id, error);
        StreamOutcome::Failed { partial, error }
    }
}
