//! Per-session chat state and the keyed table that owns it.
//!
//! Each session has its own lock; operations on one session never wait on another. The
//! `streaming` flag on a session is the only mutual exclusion between chat requests: it is set
//! under the lock before any await and cleared when the stream reaches a terminal state.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::conversation::{Conversation, Role, Turn};
use crate::llm::{base_name, ModelDescriptor};
use crate::params::GenerationParams;

/// Unique session identifier (opaque string).
pub type SessionId = String;

/// Shared handle to one session's state.
pub type SessionHandle = Arc<Mutex<SessionState>>;

/// Generate a fresh session id.
pub fn new_session_id() -> SessionId {
    format!("sess-{}", uuid::Uuid::new_v4())
}

/// Session ids double as file names for persistence: ASCII letters, digits, `-`, `_` and `.`,
/// not starting with a dot, at most 128 characters.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Outcome of matching a requested model id against the daemon's models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelResolution {
    /// Same id is installed.
    Exact(String),
    /// Matched on the part before the tag (`llama3` -> `llama3:latest`).
    BaseName(String),
    /// Nothing matched; the default is used instead.
    Fallback { requested: String, fallback: String },
}

impl ModelResolution {
    pub fn model_id(&self) -> &str {
        match self {
            ModelResolution::Exact(id) | ModelResolution::BaseName(id) => id,
            ModelResolution::Fallback { fallback, .. } => fallback,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ModelResolution::Fallback { .. })
    }
}

/// Two-tier model match: exact id first, then base name; otherwise `fallback`.
pub fn resolve_model(
    requested: &str,
    available: &[ModelDescriptor],
    fallback: &str,
) -> ModelResolution {
    let requested = requested.trim();
    if let Some(m) = available.iter().find(|m| m.id == requested) {
        return ModelResolution::Exact(m.id.clone());
    }
    let wanted = base_name(requested);
    if let Some(m) = available.iter().find(|m| base_name(&m.id) == wanted) {
        return ModelResolution::BaseName(m.id.clone());
    }
    log::warn!(
        "model {:?} not available locally, falling back to {:?}",
        requested,
        fallback
    );
    ModelResolution::Fallback {
        requested: requested.to_string(),
        fallback: fallback.to_string(),
    }
}

/// What a newly accepted chat request needs to run outside the session lock.
#[derive(Debug)]
pub struct StreamTicket {
    pub cancel: CancellationToken,
    pub model_id: String,
    pub params: GenerationParams,
    /// Turns that precede `user_text` in the prompt.
    pub history: Vec<Turn>,
    pub user_text: String,
}

/// One session: selected model, parameters, history and lifecycle flags.
#[derive(Debug)]
pub struct SessionState {
    session_id: SessionId,
    model_id: String,
    params: GenerationParams,
    history: Conversation,
    created_at: DateTime<Utc>,
    streaming: bool,
    stream_cancel: Option<CancellationToken>,
    pull_cancel: Option<CancellationToken>,
    last_active: Instant,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<SessionId>,
        model_id: impl Into<String>,
        params: GenerationParams,
    ) -> Self {
        Self::restore(
            session_id,
            model_id,
            params,
            Conversation::new(),
            Utc::now(),
        )
    }

    /// Rebuild a session from stored data. Transient flags start cleared.
    pub fn restore(
        session_id: impl Into<SessionId>,
        model_id: impl Into<String>,
        params: GenerationParams,
        history: Conversation,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model_id: model_id.into(),
            params,
            history,
            created_at,
            streaming: false,
            stream_cancel: None,
            pull_cancel: None,
            last_active: Instant::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn set_model(&mut self, model_id: impl Into<String>) {
        self.model_id = model_id.into();
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn set_params(&mut self, params: GenerationParams) {
        self.params = params;
    }

    pub fn history(&self) -> &Conversation {
        &self.history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn is_pulling(&self) -> bool {
        self.pull_cancel.is_some()
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Accept a chat request: set `streaming`, append the user turn and hand back what the
    /// stream needs. `None` when a stream is already active; nothing is changed in that case.
    pub fn begin_stream(&mut self, user_text: &str) -> Option<StreamTicket> {
        if self.streaming {
            return None;
        }
        let history = self.history.snapshot();
        self.history.append(Turn::user(user_text));
        Some(self.open_stream(history, user_text.to_string()))
    }

    /// Re-run the latest user turn. Nothing is removed: the new reply is appended after
    /// whatever already followed that turn, and the prompt stops at the turn itself.
    /// `None` while streaming or before any user turn exists.
    pub fn begin_regenerate(&mut self) -> Option<StreamTicket> {
        if self.streaming {
            return None;
        }
        let mut turns = self.history.snapshot();
        let last_user = turns.iter().rposition(|t| t.role == Role::User)?;
        turns.truncate(last_user + 1);
        let user_text = turns.pop()?.content;
        Some(self.open_stream(turns, user_text))
    }

    fn open_stream(&mut self, history: Vec<Turn>, user_text: String) -> StreamTicket {
        let cancel = CancellationToken::new();
        self.streaming = true;
        self.stream_cancel = Some(cancel.clone());
        self.touch();
        StreamTicket {
            cancel,
            model_id: self.model_id.clone(),
            params: self.params.clone(),
            history,
            user_text,
        }
    }

    /// Terminal step of a stream: record the assistant turn (if any) and clear `streaming`.
    pub fn finish_stream(&mut self, turn: Option<Turn>) {
        if let Some(turn) = turn {
            self.history.append(turn);
        }
        self.streaming = false;
        self.stream_cancel = None;
        self.touch();
    }

    /// Signal the active stream to stop. Returns false when nothing is streaming.
    pub fn cancel_stream(&self) -> bool {
        match &self.stream_cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Register a model download. `None` when one is already running for this session.
    pub fn begin_pull(&mut self) -> Option<CancellationToken> {
        if self.pull_cancel.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        self.pull_cancel = Some(token.clone());
        self.touch();
        Some(token)
    }

    pub fn finish_pull(&mut self) {
        self.pull_cancel = None;
        self.touch();
    }

    pub fn cancel_pull(&self) -> bool {
        match &self.pull_cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// In-memory table of live sessions, capped at `max_resident` entries.
///
/// When the cap is exceeded the least recently active idle session is dropped from memory.
/// Its persisted record is untouched and is reloaded on next contact.
pub struct SessionManager {
    inner: RwLock<HashMap<SessionId, SessionHandle>>,
    max_resident: usize,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SessionManager {
    pub fn new(max_resident: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_resident: max_resident.max(1),
        }
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.inner.read().await.get(id).cloned()
    }

    /// Insert `state` unless a session with the same id appeared meanwhile; returns the entry
    /// that ends up in the table.
    pub async fn insert_if_absent(&self, state: SessionState) -> SessionHandle {
        let id = state.session_id.clone();
        let mut g = self.inner.write().await;
        if let Some(existing) = g.get(&id) {
            return existing.clone();
        }
        let handle = Arc::new(Mutex::new(state));
        g.insert(id.clone(), handle.clone());
        while g.len() > self.max_resident {
            let Some(victim) = pick_eviction(&g, &id) else {
                log::debug!("session table over capacity but every session is busy");
                break;
            };
            g.remove(&victim);
            log::debug!("evicted idle session {} from memory", victim);
        }
        handle
    }

    pub async fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.inner.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Oldest idle session other than `keep`. Sessions that are locked right now, streaming, or
/// pulling are never picked.
fn pick_eviction(map: &HashMap<SessionId, SessionHandle>, keep: &str) -> Option<SessionId> {
    map.iter()
        .filter(|(id, _)| id.as_str() != keep)
        .filter_map(|(id, handle)| {
            let s = handle.try_lock().ok()?;
            if s.is_streaming() || s.is_pulling() {
                return None;
            }
            Some((id.clone(), s.idle_for()))
        })
        .max_by_key(|(_, idle)| *idle)
        .map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(ids: &[&str]) -> Vec<ModelDescriptor> {
        ids.iter()
            .map(|id| ModelDescriptor {
                id: id.to_string(),
                family: None,
                size_bytes: None,
                is_local: true,
            })
            .collect()
    }

    #[test]
    fn resolve_prefers_exact_match() {
        let available = local(&["llama3", "llama3:latest"]);
        assert_eq!(
            resolve_model("llama3:latest", &available, "mistral"),
            ModelResolution::Exact("llama3:latest".into())
        );
    }

    #[test]
    fn resolve_matches_base_name() {
        let available = local(&["mistral:7b", "llama3:latest"]);
        let r = resolve_model("llama3", &available, "mistral");
        assert_eq!(r, ModelResolution::BaseName("llama3:latest".into()));
        assert_eq!(r.model_id(), "llama3:latest");
    }

    #[test]
    fn resolve_falls_back_when_unmatched() {
        let r = resolve_model("phi3", &local(&["llama3:latest"]), "llama3");
        assert!(r.is_fallback());
        assert_eq!(r.model_id(), "llama3");
    }

    #[test]
    fn session_id_validation() {
        assert!(is_valid_session_id("sess-1234"));
        assert!(is_valid_session_id("2025-01-02_10-11-12"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("../etc/passwd"));
        assert!(!is_valid_session_id(".hidden"));
        assert!(!is_valid_session_id("a/b"));
        assert!(is_valid_session_id(&new_session_id()));
    }

    #[test]
    fn second_begin_stream_is_refused() {
        let mut s = SessionState::new("s1", "llama3", GenerationParams::default());
        let ticket = s.begin_stream("hello").expect("first stream accepted");
        assert!(ticket.history.is_empty());
        assert_eq!(s.history().len(), 1);
        assert!(s.begin_stream("again").is_none());
        assert_eq!(s.history().len(), 1);
        s.finish_stream(Some(Turn::assistant("hi")));
        assert!(!s.is_streaming());
        assert_eq!(s.history().len(), 2);
        assert!(s.begin_stream("third").is_some());
    }

    #[test]
    fn regenerate_reruns_last_user_turn_without_appending_it() {
        let mut s = SessionState::new("s1", "llama3", GenerationParams::default());
        assert!(s.begin_regenerate().is_none());

        s.begin_stream("first").unwrap();
        s.finish_stream(Some(Turn::assistant("one")));
        s.begin_stream("second").unwrap();
        s.finish_stream(Some(Turn::assistant("two")));

        let ticket = s.begin_regenerate().expect("regenerate accepted");
        assert_eq!(ticket.user_text, "second");
        let prior: Vec<&str> = ticket.history.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(prior, vec!["first", "one"]);
        assert!(s.is_streaming());
        assert_eq!(s.history().len(), 4);
        assert!(s.begin_regenerate().is_none());

        s.finish_stream(Some(Turn::assistant("two, again")));
        let contents: Vec<String> = s.history().iter().map(|t| t.content.clone()).collect();
        assert_eq!(contents, vec!["first", "one", "second", "two", "two, again"]);
    }

    #[test]
    fn cancel_stream_trips_token() {
        let mut s = SessionState::new("s1", "llama3", GenerationParams::default());
        assert!(!s.cancel_stream());
        let ticket = s.begin_stream("hello").unwrap();
        assert!(s.cancel_stream());
        assert!(ticket.cancel.is_cancelled());
    }

    #[test]
    fn one_pull_at_a_time() {
        let mut s = SessionState::new("s1", "llama3", GenerationParams::default());
        let token = s.begin_pull().unwrap();
        assert!(s.begin_pull().is_none());
        assert!(s.cancel_pull());
        assert!(token.is_cancelled());
        s.finish_pull();
        assert!(!s.is_pulling());
    }

    #[tokio::test]
    async fn insert_if_absent_keeps_existing_entry() {
        let mgr = SessionManager::new(8);
        let first = mgr
            .insert_if_absent(SessionState::new("s1", "a", GenerationParams::default()))
            .await;
        let second = mgr
            .insert_if_absent(SessionState::new("s1", "b", GenerationParams::default()))
            .await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.model_id(), "a");
    }

    #[tokio::test]
    async fn eviction_skips_streaming_sessions() {
        let mgr = SessionManager::new(2);
        let busy = mgr
            .insert_if_absent(SessionState::new("busy", "m", GenerationParams::default()))
            .await;
        busy.lock().await.begin_stream("hi").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.insert_if_absent(SessionState::new("idle", "m", GenerationParams::default()))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.insert_if_absent(SessionState::new("new", "m", GenerationParams::default()))
            .await;
        assert_eq!(mgr.len().await, 2);
        assert!(mgr.get("busy").await.is_some());
        assert!(mgr.get("idle").await.is_none());
        assert!(mgr.get("new").await.is_some());
    }
}
