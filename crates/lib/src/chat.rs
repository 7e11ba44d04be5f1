//! Chat service: the event entry points behind the gateway.
//!
//! Owns the session table and wires sessions to the model gateway, the UI surface and the
//! session store. Every error that belongs to a session is also rendered on that session's
//! surface; the returned `Result` is for the caller's request/response bookkeeping.

use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::command::{classify, Input, ModelCommand, SystemCommand, MODELS_HELP, SYSTEM_HELP};
use crate::conversation::Turn;
use crate::coordinator::{build_prompt, StreamCoordinator, StreamPhase};
use crate::llm::{filter_descriptors, GatewayError, ModelDescriptor, ModelGateway};
use crate::params::{apply_update, GenerationParams, ParamsPatch, ParamsPayload, ValidationError};
use crate::persist::{PersistError, SessionRecord, SessionRepository, SessionSummary};
use crate::session::{
    is_valid_session_id, new_session_id, resolve_model, SessionHandle, SessionManager,
    SessionState, StreamTicket,
};
use crate::surface::ChatSurface;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("a reply is already being generated for this session")]
    AlreadyStreaming,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Model and parameters given to sessions that have nothing stored.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub model_id: String,
    pub params: GenerationParams,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            model_id: "llama3".to_string(),
            params: GenerationParams::default(),
        }
    }
}

/// What `on_user_message` did with the input.
#[derive(Debug)]
pub enum Dispatch {
    /// A generation was started; resolves to its terminal phase once the outcome is recorded.
    Stream(JoinHandle<StreamPhase>),
    /// A model download was started.
    Pull(JoinHandle<()>),
    /// Command handled inline; any output went to the surface.
    Handled,
    /// The client asked to close this session.
    Close,
    /// The client asked for a fresh session.
    NewSession(OpenedSession),
}

/// Session view returned when a client opens (or resumes) a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedSession {
    pub session_id: String,
    pub model_id: String,
    pub parameters: ParamsPayload,
    pub turns: Vec<Turn>,
    pub streaming: bool,
}

impl OpenedSession {
    fn of(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id().to_string(),
            model_id: state.model_id().to_string(),
            parameters: state.params().to_payload(),
            turns: state.history().snapshot(),
            streaming: state.is_streaming(),
        }
    }
}

#[derive(Clone)]
pub struct ChatService {
    sessions: Arc<SessionManager>,
    gateway: Arc<dyn ModelGateway>,
    surface: Arc<dyn ChatSurface>,
    store: Option<Arc<dyn SessionRepository>>,
    defaults: SessionDefaults,
}

impl ChatService {
    pub fn new(
        gateway: Arc<dyn ModelGateway>,
        surface: Arc<dyn ChatSurface>,
        store: Option<Arc<dyn SessionRepository>>,
        defaults: SessionDefaults,
        max_resident: usize,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(max_resident)),
            gateway,
            surface,
            store,
            defaults,
        }
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    pub fn persistent(&self) -> bool {
        self.store.is_some()
    }

    pub async fn resident_sessions(&self) -> usize {
        self.sessions.len().await
    }

    /// Open `session_id` (or a new session): resident state first, then the store, then defaults.
    /// The model is re-resolved against what the daemon has installed.
    pub async fn open_session(
        &self,
        session_id: Option<&str>,
    ) -> Result<OpenedSession, ChatError> {
        let id = match session_id {
            Some(id) => id.to_string(),
            None => new_session_id(),
        };
        let handle = self.lookup(&id).await?;
        let mut s = handle.lock().await;
        s.touch();
        Ok(OpenedSession::of(&s))
    }

    /// Classify and act on one inbound message.
    pub async fn on_user_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<Dispatch, ChatError> {
        let handle = self.lookup(session_id).await?;
        match classify(text) {
            Input::UserText(text) => self.start_stream(session_id, handle, text).await,
            Input::Model(cmd) => Ok(self.model_command(session_id, handle, cmd).await),
            Input::System(SystemCommand::Regenerate) => self.regenerate(session_id, handle).await,
            Input::System(SystemCommand::Stop) => {
                self.on_cancel(session_id).await?;
                Ok(Dispatch::Handled)
            }
            Input::System(SystemCommand::Exit) => {
                self.on_cancel(session_id).await?;
                self.surface.render_notice(session_id, "Session closed.");
                Ok(Dispatch::Close)
            }
            Input::System(SystemCommand::New) => {
                Ok(Dispatch::NewSession(self.open_session(None).await?))
            }
            Input::System(SystemCommand::Sessions) => {
                match self.list_sessions().await {
                    Ok(list) => self
                        .surface
                        .render_notice(session_id, &format_sessions(&list)),
                    Err(e) => self.surface.render_error(session_id, &e.to_string()),
                }
                Ok(Dispatch::Handled)
            }
            Input::System(SystemCommand::Help) => {
                self.surface.render_notice(session_id, SYSTEM_HELP);
                Ok(Dispatch::Handled)
            }
        }
    }

    async fn start_stream(
        &self,
        session_id: &str,
        handle: SessionHandle,
        text: String,
    ) -> Result<Dispatch, ChatError> {
        let ticket = handle.lock().await.begin_stream(&text);
        match ticket {
            Some(ticket) => Ok(self.spawn_stream(session_id, handle, ticket)),
            None => Err(self.already_streaming(session_id)),
        }
    }

    /// Stream a new reply to the latest user turn; earlier replies stay in history.
    async fn regenerate(
        &self,
        session_id: &str,
        handle: SessionHandle,
    ) -> Result<Dispatch, ChatError> {
        let ticket = {
            let mut s = handle.lock().await;
            if s.is_streaming() {
                return Err(self.already_streaming(session_id));
            }
            s.begin_regenerate()
        };
        match ticket {
            Some(ticket) => Ok(self.spawn_stream(session_id, handle, ticket)),
            None => {
                self.surface.render_notice(
                    session_id,
                    "Nothing to regenerate yet: send a message first.",
                );
                Ok(Dispatch::Handled)
            }
        }
    }

    fn already_streaming(&self, session_id: &str) -> ChatError {
        let err = ChatError::AlreadyStreaming;
        self.surface.render_error(session_id, &err.to_string());
        err
    }

    /// Run an accepted request to its end, then record, report and save, in that order.
    fn spawn_stream(
        &self,
        session_id: &str,
        handle: SessionHandle,
        ticket: StreamTicket,
    ) -> Dispatch {
        log::debug!(
            "session {} accepted message ({} prior turns)",
            session_id,
            ticket.history.len()
        );
        let svc = self.clone();
        let id = session_id.to_string();
        let task = tokio::spawn(async move {
            let messages = build_prompt(&ticket.params, &ticket.history, &ticket.user_text);
            let mut coordinator =
                StreamCoordinator::new(svc.gateway.clone(), svc.surface.clone(), id.clone());
            let outcome = coordinator
                .run(&ticket.model_id, messages, &ticket.params, ticket.cancel)
                .await;
            let record = {
                let mut s = handle.lock().await;
                s.finish_stream(outcome.turn());
                svc.record_of(&s)
            };
            coordinator.report(&outcome);
            if let Some(record) = record {
                svc.save(&record).await;
            }
            outcome.phase()
        });
        Dispatch::Stream(task)
    }

    /// Merge a settings patch into the session's parameters.
    pub async fn on_settings_update(
        &self,
        session_id: &str,
        patch: &ParamsPatch,
    ) -> Result<ParamsPayload, ChatError> {
        let handle = self.lookup(session_id).await?;
        let (payload, record) = {
            let mut s = handle.lock().await;
            let next = match apply_update(s.params(), patch) {
                Ok(p) => p,
                Err(e) => {
                    self.surface.render_error(session_id, &e.to_string());
                    return Err(e.into());
                }
            };
            s.set_params(next);
            s.touch();
            (s.params().to_payload(), self.record_of(&s))
        };
        log::debug!("session {} settings updated", session_id);
        if let Some(record) = record {
            self.save(&record).await;
        }
        Ok(payload)
    }

    /// Stop the running generation and pull, if any. Returns whether anything was running.
    pub async fn on_cancel(&self, session_id: &str) -> Result<bool, ChatError> {
        checked_id(session_id)?;
        let Some(handle) = self.sessions.get(session_id).await else {
            return Ok(false);
        };
        let s = handle.lock().await;
        let stream = s.cancel_stream();
        let pull = s.cancel_pull();
        if stream || pull {
            log::debug!("session {} cancel requested", session_id);
        }
        Ok(stream || pull)
    }

    /// Switch the session's model. Returns the id actually selected.
    pub async fn on_model_select(
        &self,
        session_id: &str,
        model: &str,
    ) -> Result<String, ChatError> {
        let handle = self.lookup(session_id).await?;
        let model = model.trim();
        let chosen = self
            .resolve_for(session_id, model)
            .await
            .unwrap_or_else(|| model.to_string());
        let record = {
            let mut s = handle.lock().await;
            s.set_model(chosen.clone());
            s.touch();
            self.record_of(&s)
        };
        if let Some(record) = record {
            self.save(&record).await;
        }
        self.surface
            .render_notice(session_id, &format!("Model set to `{}`.", chosen));
        Ok(chosen)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ChatError> {
        match &self.store {
            Some(store) => Ok(store.list().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Drop a session from memory and storage. Running work is cancelled first.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool, ChatError> {
        checked_id(session_id)?;
        let resident = match self.sessions.remove(session_id).await {
            Some(handle) => {
                let s = handle.lock().await;
                s.cancel_stream();
                s.cancel_pull();
                true
            }
            None => false,
        };
        let stored = match &self.store {
            Some(store) => store.delete(session_id).await?,
            None => false,
        };
        log::info!("session {} deleted", session_id);
        Ok(resident || stored)
    }

    /// Resident session; otherwise it is created on first contact from its stored record, or
    /// from the defaults when nothing is stored. New sessions get their model resolved.
    async fn lookup(&self, session_id: &str) -> Result<SessionHandle, ChatError> {
        checked_id(session_id)?;
        if let Some(handle) = self.sessions.get(session_id).await {
            return Ok(handle);
        }
        let mut state = match self.load_stored(session_id).await {
            Some(state) => state,
            None => SessionState::new(
                session_id,
                self.defaults.model_id.clone(),
                self.defaults.params.clone(),
            ),
        };
        if let Some(model) = self.resolve_for(session_id, state.model_id()).await {
            state.set_model(model);
        }
        log::info!("session {} opened (model {})", session_id, state.model_id());
        Ok(self.sessions.insert_if_absent(state).await)
    }

    /// Stored state for `id`. Unreadable records are reported and treated as absent.
    async fn load_stored(&self, id: &str) -> Option<SessionState> {
        let store = self.store.as_ref()?;
        let loaded = match store.load(id).await {
            Ok(record) => record.map(SessionRecord::into_state).transpose(),
            Err(e) => Err(e),
        };
        match loaded {
            Ok(state) => state,
            Err(e) => {
                log::warn!("could not restore session {}: {}", id, e);
                self.surface.render_notice(
                    id,
                    "**Warning:** the saved conversation could not be read; starting fresh.",
                );
                None
            }
        }
    }

    /// Match `requested` against installed models. `None` when the daemon cannot be asked.
    async fn resolve_for(&self, session_id: &str, requested: &str) -> Option<String> {
        let available = match self.gateway.list_local().await {
            Ok(list) => list,
            Err(e) => {
                log::warn!("model lookup for session {} failed: {}", session_id, e);
                self.surface.render_notice(
                    session_id,
                    &format!("**Warning:** could not check installed models ({}).", e),
                );
                return None;
            }
        };
        let resolution = resolve_model(requested, &available, &self.defaults.model_id);
        if resolution.is_fallback() {
            self.surface.render_notice(
                session_id,
                &format!(
                    "**Warning:** model `{}` is not installed; using `{}`.",
                    requested,
                    resolution.model_id()
                ),
            );
        }
        Some(resolution.model_id().to_string())
    }

    fn record_of(&self, state: &SessionState) -> Option<SessionRecord> {
        self.store.as_ref().map(|_| SessionRecord::from_state(state))
    }

    async fn save(&self, record: &SessionRecord) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.save(record).await {
            log::warn!("failed to save session {}: {}", record.session_id, e);
            self.surface.render_notice(
                &record.session_id,
                &format!("**Warning:** this conversation could not be saved ({}).", e),
            );
        }
    }

    async fn model_command(
        &self,
        session_id: &str,
        handle: SessionHandle,
        cmd: ModelCommand,
    ) -> Dispatch {
        let rendered = match cmd {
            ModelCommand::List => self.gateway.list_local().await.map(|m| format_local(&m)),
            ModelCommand::Browse(pattern) => self
                .gateway
                .list_remote(pattern.as_deref())
                .await
                .map(|m| format_remote(&m, pattern.as_deref())),
            ModelCommand::Search(pattern) => self.search(&pattern).await,
            ModelCommand::Delete(name) => self
                .gateway
                .delete(&name)
                .await
                .map(|()| format!("Deleted `{}`.", name)),
            ModelCommand::Pull(name) => return self.start_pull(session_id, handle, name).await,
            ModelCommand::Help => Ok(MODELS_HELP.to_string()),
            ModelCommand::Usage(usage) => Ok(format!("**Usage:** `{}`", usage)),
        };
        match rendered {
            Ok(content) => self.surface.render_notice(session_id, &content),
            Err(e) => self.surface.render_error(session_id, &e.to_string()),
        }
        Dispatch::Handled
    }

    async fn search(&self, pattern: &str) -> Result<String, GatewayError> {
        let remote = self.gateway.list_remote(Some(pattern)).await?;
        let local = filter_descriptors(self.gateway.list_local().await?, Some(pattern))?;
        let mut out = format!("## Search results for `{}`\n\n", pattern);
        out.push_str("### Local\n\n");
        out.push_str(&model_table(&local, "No local models match."));
        out.push_str("\n\n### Available to pull\n\n");
        out.push_str(&model_table(&remote, "No pullable models match."));
        Ok(out)
    }

    async fn start_pull(&self, session_id: &str, handle: SessionHandle, model: String) -> Dispatch {
        let cancel = match handle.lock().await.begin_pull() {
            Some(token) => token,
            None => {
                self.surface.render_notice(
                    session_id,
                    "A model download is already running for this session.",
                );
                return Dispatch::Handled;
            }
        };
        self.surface
            .render_notice(session_id, &format!("Pulling `{}`...", model));

        let gateway = self.gateway.clone();
        let surface = self.surface.clone();
        let id = session_id.to_string();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = drive_pull(gateway.as_ref(), surface.as_ref(), &id, &model) => Some(r),
            };
            match result {
                None => surface.render_notice(&id, &format!("Pull of `{}` cancelled.", model)),
                Some(Ok(())) => {
                    log::info!("pulled model {}", model);
                    surface.render_notice(
                        &id,
                        &format!("Pulled `{}`. Select it with the model picker.", model),
                    )
                }
                Some(Err(e)) => {
                    log::warn!("pull of {} failed: {}", model, e);
                    surface.render_error(&id, &e.to_string())
                }
            }
            handle.lock().await.finish_pull();
        });
        Dispatch::Pull(task)
    }
}

async fn drive_pull(
    gateway: &dyn ModelGateway,
    surface: &dyn ChatSurface,
    session_id: &str,
    model: &str,
) -> Result<(), GatewayError> {
    let mut stream = gateway.pull(model).await?;
    while let Some(progress) = stream.next().await {
        let progress = progress?;
        surface.render_progress(session_id, model, progress.bytes_done, progress.bytes_total);
    }
    Ok(())
}

fn checked_id(id: &str) -> Result<&str, ChatError> {
    if is_valid_session_id(id) {
        Ok(id)
    } else {
        Err(ChatError::InvalidSessionId(id.to_string()))
    }
}

fn format_size(bytes: Option<u64>) -> String {
    match bytes {
        Some(b) if b > 0 => format!("{:.2} GB", b as f64 / (1024.0 * 1024.0 * 1024.0)),
        _ => "N/A".to_string(),
    }
}

fn model_table(models: &[ModelDescriptor], empty: &str) -> String {
    if models.is_empty() {
        return empty.to_string();
    }
    let mut out = String::from("| Model | Size | Family | Installed |\n|---|---|---|---|\n");
    for m in models {
        out.push_str(&format!(
            "| `{}` | {} | {} | {} |\n",
            m.id,
            format_size(m.size_bytes),
            m.family.as_deref().unwrap_or("N/A"),
            if m.is_local { "yes" } else { "" }
        ));
    }
    out
}

fn format_local(models: &[ModelDescriptor]) -> String {
    if models.is_empty() {
        return "## Local models\n\nNo local models found. Use `/models browse` to find one, \
                then `/models pull <model_name>`."
            .to_string();
    }
    format!(
        "## Local models\n\n{}\n**Total:** {} model{}\n\nTo delete a model: `/models delete <model_name>`",
        model_table(models, ""),
        models.len(),
        if models.len() == 1 { "" } else { "s" }
    )
}

fn format_remote(models: &[ModelDescriptor], pattern: Option<&str>) -> String {
    let title = match pattern.filter(|p| !p.trim().is_empty()) {
        Some(p) => format!("## Pullable models matching `{}`", p),
        None => "## Pullable models".to_string(),
    };
    format!(
        "{}\n\n{}\n\nTo download one: `/models pull <model_name>`",
        title,
        model_table(models, "No models match.")
    )
}

fn format_sessions(list: &[SessionSummary]) -> String {
    if list.is_empty() {
        return "No saved sessions.".to_string();
    }
    let mut out = String::from("## Saved sessions\n\n| Session | Model | Messages | Updated | Preview |\n|---|---|---|---|---|\n");
    for s in list {
        out.push_str(&format!(
            "| `{}` | `{}` | {} | {} | {} |\n",
            s.session_id,
            s.model_id,
            s.message_count,
            s.updated_at.format("%Y-%m-%d %H:%M"),
            s.preview.as_deref().unwrap_or("")
        ));
    }
    out
}
