//! Gateway HTTP + WebSocket server (single port).

use crate::chat::{ChatService, Dispatch};
use crate::config::{self, Config};
use crate::gateway::protocol::{
    event_frame, parse_params, ChatSendParams, ConnectParams, HelloOk, ModelSelectParams,
    ModelsListParams, ServerInfo, SessionIdParams, SessionOpenParams, SettingsUpdateParams,
    WsRequest, WsResponse, PROTOCOL_VERSION, SHUTDOWN_EVENT_JSON,
};
use crate::llm::{ModelGateway, OllamaClient};
use crate::persist::{JsonFileRepository, SessionRepository};
use crate::session::new_session_id;
use crate::surface::ChatSurface;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One outbound event. `session_id: None` goes to every socket.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: Option<String>,
    pub frame: String,
}

/// `ChatSurface` that publishes WebSocket event frames on the gateway's broadcast channel.
#[derive(Clone)]
pub struct EventSurface {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventSurface {
    pub fn new(tx: broadcast::Sender<SessionEvent>) -> Self {
        Self { tx }
    }

    fn publish(&self, session_id: &str, event: &str, payload: serde_json::Value) {
        // No subscribers is fine; the client may have gone away mid-stream.
        let _ = self.tx.send(SessionEvent {
            session_id: Some(session_id.to_string()),
            frame: event_frame(event, payload),
        });
    }
}

impl ChatSurface for EventSurface {
    fn render_increment(&self, session_id: &str, fragment: &str) {
        self.publish(
            session_id,
            "chat.delta",
            json!({ "sessionId": session_id, "delta": fragment }),
        );
    }

    fn render_final(&self, session_id: &str, full_text: &str, truncated: bool) {
        self.publish(
            session_id,
            "chat.final",
            json!({ "sessionId": session_id, "content": full_text, "truncated": truncated }),
        );
    }

    fn render_error(&self, session_id: &str, message: &str) {
        self.publish(
            session_id,
            "chat.error",
            json!({ "sessionId": session_id, "message": message }),
        );
    }

    fn render_progress(&self, session_id: &str, model: &str, done: u64, total: u64) {
        let percent = if total == 0 { 0 } else { done.min(total) * 100 / total };
        self.publish(
            session_id,
            "pull.progress",
            json!({
                "sessionId": session_id,
                "model": model,
                "completed": done,
                "total": total,
                "percent": percent,
            }),
        );
    }

    fn render_notice(&self, session_id: &str, content: &str) {
        self.publish(
            session_id,
            "session.notice",
            json!({ "sessionId": session_id, "content": content }),
        );
    }
}

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Events for connected clients; each socket keeps the ones for sessions it opened.
    pub event_tx: broadcast::Sender<SessionEvent>,
    pub chat: ChatService,
    pub models: Arc<dyn ModelGateway>,
}

impl GatewayState {
    /// Wire the chat service to `models` and `store`, rendering through WebSocket events.
    pub fn new(
        config: Config,
        models: Arc<dyn ModelGateway>,
        store: Option<Arc<dyn SessionRepository>>,
    ) -> Result<Self> {
        let defaults = config
            .defaults
            .to_session_defaults()
            .context("invalid defaults in config")?;
        let (event_tx, _) = broadcast::channel(256);
        let surface: Arc<dyn ChatSurface> = Arc::new(EventSurface::new(event_tx.clone()));
        let chat = ChatService::new(
            models.clone(),
            surface,
            store,
            defaults,
            config.sessions.max_resident,
        );
        Ok(Self {
            required_token: require_connect_token(&config),
            config: Arc::new(config),
            event_tx,
            chat,
            models,
        })
    }
}

/// Open the session store, or `None` (memory-only) when disabled or the directory is unusable.
async fn open_store(config: &Config, config_path: &std::path::Path) -> Option<Arc<dyn SessionRepository>> {
    if !config.sessions.persist {
        log::info!("session persistence disabled");
        return None;
    }
    let dir = config::resolve_sessions_dir(config, config_path);
    match JsonFileRepository::open(&dir).await {
        Ok(repo) => {
            log::info!("sessions stored in {}", dir.display());
            Some(Arc::new(repo))
        }
        Err(e) => {
            log::error!(
                "cannot use sessions directory {} ({}); sessions will not be saved",
                dir.display(),
                e
            );
            None
        }
    }
}

pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or LAMPLIGHT_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let ollama = OllamaClient::new(config.ollama.base_url.clone())
        .with_catalog(config.ollama.catalog.clone());
    log::info!("using ollama at {}", ollama.base_url());
    let models: Arc<dyn ModelGateway> = Arc::new(ollama);
    let store = open_store(&config, &config_path).await;

    // Startup probe only; sessions resolve models on open regardless of the outcome.
    let probe = models.clone();
    tokio::spawn(async move {
        match probe.list_local().await {
            Ok(list) => log::info!("ollama reachable, {} local model(s)", list.len()),
            Err(e) => log::warn!("{}", e),
        }
    });

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let state = GatewayState::new(config, models, store)?;
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);
    serve(listener, state).await
}

/// Serve the gateway on an already bound listener until SIGINT/SIGTERM.
pub async fn serve(listener: tokio::net::TcpListener, state: GatewayState) -> Result<()> {
    let event_tx = state.event_tx.clone();
    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event so sockets close before the server drains.
async fn shutdown_signal(event_tx: broadcast::Sender<SessionEvent>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");
    let _ = event_tx.send(SessionEvent {
        session_id: None,
        frame: SHUTDOWN_EVENT_JSON.to_string(),
    });
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-socket protocol state.
#[derive(Default)]
struct Connection {
    connected: bool,
    sessions: HashSet<String>,
}

impl Connection {
    fn wants(&self, event: &SessionEvent) -> bool {
        match &event.session_id {
            None => true,
            Some(id) => self.connected && self.sessions.contains(id),
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut conn = Connection::default();
    let mut event_rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(ev) => {
                        if !conn.wants(&ev) {
                            continue;
                        }
                        let is_shutdown = ev.frame == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(ev.frame)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };
                if req.typ != "req" {
                    continue;
                }
                let mut frames = Vec::new();
                let res = handle_request(&state, &mut conn, &req, &mut frames).await;
                if socket.send(Message::Text(res.to_frame())).await.is_err() {
                    break;
                }
                for frame in frames {
                    let _ = socket.send(Message::Text(frame)).await;
                }
            }
        }
    }

    if !conn.connected {
        log::debug!("ws client disconnected before sending connect");
    }
    for id in &conn.sessions {
        if let Ok(true) = state.chat.on_cancel(id).await {
            log::debug!("client left; cancelled work for session {}", id);
        }
    }
}

fn closed_frame(session_id: &str) -> String {
    event_frame("session.closed", json!({ "sessionId": session_id }))
}

/// Handle one request. Extra frames to send after the response are pushed to `frames`.
async fn handle_request(
    state: &GatewayState,
    conn: &mut Connection,
    req: &WsRequest,
    frames: &mut Vec<String>,
) -> WsResponse {
    if req.method == "connect" {
        return connect(state, conn, req);
    }
    if !conn.connected {
        return WsResponse::err(&req.id, "connect required");
    }

    macro_rules! params {
        ($t:ty) => {
            match parse_params::<$t>(&req.params) {
                Ok(p) => p,
                Err(e) => return WsResponse::err(&req.id, e),
            }
        };
    }

    match req.method.as_str() {
        "health" => WsResponse::ok(
            &req.id,
            json!({ "runtime": "running", "protocol": PROTOCOL_VERSION }),
        ),
        "status" => {
            let auth_mode = if state.required_token.is_some() {
                "token"
            } else {
                "none"
            };
            WsResponse::ok(
                &req.id,
                json!({
                    "runtime": "running",
                    "protocol": PROTOCOL_VERSION,
                    "port": state.config.gateway.port,
                    "bind": state.config.gateway.bind,
                    "auth": auth_mode,
                    "defaultModel": state.chat.defaults().model_id,
                    "defaultParameters": state.chat.defaults().params.to_payload(),
                    "persist": state.chat.persistent(),
                    "residentSessions": state.chat.resident_sessions().await,
                }),
            )
        }
        "session.open" => {
            let p = params!(SessionOpenParams);
            let id = p.session_id.unwrap_or_else(new_session_id);
            // Subscribe first so notices raised while opening reach this socket.
            let fresh = conn.sessions.insert(id.clone());
            match state.chat.open_session(Some(&id)).await {
                Ok(opened) => WsResponse::ok(&req.id, to_payload(&opened)),
                Err(e) => {
                    if fresh {
                        conn.sessions.remove(&id);
                    }
                    WsResponse::err(&req.id, e.to_string())
                }
            }
        }
        "session.list" => match state.chat.list_sessions().await {
            Ok(list) => WsResponse::ok(&req.id, json!({ "sessions": list })),
            Err(e) => WsResponse::err(&req.id, e.to_string()),
        },
        "session.delete" => {
            let p = params!(SessionIdParams);
            match state.chat.delete_session(&p.session_id).await {
                Ok(deleted) => {
                    let _ = state.event_tx.send(SessionEvent {
                        session_id: Some(p.session_id.clone()),
                        frame: closed_frame(&p.session_id),
                    });
                    conn.sessions.remove(&p.session_id);
                    WsResponse::ok(&req.id, json!({ "deleted": deleted }))
                }
                Err(e) => WsResponse::err(&req.id, e.to_string()),
            }
        }
        "chat.send" => {
            let p = params!(ChatSendParams);
            conn.sessions.insert(p.session_id.clone());
            match state.chat.on_user_message(&p.session_id, &p.message).await {
                Ok(Dispatch::Stream(_)) => {
                    WsResponse::ok(&req.id, json!({ "accepted": true, "streaming": true }))
                }
                Ok(Dispatch::Pull(_)) => {
                    WsResponse::ok(&req.id, json!({ "accepted": true, "pulling": true }))
                }
                Ok(Dispatch::Handled) => WsResponse::ok(&req.id, json!({ "accepted": true })),
                Ok(Dispatch::Close) => {
                    conn.sessions.remove(&p.session_id);
                    frames.push(closed_frame(&p.session_id));
                    WsResponse::ok(&req.id, json!({ "accepted": true, "closed": true }))
                }
                Ok(Dispatch::NewSession(opened)) => {
                    conn.sessions.insert(opened.session_id.clone());
                    WsResponse::ok(
                        &req.id,
                        json!({ "accepted": true, "newSession": to_payload(&opened) }),
                    )
                }
                Err(e) => WsResponse::err(&req.id, e.to_string()),
            }
        }
        "chat.cancel" => {
            let p = params!(SessionIdParams);
            match state.chat.on_cancel(&p.session_id).await {
                Ok(cancelled) => WsResponse::ok(&req.id, json!({ "cancelled": cancelled })),
                Err(e) => WsResponse::err(&req.id, e.to_string()),
            }
        }
        "settings.update" => {
            let p = params!(SettingsUpdateParams);
            conn.sessions.insert(p.session_id.clone());
            match state.chat.on_settings_update(&p.session_id, &p.patch).await {
                Ok(parameters) => WsResponse::ok(&req.id, json!({ "parameters": parameters })),
                Err(e) => WsResponse::err(&req.id, e.to_string()),
            }
        }
        "model.select" => {
            let p = params!(ModelSelectParams);
            conn.sessions.insert(p.session_id.clone());
            match state.chat.on_model_select(&p.session_id, &p.model).await {
                Ok(model_id) => WsResponse::ok(&req.id, json!({ "modelId": model_id })),
                Err(e) => WsResponse::err(&req.id, e.to_string()),
            }
        }
        "models.list" => {
            let p = params!(ModelsListParams);
            let listed = if p.remote {
                state.models.list_remote(p.filter.as_deref()).await
            } else {
                match state.models.list_local().await {
                    Ok(local) => crate::llm::filter_descriptors(local, p.filter.as_deref()),
                    Err(e) => Err(e),
                }
            };
            match listed {
                Ok(models) => WsResponse::ok(&req.id, json!({ "models": models })),
                Err(e) => WsResponse::err(&req.id, e.to_string()),
            }
        }
        _ => WsResponse::err(&req.id, format!("unknown method: {}", req.method)),
    }
}

fn to_payload<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|_| json!({}))
}

fn connect(state: &GatewayState, conn: &mut Connection, req: &WsRequest) -> WsResponse {
    let params: ConnectParams = match parse_params(&req.params) {
        Ok(p) => p,
        Err(_) => return WsResponse::err(&req.id, "invalid connect params"),
    };
    if let Some(ref required) = state.required_token {
        let provided = params.auth.token.as_deref().unwrap_or("").trim();
        if provided.is_empty() {
            return WsResponse::err(
                &req.id,
                "unauthorized: gateway token missing (set LAMPLIGHT_GATEWAY_TOKEN or gateway.auth.token)",
            );
        }
        if provided != required {
            return WsResponse::err(&req.id, "unauthorized: gateway token mismatch");
        }
    }
    if params.min_protocol.is_some_and(|min| min > PROTOCOL_VERSION) {
        return WsResponse::err(
            &req.id,
            format!("unsupported protocol (server speaks {})", PROTOCOL_VERSION),
        );
    }
    let protocol = params
        .max_protocol
        .unwrap_or(PROTOCOL_VERSION)
        .min(PROTOCOL_VERSION);
    let hello = HelloOk {
        typ: "hello-ok".to_string(),
        protocol,
        server: ServerInfo {
            name: "lamplight".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    conn.connected = true;
    if let Some(client) = params.client.id.as_deref() {
        log::debug!("ws client {} connected", client);
    }
    WsResponse::ok(&req.id, to_payload(&hello))
}
