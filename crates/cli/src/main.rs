use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use tokio::io::AsyncBufReadExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "lamplight")]
#[command(about = "Lamplight: chat with local Ollama models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory, a default config and the sessions directory.
    Init {
        /// Config file path (default: LAMPLIGHT_CONFIG_PATH or ~/.lamplight/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the chat gateway (HTTP + WebSocket).
    #[command(alias = "gateway")]
    Serve {
        /// Config file path (default: LAMPLIGHT_CONFIG_PATH or ~/.lamplight/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 15152)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat through a running gateway (interactive, streamed).
    Chat {
        /// Config file path (default: LAMPLIGHT_CONFIG_PATH or ~/.lamplight/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Existing session id to continue.
        #[arg(long, value_name = "ID")]
        session: Option<String>,

        /// Model to use for this session.
        #[arg(long, short, value_name = "MODEL")]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("lamplight {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            session,
            model,
        }) => {
            if let Err(e) = run_chat(config, session, model).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config, path).await
}

/// Sequential request ids for one connection.
struct Requests {
    next: u64,
}

impl Requests {
    fn frame(&mut self, method: &str, params: serde_json::Value) -> (String, Message) {
        self.next += 1;
        let id = self.next.to_string();
        let req = serde_json::json!({
            "type": "req",
            "id": id,
            "method": method,
            "params": params,
        });
        (id, Message::Text(req.to_string()))
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    session: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let (config, _) = lib::config::load_config(config_path)?;
    let ws_url = format!("ws://{}:{}/ws", config.gateway.bind.trim(), config.gateway.port);
    let token = lib::config::resolve_gateway_token(&config);

    let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .with_context(|| format!("connecting to {} (is `lamplight serve` running?)", ws_url))?;
    let (mut tx, mut rx) = ws.split();
    let mut requests = Requests { next: 0 };

    let mut auth = serde_json::json!({});
    if let Some(t) = token {
        auth["token"] = serde_json::Value::String(t);
    }
    let (id, frame) = requests.frame(
        "connect",
        serde_json::json!({ "client": { "id": "lamplight-cli" }, "auth": auth }),
    );
    tx.send(frame).await?;
    await_response(&mut rx, &id).await?;

    let (id, frame) = requests.frame("session.open", serde_json::json!({ "sessionId": session }));
    tx.send(frame).await?;
    let opened = await_response(&mut rx, &id).await?;
    let mut session_id = opened
        .get("sessionId")
        .and_then(|v| v.as_str())
        .context("missing sessionId in session.open response")?
        .to_string();
    let turns = opened.get("turns").and_then(|v| v.as_array()).map_or(0, |t| t.len());
    println!(
        "session {} (model {}, {} earlier messages). /stop cancels a reply, /exit leaves.",
        session_id,
        opened.get("modelId").and_then(|v| v.as_str()).unwrap_or("?"),
        turns
    );

    if let Some(m) = model {
        let (_, frame) = requests.frame(
            "model.select",
            serde_json::json!({ "sessionId": session_id, "model": m }),
        );
        tx.send(frame).await?;
    }

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    prompt();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let input = line.trim();
                if input.is_empty() {
                    prompt();
                    continue;
                }
                let (_, frame) = if input.eq_ignore_ascii_case("/stop") {
                    requests.frame("chat.cancel", serde_json::json!({ "sessionId": session_id }))
                } else {
                    requests.frame(
                        "chat.send",
                        serde_json::json!({ "sessionId": session_id, "message": input }),
                    )
                };
                tx.send(frame).await?;
            }
            msg = rx.next() => {
                let Some(msg) = msg else { break };
                let Message::Text(text) = msg? else { continue };
                let Ok(v) = serde_json::from_str::<serde_json::Value>(&text) else { continue };
                match v.get("type").and_then(|t| t.as_str()) {
                    Some("event") => {
                        if !render_event(&v, &session_id) {
                            break;
                        }
                    }
                    Some("res") => {
                        if !v.get("ok").and_then(|o| o.as_bool()).unwrap_or(false) {
                            let err = v.get("error").and_then(|e| e.as_str()).unwrap_or("request failed");
                            eprintln!("error: {}", err);
                            prompt();
                        } else if let Some(new_id) = v
                            .pointer("/payload/newSession/sessionId")
                            .and_then(|s| s.as_str())
                        {
                            session_id = new_id.to_string();
                            println!("started session {}", session_id);
                            prompt();
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    let _ = tx.close().await;
    Ok(())
}

/// Print one event. Returns false when the session or gateway has closed.
fn render_event(v: &serde_json::Value, session_id: &str) -> bool {
    let event = v.get("event").and_then(|e| e.as_str()).unwrap_or("");
    let payload = v.get("payload").cloned().unwrap_or_default();
    let text = |key: &str| payload.get(key).and_then(|s| s.as_str()).unwrap_or("").to_string();
    if event != "shutdown" && payload.get("sessionId").and_then(|s| s.as_str()) != Some(session_id) {
        return true;
    }
    match event {
        "chat.delta" => {
            print!("{}", text("delta"));
            let _ = std::io::stdout().flush();
        }
        "chat.final" => {
            if payload.get("truncated").and_then(|t| t.as_bool()).unwrap_or(false) {
                println!(" [stopped]");
            } else {
                println!();
            }
            prompt();
        }
        "chat.error" => {
            eprintln!("\nerror: {}", text("message"));
            prompt();
        }
        "pull.progress" => {
            let percent = payload.get("percent").and_then(|p| p.as_u64()).unwrap_or(0);
            print!("\rpulling {}: {}%", text("model"), percent);
            let _ = std::io::stdout().flush();
        }
        "session.notice" => {
            println!("\n{}", text("content"));
            prompt();
        }
        "session.closed" => {
            println!("session closed");
            return false;
        }
        "shutdown" => {
            println!("\ngateway shut down");
            return false;
        }
        _ => {}
    }
    true
}

/// Read frames until the response to `id`; returns its payload or the server's error.
async fn await_response<S>(rx: &mut S, id: &str) -> anyhow::Result<serde_json::Value>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg) = rx.next().await {
        let Message::Text(text) = msg? else { continue };
        let res: serde_json::Value = serde_json::from_str(&text)?;
        if res.get("type").and_then(|v| v.as_str()) != Some("res")
            || res.get("id").and_then(|v| v.as_str()) != Some(id)
        {
            continue;
        }
        if !res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            let err = res
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed");
            anyhow::bail!("{}", err);
        }
        return Ok(res.get("payload").cloned().unwrap_or_default());
    }
    anyhow::bail!("gateway closed the connection")
}
