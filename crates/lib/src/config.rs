//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (`~/.lamplight/config.json` unless `LAMPLIGHT_CONFIG_PATH`
//! is set), then selected environment variables override individual fields.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chat::SessionDefaults;
use crate::params::{GenerationParams, ValidationError, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Where the Ollama daemon lives and which models are offered for pulling.
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// Model and generation parameters for new sessions.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Session storage.
    #[serde(default)]
    pub sessions: SessionsConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 15152).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by LAMPLIGHT_GATEWAY_TOKEN.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allowed only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match the configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    15152
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaConfig {
    /// Daemon URL (default http://127.0.0.1:11434). Overridden by OLLAMA_BASE_URL.
    pub base_url: Option<String>,

    /// Pullable model ids offered by `/models browse`. Empty means the built-in list.
    #[serde(default)]
    pub catalog: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultsConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// 0 or absent means unlimited.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_model() -> String {
    "llama3".to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: None,
            system_prompt: None,
        }
    }
}

impl DefaultsConfig {
    /// Validated defaults for new sessions.
    pub fn to_session_defaults(&self) -> Result<SessionDefaults, ValidationError> {
        let params = GenerationParams::new(
            self.temperature,
            self.top_p,
            self.max_tokens.filter(|n| *n > 0),
            self.system_prompt.clone(),
        )?;
        Ok(SessionDefaults {
            model_id: self.model.trim().to_string(),
            params,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    /// Session files directory. Relative paths resolve against the config file's parent.
    /// Overridden by SESSION_DATA_DIR.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Sessions kept in memory before idle ones are dropped (default 256).
    #[serde(default = "default_max_resident")]
    pub max_resident: usize,

    /// Write sessions to disk (default true).
    #[serde(default = "default_persist")]
    pub persist: bool,
}

fn default_max_resident() -> usize {
    256
}

fn default_persist() -> bool {
    true
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_resident: default_max_resident(),
            persist: default_persist(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the gateway token: env LAMPLIGHT_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    non_empty(std::env::var("LAMPLIGHT_GATEWAY_TOKEN").ok())
        .or_else(|| non_empty(config.gateway.auth.token.clone()))
}

/// True if the bind address is loopback (127.0.0.1, ::1, localhost).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Apply environment overrides using `var` as the lookup. Unparseable numbers are ignored
/// with a warning.
pub fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
        let raw = non_empty(raw)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                log::warn!("ignoring {}={:?}: not a valid number", name, raw);
                None
            }
        }
    }

    if let Some(url) = non_empty(var("OLLAMA_BASE_URL")) {
        config.ollama.base_url = Some(url);
    }
    if let Some(model) = non_empty(var("DEFAULT_MODEL")) {
        config.defaults.model = model;
    }
    if let Some(t) = parsed("DEFAULT_TEMPERATURE", var("DEFAULT_TEMPERATURE")) {
        config.defaults.temperature = t;
    }
    if let Some(p) = parsed("DEFAULT_TOP_P", var("DEFAULT_TOP_P")) {
        config.defaults.top_p = p;
    }
    if let Some(n) = parsed("DEFAULT_MAX_TOKENS", var("DEFAULT_MAX_TOKENS")) {
        config.defaults.max_tokens = Some(n);
    }
    if let Some(dir) = non_empty(var("SESSION_DATA_DIR")) {
        config.sessions.directory = Some(PathBuf::from(dir));
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("LAMPLIGHT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".lamplight").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from `path` (or the default path). Missing file => default config.
/// Environment overrides are applied on top. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Default sessions directory: `sessions` next to the config file.
pub fn sessions_dir(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("sessions")
}

/// Sessions directory from config (relative paths resolved against the config file's parent),
/// otherwise the default.
pub fn resolve_sessions_dir(config: &Config, config_path: &Path) -> PathBuf {
    match &config.sessions.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent(config_path).join(d)
            }
        }
        _ => sessions_dir(config_path),
    }
}
