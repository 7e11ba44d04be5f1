//! Generation parameters (temperature, top_p, max tokens, system prompt).
//!
//! `GenerationParams` is validated on construction and never mutated afterwards;
//! settings updates go through `apply_update`, which returns a new instance.

use serde::{Deserialize, Serialize};

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("temperature must be between 0 and 2 (got {0})")]
    Temperature(f64),
    #[error("top_p must be between 0 and 1 (got {0})")]
    TopP(f64),
    #[error("max_tokens must be at least 1, or 0 for unlimited (got {0})")]
    MaxTokens(i64),
}

/// Validated generation knobs for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    temperature: f64,
    nucleus_p: f64,
    max_tokens: Option<u32>,
    system_prompt: Option<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            nucleus_p: DEFAULT_TOP_P,
            max_tokens: None,
            system_prompt: None,
        }
    }
}

impl GenerationParams {
    /// Build a parameter record. `max_tokens` must be `None` or at least 1; callers holding a
    /// "0 means unlimited" value normalize it first (see `ParamsPatch`).
    pub fn new(
        temperature: f64,
        nucleus_p: f64,
        max_tokens: Option<u32>,
        system_prompt: Option<String>,
    ) -> Result<Self, ValidationError> {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ValidationError::Temperature(temperature));
        }
        if !(0.0..=1.0).contains(&nucleus_p) {
            return Err(ValidationError::TopP(nucleus_p));
        }
        if max_tokens == Some(0) {
            return Err(ValidationError::MaxTokens(0));
        }
        Ok(Self {
            temperature,
            nucleus_p,
            max_tokens,
            system_prompt: normalize_prompt(system_prompt),
        })
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn nucleus_p(&self) -> f64 {
        self.nucleus_p
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Wire form used by the WebSocket status payloads and the session record.
    pub fn to_payload(&self) -> ParamsPayload {
        ParamsPayload {
            temperature: self.temperature,
            top_p: self.nucleus_p,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.clone(),
        }
    }

    /// Stored `maxTokens: 0` reads as unlimited.
    pub fn from_payload(p: ParamsPayload) -> Result<Self, ValidationError> {
        Self::new(
            p.temperature,
            p.top_p,
            p.max_tokens.filter(|n| *n > 0),
            p.system_prompt,
        )
    }
}

fn normalize_prompt(prompt: Option<String>) -> Option<String> {
    prompt.filter(|s| !s.trim().is_empty())
}

/// Serialized parameter record (`topP`, `maxTokens`, `systemPrompt` on the wire).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsPayload {
    pub temperature: f64,
    pub top_p: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Partial settings update from the UI. Absent fields keep their current value.
/// `maxTokens: 0` means unlimited; an empty `systemPrompt` clears the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsPatch {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl ParamsPatch {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.top_p.is_none()
            && self.max_tokens.is_none()
            && self.system_prompt.is_none()
    }
}

/// Merge `patch` over `current` and validate the result. `current` is left untouched.
pub fn apply_update(
    current: &GenerationParams,
    patch: &ParamsPatch,
) -> Result<GenerationParams, ValidationError> {
    let max_tokens = match patch.max_tokens {
        None => current.max_tokens,
        Some(0) => None,
        Some(n) if n < 0 => return Err(ValidationError::MaxTokens(n)),
        Some(n) => Some(u32::try_from(n).map_err(|_| ValidationError::MaxTokens(n))?),
    };
    let system_prompt = match &patch.system_prompt {
        None => current.system_prompt.clone(),
        Some(s) => Some(s.trim().to_string()),
    };
    GenerationParams::new(
        patch.temperature.unwrap_or(current.temperature),
        patch.top_p.unwrap_or(current.nucleus_p),
        max_tokens,
        system_prompt,
    )
}
