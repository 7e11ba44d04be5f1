//! Conversation log: ordered, append-only list of user/assistant turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a conversation. `truncated` marks an assistant turn that ended early
/// (cancelled or interrupted mid-stream).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub truncated: bool,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            truncated: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            truncated: false,
        }
    }

    /// Assistant turn that did not finish.
    pub fn truncated(content: impl Into<String>) -> Self {
        Self {
            truncated: true,
            ..Self::assistant(content)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Owned copy of the history, used to build the prompt for the next request.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// First user message, flattened to one line and cut to `max_chars` (with "..." when cut).
    pub fn preview(&self, max_chars: usize) -> Option<String> {
        let first = self.turns.iter().find(|t| t.role == Role::User)?;
        let flat = first.content.trim().replace('\n', " ");
        if flat.chars().count() > max_chars {
            let cut: String = flat.chars().take(max_chars).collect();
            Some(format!("{}...", cut))
        } else {
            Some(flat)
        }
    }

    pub fn to_persistable(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn from_persistable(turns: Vec<Turn>) -> Self {
        Self { turns }
    }
}
