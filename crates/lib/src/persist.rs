//! Session persistence: a versioned JSON record per session, one file each.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::conversation::{Conversation, Turn};
use crate::params::{GenerationParams, ParamsPayload};
use crate::session::{is_valid_session_id, SessionState};

/// Current on-disk record version.
pub const RECORD_VERSION: u32 = 1;

/// Characters of the first user message shown in session listings.
pub const PREVIEW_CHARS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("session {id} is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("session storage: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid session id: {0:?}")]
    InvalidId(String),
}

fn default_version() -> u32 {
    RECORD_VERSION
}

/// Stored form of a session. Transient state (streaming, pending cancellation) is never written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    pub session_id: String,
    pub model_id: String,
    pub parameters: ParamsPayload,
    #[serde(default)]
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            version: RECORD_VERSION,
            session_id: state.session_id().to_string(),
            model_id: state.model_id().to_string(),
            parameters: state.params().to_payload(),
            turns: state.history().to_persistable(),
            created_at: state.created_at(),
            updated_at: Utc::now(),
        }
    }

    /// Rebuild live state. Out-of-range stored parameters make the record corrupt.
    pub fn into_state(self) -> Result<SessionState, PersistError> {
        let params =
            GenerationParams::from_payload(self.parameters).map_err(|e| PersistError::Corrupt {
                id: self.session_id.clone(),
                reason: e.to_string(),
            })?;
        Ok(SessionState::restore(
            self.session_id,
            self.model_id,
            params,
            Conversation::from_persistable(self.turns),
            self.created_at,
        ))
    }

    pub fn summary(self) -> SessionSummary {
        let message_count = self.turns.len();
        let preview = Conversation::from_persistable(self.turns).preview(PREVIEW_CHARS);
        SessionSummary {
            session_id: self.session_id,
            model_id: self.model_id,
            preview,
            message_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// One row of the saved-sessions listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub model_id: String,
    pub preview: Option<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn save(&self, record: &SessionRecord) -> Result<(), PersistError>;

    /// `Ok(None)` when nothing is stored under `id`.
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, PersistError>;

    /// Returns whether a record existed.
    async fn delete(&self, id: &str) -> Result<bool, PersistError>;

    /// Summaries of all readable records, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionSummary>, PersistError>;
}

/// Stores each session as `<dir>/<session_id>.json`.
pub struct JsonFileRepository {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

/// Just enough of an existing record to carry `createdAt` forward and order saves.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredTimes {
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JsonFileRepository {
    /// Open (creating if needed) the sessions directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        log::debug!("session store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, PersistError> {
        if !is_valid_session_id(id) {
            return Err(PersistError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read_record(&self, id: &str, path: &Path) -> Result<Option<SessionRecord>, PersistError> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: SessionRecord =
            serde_json::from_str(&raw).map_err(|e| PersistError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if record.session_id != id {
            return Err(PersistError::Corrupt {
                id: id.to_string(),
                reason: format!("file holds session {}", record.session_id),
            });
        }
        if record.version > RECORD_VERSION {
            log::debug!(
                "session {} has record version {}, reading best-effort",
                id,
                record.version
            );
        }
        Ok(Some(record))
    }
}

#[async_trait]
impl SessionRepository for JsonFileRepository {
    /// A record older than the stored one (by `updatedAt`) is dropped; snapshots are taken
    /// under the session lock, but their saves can land out of order.
    async fn save(&self, record: &SessionRecord) -> Result<(), PersistError> {
        let path = self.path_for(&record.session_id)?;
        let _guard = self.write_lock.lock().await;

        let mut record = record.clone();
        if let Ok(existing) = tokio::fs::read_to_string(&path).await {
            if let Ok(prev) = serde_json::from_str::<StoredTimes>(&existing) {
                if prev.updated_at > record.updated_at {
                    log::debug!(
                        "session {}: skipping save older than the stored record",
                        record.session_id
                    );
                    return Ok(());
                }
                record.created_at = prev.created_at;
            }
        }
        let json = serde_json::to_string_pretty(&record).map_err(|e| {
            PersistError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        let tmp = self.dir.join(format!(".{}.json.tmp", record.session_id));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("saved session {} ({} turns)", record.session_id, record.turns.len());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<SessionRecord>, PersistError> {
        let path = self.path_for(id)?;
        self.read_record(id, &path).await
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, PersistError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_valid_session_id(id) {
                continue;
            }
            match self.read_record(id, &path).await {
                Ok(Some(record)) => out.push(record.summary()),
                Ok(None) => {}
                Err(e) => log::warn!("skipping session file {}: {}", path.display(), e),
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }
}
