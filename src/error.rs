use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::participant::ParticipantId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Orchestrator is not running")]
    NotRunning,

    #[error("No participants available")]
    NoParticipants,

    #[error("Participant not available: {0}")]
    ParticipantNotAvailable(ParticipantId),

    #[error("Partial startup: {} started, {} failed", succeeded.len(), failed.len())]
    PartialStartup {
        succeeded: Vec<ParticipantId>,
        failed: HashMap<ParticipantId, String>,
    },

    #[error("Session store error: {0}")]
    SessionStore(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Timeouts are the only retryable failure; everything else means the
    /// process is gone, not slow.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
