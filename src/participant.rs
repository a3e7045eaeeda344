//! The fixed participant identities of a roundtable.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One of the supervised AI CLI identities.
///
/// Each identity maps 1:1 to a spawn specification and at most one live
/// supervised process per orchestrator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantId {
    ClaudeCode,
    Codex,
    Gemini,
}

impl ParticipantId {
    /// All configured identities, in the canonical order.
    pub fn all() -> [ParticipantId; 3] {
        [
            ParticipantId::ClaudeCode,
            ParticipantId::Codex,
            ParticipantId::Gemini,
        ]
    }

    /// Default relay order: Claude -> Codex -> Gemini.
    pub fn default_order() -> Vec<ParticipantId> {
        Self::all().to_vec()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantId::ClaudeCode => "claude_code",
            ParticipantId::Codex => "codex",
            ParticipantId::Gemini => "gemini",
        }
    }

    /// Name of the per-participant briefing file at the project root.
    pub fn briefing_filename(&self) -> &'static str {
        match self {
            ParticipantId::ClaudeCode => "CLAUDE.md",
            ParticipantId::Codex => "CODEX.md",
            ParticipantId::Gemini => "GEMINI.md",
        }
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ParticipantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "claude_code" => Ok(ParticipantId::ClaudeCode),
            "codex" => Ok(ParticipantId::Codex),
            "gemini" => Ok(ParticipantId::Gemini),
            other => Err(Error::Validation(format!(
                "unknown participant: '{}'",
                other
            ))),
        }
    }
}
