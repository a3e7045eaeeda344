//! Configuration and per-participant spawn specifications.
//!
//! The config file lives at `~/.roundtable/roundtable.toml` and maps each
//! participant to the command that launches it, its timeouts, and the
//! end-of-response pattern for its prompt. Missing participants fall back
//! to built-in defaults.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::participant::ParticipantId;
use crate::{rlog_debug, Error, Result};

const DEFAULT_PROMPT_PATTERN: &str = ">";

/// How one participant process is launched and spoken to.
///
/// Immutable once configured; the supervised process takes a copy at
/// construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Executable name or path.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Default per-command timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Startup handshake timeout in seconds.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    /// Optional one-shot command sent right after startup.
    #[serde(default)]
    pub init_command: Option<String>,
    /// Regex marking the end of one response / the next prompt.
    #[serde(default = "default_prompt_pattern")]
    pub prompt_pattern: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_startup_timeout_secs() -> u64 {
    30
}

fn default_prompt_pattern() -> String {
    DEFAULT_PROMPT_PATTERN.to_string()
}

fn default_enabled() -> bool {
    true
}

impl SpawnSpec {
    /// Built-in spawn specification for a participant.
    pub fn default_for(id: ParticipantId) -> Self {
        match id {
            ParticipantId::ClaudeCode => Self {
                command: "claude".to_string(),
                args: vec!["--headless".to_string()],
                timeout_secs: 300,
                startup_timeout_secs: 30,
                init_command: None,
                prompt_pattern: default_prompt_pattern(),
                enabled: true,
            },
            ParticipantId::Codex => Self {
                command: "codex".to_string(),
                args: Vec::new(),
                timeout_secs: 120,
                startup_timeout_secs: 20,
                init_command: None,
                prompt_pattern: default_prompt_pattern(),
                enabled: true,
            },
            ParticipantId::Gemini => Self {
                command: "gemini".to_string(),
                args: Vec::new(),
                timeout_secs: 300,
                startup_timeout_secs: 20,
                init_command: None,
                prompt_pattern: default_prompt_pattern(),
                enabled: true,
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Compile the end-of-response pattern.
    pub fn pattern(&self) -> Result<Regex> {
        Regex::new(&self.prompt_pattern).map_err(|e| {
            Error::Validation(format!(
                "invalid prompt pattern '{}': {}",
                self.prompt_pattern, e
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub participants: HashMap<ParticipantId, SpawnSpec>,
}

impl Default for Config {
    fn default() -> Self {
        let participants = ParticipantId::all()
            .into_iter()
            .map(|id| (id, SpawnSpec::default_for(id)))
            .collect();
        Self { participants }
    }
}

impl Config {
    pub fn roundtable_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".roundtable"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::roundtable_dir()?.join("roundtable.toml"))
    }

    pub fn sessions_dir() -> Result<PathBuf> {
        Ok(Self::roundtable_dir()?.join("sessions"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let mut config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        // Merge with defaults so every participant has a spec
        for id in ParticipantId::all() {
            config
                .participants
                .entry(id)
                .or_insert_with(|| SpawnSpec::default_for(id));
        }
        rlog_debug!("Config loaded: {} participants", config.participants.len());
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::roundtable_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn spec_for(&self, id: ParticipantId) -> Option<&SpawnSpec> {
        self.participants.get(&id)
    }

    /// Enabled participants in canonical order.
    pub fn enabled_participants(&self) -> Vec<ParticipantId> {
        ParticipantId::all()
            .into_iter()
            .filter(|id| {
                self.participants
                    .get(id)
                    .map(|spec| spec.enabled)
                    .unwrap_or(false)
            })
            .collect()
    }
}
