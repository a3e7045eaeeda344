//! Durable, file-backed session state.
//!
//! One JSON file per session id under the store directory (default
//! `~/.roundtable/sessions`). `save` is the only write path and always
//! overwrites the whole record, so last-write-wins is the consistency
//! model. Recorded participant pids let a restarted orchestrator reconcile
//! the file against the live OS process table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::discussion::{DiscussionMode, DiscussionResponse};
use crate::participant::ParticipantId;
use crate::util::{pid_alive, terminate_pid};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// How long cleanup waits for a terminated process before killing it.
const TERMINATE_WAIT: Duration = Duration::from_secs(5);

/// Session liveness as recorded on disk. Running means at least one
/// participant pid was alive at the last save/recover/cleanup; a crash is
/// inferred transiently when `is_active` disagrees with a Running record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    #[default]
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Running => write!(f, "running"),
            SessionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// One recorded discussion. Append-only; never mutated after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub mode: DiscussionMode,
    pub question: String,
    pub responses: Vec<DiscussionResponse>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub conversation_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub participant_pids: HashMap<ParticipantId, u32>,
    #[serde(default)]
    pub state: SessionState,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SessionRecord {
    pub fn new(session_id: String, project_path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            project_path,
            created_at: now,
            last_active: now,
            conversation_history: Vec::new(),
            participant_pids: HashMap::new(),
            state: SessionState::Running,
            metadata: Map::new(),
        }
    }

    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.conversation_history.push(entry);
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// File-backed store of session records.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at the default `~/.roundtable/sessions` directory.
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(Config::sessions_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }

    /// Human-legible id derived from the project name and a timestamp.
    pub fn generate_session_id(project_path: &Path) -> String {
        let project_name = project_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        format!("session_{}_{}", project_name, timestamp)
    }

    /// Create and immediately persist a new session for a project.
    pub fn create(&self, project_path: &Path, session_id: Option<String>) -> Result<SessionRecord> {
        let session_id =
            session_id.unwrap_or_else(|| Self::generate_session_id(project_path));
        let absolute = project_path
            .canonicalize()
            .unwrap_or_else(|_| project_path.to_path_buf());
        let mut record = SessionRecord::new(session_id, absolute);
        self.save(&mut record)?;
        rlog!(
            "created session {} for {}",
            record.session_id,
            project_path.display()
        );
        Ok(record)
    }

    /// Load a record. An unknown id is absent, not an error.
    pub fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            rlog_debug!("session file not found: {}", path.display());
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let record = serde_json::from_str(&contents).map_err(|e| {
            Error::SessionStore(format!("failed to parse {}: {}", path.display(), e))
        })?;
        rlog_debug!("loaded session {}", session_id);
        Ok(Some(record))
    }

    /// Persist the whole record, bumping `last_active`. The only write
    /// path; partial-field updates do not exist.
    pub fn save(&self, record: &mut SessionRecord) -> Result<()> {
        record.touch();
        fs::create_dir_all(&self.dir)?;

        let path = self.session_path(&record.session_id);
        let contents = serde_json::to_string_pretty(record)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)?;
        fs::rename(&temp_path, &path)?;
        rlog_debug!("saved session {}", record.session_id);
        Ok(())
    }

    /// All sessions, most recently active first. With `active_only`, only
    /// those with at least one live recorded pid.
    pub fn list_sessions(&self, active_only: bool) -> Result<Vec<SessionRecord>> {
        let mut sessions = Vec::new();
        if !self.dir.exists() {
            return Ok(sessions);
        }
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(stem) {
                Ok(Some(record)) => {
                    if active_only && !self.is_active(&record) {
                        continue;
                    }
                    sessions.push(record);
                }
                Ok(None) => {}
                Err(e) => {
                    rlog_warn!("skipping unreadable session file {}: {}", path.display(), e)
                }
            }
        }
        sessions.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(sessions)
    }

    /// True iff any recorded participant pid is a live OS process. A
    /// record with no pids is never active.
    pub fn is_active(&self, record: &SessionRecord) -> bool {
        record.participant_pids.values().any(|pid| pid_alive(*pid))
    }

    /// Crash-recovery reconciliation: strip dead pids, set the state from
    /// what remains, persist, and return the cleaned record.
    pub fn recover(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let Some(mut record) = self.load(session_id)? else {
            rlog_warn!("cannot recover session {}: not found", session_id);
            return Ok(None);
        };

        record.participant_pids.retain(|id, pid| {
            let alive = pid_alive(*pid);
            if !alive {
                rlog!("removing dead pid for {}: {}", id, pid);
            }
            alive
        });

        record.state = if record.participant_pids.is_empty() {
            SessionState::Stopped
        } else {
            SessionState::Running
        };

        self.save(&mut record)?;
        rlog!("recovered session {}", session_id);
        Ok(Some(record))
    }

    /// Best-effort teardown: terminate every still-live recorded process,
    /// clear the pid map, persist Stopped, and optionally delete the file.
    /// Never errors on already-dead processes.
    pub fn cleanup(&self, session_id: &str, remove_file: bool) -> Result<bool> {
        let Some(mut record) = self.load(session_id)? else {
            rlog_warn!("session {} not found for cleanup", session_id);
            return Ok(false);
        };

        for (id, pid) in &record.participant_pids {
            if pid_alive(*pid) {
                rlog!("terminating {} (pid {})", id, pid);
                terminate_pid(*pid, TERMINATE_WAIT);
            }
        }

        record.participant_pids.clear();
        record.state = SessionState::Stopped;
        self.save(&mut record)?;

        if remove_file {
            let path = self.session_path(session_id);
            if path.exists() {
                fs::remove_file(&path)?;
                rlog!("removed session file for {}", session_id);
            }
        }

        rlog!("cleaned up session {}", session_id);
        Ok(true)
    }

    /// Remove every inactive session whose `last_active` is older than the
    /// threshold. Active sessions are never removed, regardless of age.
    /// Returns the number removed.
    pub fn cleanup_stale(&self, max_age_hours: u64) -> Result<usize> {
        let mut cleaned = 0;
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours as i64);

        for record in self.list_sessions(false)? {
            if record.last_active >= cutoff {
                continue;
            }
            if self.is_active(&record) {
                continue;
            }
            rlog!(
                "cleaning up stale session {} (last active {})",
                record.session_id,
                record.last_active
            );
            if self.cleanup(&record.session_id, true)? {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    /// Most recent session recorded for a project, if any.
    pub fn find_by_project(&self, project_path: &Path) -> Result<Option<SessionRecord>> {
        let target = project_path
            .canonicalize()
            .unwrap_or_else(|_| project_path.to_path_buf());
        Ok(self
            .list_sessions(false)?
            .into_iter()
            .find(|record| record.project_path == target))
    }
}
