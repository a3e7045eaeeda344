//! Top-level orchestrator: the single entry point a caller drives.
//!
//! Composes the process registry, the discussion coordinator, and the
//! session store. One exclusive lock guards the orchestrator state, the
//! registry map, and the in-memory session record; discussion sends run
//! outside that lock on cloned process handles, and every discussion
//! re-acquires it to append and persist its history entry before
//! returning. The in-memory record is authoritative while the process
//! lives; persistence failures are logged, never fatal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::discussion::{
    DiscussionCoordinator, DiscussionMode, DiscussionResponse, ReviewOutcome,
};
use crate::orchestration::briefing::{BriefingProvider, FileBriefings};
use crate::participant::ParticipantId;
use crate::registry::ProcessRegistry;
use crate::store::{HistoryEntry, SessionRecord, SessionState, SessionStore};
use crate::supervisor::SupervisedProcess;
use crate::util::blocking;
use crate::{rlog, rlog_debug, rlog_error, rlog_warn, Error, Result};

/// Orchestrator lifecycle state. Transitions are confined to the table in
/// [`OrchestratorState::can_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    Paused,
    Error,
}

impl OrchestratorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestratorState::Stopped => "stopped",
            OrchestratorState::Starting => "starting",
            OrchestratorState::Running => "running",
            OrchestratorState::Paused => "paused",
            OrchestratorState::Error => "error",
        }
    }

    pub fn can_transition(self, to: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Error)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of the current session for UIs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: OrchestratorState,
    pub project_path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub active_participants: Vec<ParticipantId>,
    pub history_count: usize,
}

struct Shared {
    state: OrchestratorState,
    registry: ProcessRegistry,
    session: SessionRecord,
}

pub struct Orchestrator {
    project_path: PathBuf,
    config: Config,
    store: SessionStore,
    briefings: Box<dyn BriefingProvider>,
    inner: Mutex<Shared>,
}

impl Orchestrator {
    /// Create an orchestrator with a fresh session record, persisted
    /// immediately.
    pub fn new(
        project_path: impl Into<PathBuf>,
        config: Config,
        store: SessionStore,
    ) -> Result<Self> {
        let project_path = project_path.into();
        let session = store.create(&project_path, None)?;
        rlog!(
            "orchestrator created: session={} project={}",
            session.session_id,
            project_path.display()
        );
        Ok(Self {
            project_path,
            config,
            store,
            briefings: Box::new(FileBriefings::new()),
            inner: Mutex::new(Shared {
                state: OrchestratorState::Stopped,
                registry: ProcessRegistry::new(),
                session,
            }),
        })
    }

    /// Swap in a different briefing collaborator.
    pub fn with_briefings(mut self, briefings: Box<dyn BriefingProvider>) -> Self {
        self.briefings = briefings;
        self
    }

    pub fn project_path(&self) -> &PathBuf {
        &self.project_path
    }

    pub async fn state(&self) -> OrchestratorState {
        self.inner.lock().await.state
    }

    pub async fn session_id(&self) -> String {
        self.inner.lock().await.session.session_id.clone()
    }

    /// Participants whose process currently reports alive.
    pub async fn active_participants(&self) -> Vec<ParticipantId> {
        self.inner.lock().await.registry.live()
    }

    /// Replace the in-memory session with a recovered record from disk.
    /// History is fully replaced, not merged.
    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        let store = self.store.clone();
        let id = session_id.to_string();
        let record = blocking(move || store.recover(&id)).await?;
        let record = record.ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        let mut shared = self.inner.lock().await;
        rlog!(
            "resumed session {} ({} history entries)",
            record.session_id,
            record.conversation_history.len()
        );
        shared.session = record;
        Ok(())
    }

    /// Start every enabled participant.
    ///
    /// Returns the per-participant result map when everyone starts. A
    /// partial start commits the degraded Running state and reports
    /// `PartialStartup`; zero starts is fatal to this session attempt.
    pub async fn start_all(
        &self,
        force_reinit: bool,
    ) -> Result<HashMap<ParticipantId, bool>> {
        let mut shared = self.inner.lock().await;

        if shared.state == OrchestratorState::Running {
            rlog_warn!("orchestrator already running");
            return Ok(shared
                .registry
                .participants()
                .into_iter()
                .map(|id| (id, true))
                .collect());
        }

        transition(&mut shared.state, OrchestratorState::Starting)?;
        rlog!("initializing roundtable for {}", self.project_path.display());

        let enabled = self.config.enabled_participants();
        if force_reinit || !self.briefings.briefings_exist(&self.project_path, &enabled) {
            rlog!("generating participant briefings...");
            if let Err(e) = self.briefings.generate(&self.project_path, &enabled) {
                rlog_warn!("briefing generation failed: {}", e);
            }
        }

        let mut results = HashMap::new();
        let mut succeeded = Vec::new();
        let mut failed: HashMap<ParticipantId, String> = HashMap::new();

        for id in ParticipantId::all() {
            let Some(spec) = self.config.spec_for(id) else {
                rlog_warn!("participant {} not found in configuration, skipping", id);
                results.insert(id, false);
                failed.insert(id, "not configured".to_string());
                continue;
            };
            if !spec.enabled {
                rlog!("skipping {} (disabled in config)", id);
                results.insert(id, false);
                continue;
            }

            rlog!("checking {}...", id);
            let process = match SupervisedProcess::new(
                id,
                spec.clone(),
                self.project_path.clone(),
            ) {
                Ok(process) => Arc::new(process),
                Err(e) => {
                    rlog_error!("invalid spawn spec for {}: {}", id, e);
                    results.insert(id, false);
                    failed.insert(id, e.to_string());
                    continue;
                }
            };

            match process.start().await {
                Ok(_) => {
                    results.insert(id, true);
                    succeeded.push(id);
                    shared.registry.insert(id, process);
                    rlog!("{} available", id);
                }
                Err(e) => {
                    rlog_error!("error starting {}: {}", id, e);
                    results.insert(id, false);
                    failed.insert(id, e.to_string());
                }
            }
        }

        if succeeded.is_empty() {
            transition(&mut shared.state, OrchestratorState::Error)?;
            rlog_error!("no participants available");
            return Err(Error::NoParticipants);
        }

        transition(&mut shared.state, OrchestratorState::Running)?;
        shared.session.participant_pids = shared.registry.pids();
        shared.session.state = SessionState::Running;
        self.persist(&mut shared).await;

        if failed.is_empty() {
            rlog!(
                "roundtable ready with {}/{} participants",
                succeeded.len(),
                enabled.len()
            );
            Ok(results)
        } else {
            rlog_warn!(
                "roundtable ready with {}/{} participants ({} unavailable)",
                succeeded.len(),
                enabled.len(),
                failed.len()
            );
            Err(Error::PartialStartup { succeeded, failed })
        }
    }

    /// Stop every participant. Idempotent.
    pub async fn stop_all(&self, force: bool) -> Result<()> {
        let mut shared = self.inner.lock().await;
        if shared.state == OrchestratorState::Stopped {
            rlog_debug!("orchestrator already stopped");
            return Ok(());
        }
        rlog_debug!("closing {} participant sessions...", shared.registry.len());

        shared.registry.stop_all(force).await;
        shared.registry.clear();

        transition(&mut shared.state, OrchestratorState::Stopped)?;
        shared.session.participant_pids.clear();
        shared.session.state = SessionState::Stopped;
        self.persist(&mut shared).await;
        rlog_debug!("session ended");
        Ok(())
    }

    /// Broadcast a question to every participant concurrently and collect
    /// responses in completion order.
    pub async fn broadcast(
        &self,
        question: &str,
        timeout: Duration,
    ) -> Result<Vec<DiscussionResponse>> {
        let coordinator = {
            let shared = self.inner.lock().await;
            if shared.state != OrchestratorState::Running {
                return Err(Error::NotRunning);
            }
            rlog!(
                "starting parallel discussion with {} participants",
                shared.registry.len()
            );
            DiscussionCoordinator::new(shared.registry.snapshot())
        };

        let responses = coordinator.broadcast(question, timeout).await;
        self.record_discussion(DiscussionMode::Parallel, question, responses.clone(), None)
            .await;
        Ok(responses)
    }

    /// Relay a question through participants in order (default order when
    /// none is given), feeding each one the growing transcript.
    pub async fn relay(
        &self,
        question: &str,
        order: Option<Vec<ParticipantId>>,
    ) -> Result<Vec<DiscussionResponse>> {
        let coordinator = {
            let shared = self.inner.lock().await;
            if shared.state != OrchestratorState::Running {
                return Err(Error::NotRunning);
            }
            let order = order.unwrap_or_else(ParticipantId::default_order);
            // Deterministic ordering: the configured order, filtered to
            // registered participants.
            let handles: Vec<_> = order
                .into_iter()
                .filter_map(|id| shared.registry.get(&id).map(|p| (id, p)))
                .collect();
            rlog!(
                "starting sequential discussion with {} participants",
                handles.len()
            );
            DiscussionCoordinator::new(handles)
        };

        let responses = coordinator.relay(question).await;
        self.record_discussion(
            DiscussionMode::Sequential,
            question,
            responses.clone(),
            None,
        )
        .await;
        Ok(responses)
    }

    /// Run the propose-review protocol between two participants.
    pub async fn propose_review(
        &self,
        task: &str,
        proposer: ParticipantId,
        reviewer: ParticipantId,
        iterations: u32,
    ) -> Result<ReviewOutcome> {
        let coordinator = {
            let shared = self.inner.lock().await;
            if shared.state != OrchestratorState::Running {
                return Err(Error::NotRunning);
            }
            DiscussionCoordinator::new(shared.registry.snapshot())
        };

        let outcome = coordinator
            .propose_review(task, proposer, reviewer, iterations)
            .await?;

        let mut responses = outcome.proposals.clone();
        responses.extend(outcome.reviews.iter().cloned());
        let mut metadata = Map::new();
        metadata.insert("proposer".to_string(), Value::from(proposer.as_str()));
        metadata.insert("reviewer".to_string(), Value::from(reviewer.as_str()));
        self.record_discussion(DiscussionMode::Review, task, responses, Some(metadata))
            .await;
        Ok(outcome)
    }

    /// Pause without stopping participants.
    pub async fn pause(&self) -> Result<()> {
        let mut shared = self.inner.lock().await;
        if shared.state == OrchestratorState::Running {
            transition(&mut shared.state, OrchestratorState::Paused)?;
            self.persist(&mut shared).await;
            rlog!("orchestrator paused");
        }
        Ok(())
    }

    /// Resume a paused orchestrator, restarting any participant that died
    /// while paused.
    pub async fn resume(&self) -> Result<()> {
        let mut shared = self.inner.lock().await;
        if shared.state != OrchestratorState::Paused {
            return Ok(());
        }

        let dead: Vec<ParticipantId> = shared
            .registry
            .participants()
            .into_iter()
            .filter(|id| !shared.registry.alive(id))
            .collect();

        if !dead.is_empty() {
            rlog_warn!("participants died during pause: {:?}", dead);
            for id in dead {
                if let Some(process) = shared.registry.get(&id) {
                    rlog!("restarting {}...", id);
                    if !process.recover_from_crash().await {
                        rlog_error!("failed to restart {}", id);
                    }
                }
            }
            shared.session.participant_pids = shared.registry.pids();
        }

        transition(&mut shared.state, OrchestratorState::Running)?;
        shared.session.state = SessionState::Running;
        self.persist(&mut shared).await;
        rlog!("orchestrator resumed");
        Ok(())
    }

    /// Snapshot of the current session.
    pub async fn summary(&self) -> SessionSummary {
        let shared = self.inner.lock().await;
        SessionSummary {
            session_id: shared.session.session_id.clone(),
            state: shared.state,
            project_path: self.project_path.clone(),
            started_at: shared.session.created_at,
            active_participants: shared.registry.live(),
            history_count: shared.session.conversation_history.len(),
        }
    }

    /// Append one history entry and persist before returning, so a
    /// recorded discussion survives any later crash.
    async fn record_discussion(
        &self,
        mode: DiscussionMode,
        question: &str,
        responses: Vec<DiscussionResponse>,
        metadata: Option<Map<String, Value>>,
    ) {
        let mut shared = self.inner.lock().await;
        shared.session.push_history(HistoryEntry {
            timestamp: Utc::now(),
            mode,
            question: question.to_string(),
            responses,
            metadata: metadata.unwrap_or_default(),
        });
        self.persist(&mut shared).await;
    }

    /// Flush the in-memory record. Failures are logged and do not abort
    /// the operation that triggered them; memory stays authoritative.
    async fn persist(&self, shared: &mut Shared) {
        let store = self.store.clone();
        let mut record = shared.session.clone();
        let result = blocking(move || {
            store.save(&mut record)?;
            Ok(record)
        })
        .await;
        match result {
            Ok(record) => shared.session.last_active = record.last_active,
            Err(e) => rlog_error!("failed to save session state: {}", e),
        }
    }
}

fn transition(state: &mut OrchestratorState, to: OrchestratorState) -> Result<()> {
    if *state == to {
        return Ok(());
    }
    if !state.can_transition(to) {
        return Err(Error::Validation(format!(
            "invalid orchestrator transition {} -> {}",
            state, to
        )));
    }
    rlog_debug!("orchestrator: {} -> {}", state, to);
    *state = to;
    Ok(())
}
