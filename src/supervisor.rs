//! Supervision of one external interactive process.
//!
//! `SupervisedProcess` wraps a [`ProcessChannel`](crate::channel::ProcessChannel)
//! with an explicit state machine (stopped/starting/running/error),
//! retry-with-backoff for transient command timeouts, crash detection, and
//! restart/recovery. Every state-changing method acquires the per-process
//! channel lock, so transitions are linearizable and at most one command is
//! in flight at a time.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tokio::sync::Mutex;

use crate::channel::{ChannelHealth, ProcessChannel};
use crate::config::SpawnSpec;
use crate::participant::ParticipantId;
use crate::{rlog, rlog_debug, rlog_error, rlog_warn, Error, Result};

/// Pause between a stop and the subsequent start during restart.
const RESTART_PAUSE: Duration = Duration::from_secs(1);

/// Inter-attempt restart backoff cap.
const RESTART_BACKOFF_CAP_SECS: u64 = 10;

/// Reduced attempt budget used by crash recovery.
const RECOVERY_ATTEMPTS: u32 = 2;

/// Lifecycle state of a supervised process.
///
/// Transitions happen only through the supervised process itself; the
/// table in [`ProcessState::can_transition`] is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Error => "error",
        }
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition(self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopped)
                | (Running, Error)
                | (Running, Stopped)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backoff policy for retrying timed-out commands.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; 3 retries means 4 attempts total.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based):
    /// `min(initial * base^retry, max_delay)`, scaled by a uniform jitter
    /// factor in [0.5, 1.5) when enabled.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.initial_delay.as_secs_f64() * self.base.powi(retry as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// Run `op` until it succeeds, retrying only on timeouts.
///
/// `op` receives the number of retries so far (0 on the initial attempt).
/// Non-timeout errors are returned immediately: they indicate the process
/// is dead, not slow.
pub async fn retry_on_timeout<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0u32;
    loop {
        match op(retries).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_timeout() && retries < policy.max_retries => {
                retries += 1;
                let delay = policy.delay_for(retries);
                rlog_warn!(
                    "retry {}/{} after {:.2}s: {}",
                    retries,
                    policy.max_retries,
                    delay.as_secs_f64(),
                    err
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug)]
struct Status {
    state: ProcessState,
    health: Option<Arc<ChannelHealth>>,
    pid: Option<u32>,
}

/// One supervised external process bound to a participant identity.
pub struct SupervisedProcess {
    id: ParticipantId,
    spec: SpawnSpec,
    project_path: PathBuf,
    pattern: Regex,
    retry_policy: RetryPolicy,
    status: RwLock<Status>,
    /// Owns the channel and serializes lifecycle changes and in-flight
    /// commands; commands from different callers never interleave.
    channel: Mutex<Option<ProcessChannel>>,
}

impl SupervisedProcess {
    pub fn new(id: ParticipantId, spec: SpawnSpec, project_path: PathBuf) -> Result<Self> {
        let pattern = spec.pattern()?;
        Ok(Self {
            id,
            spec,
            project_path,
            pattern,
            retry_policy: RetryPolicy::default(),
            status: RwLock::new(Status {
                state: ProcessState::Stopped,
                health: None,
                pid: None,
            }),
            channel: Mutex::new(None),
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    pub fn state(&self) -> ProcessState {
        self.read_status().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.read_status().pid
    }

    /// True iff the state machine says Running and the OS-level handle is
    /// still alive. Side-effect-free.
    pub fn is_alive(&self) -> bool {
        let status = self.read_status();
        status.state == ProcessState::Running
            && status
                .health
                .as_ref()
                .map(|h| h.is_alive())
                .unwrap_or(false)
    }

    /// Alive and in the Running state; logs the reason when unhealthy.
    pub fn health_check(&self) -> bool {
        if !self.is_alive() {
            rlog_warn!("{} health check failed: process not alive", self.id);
            return false;
        }
        true
    }

    /// Start the process: spawn, wait for the startup prompt, send the
    /// optional init command. Idempotent when already running.
    pub async fn start(&self) -> Result<bool> {
        let mut slot = self.channel.lock().await;

        if self.state() == ProcessState::Running {
            if self.is_alive() {
                rlog_warn!("{} already running", self.id);
                return Ok(true);
            }
            // Externally-observed death: flag it before restarting.
            self.mark_error_if_running("process died");
        }

        self.transition(ProcessState::Starting)?;
        rlog!("starting {}...", self.id);

        if which::which(&self.spec.command).is_err() {
            self.force_error();
            return Err(Error::Process(format!(
                "executable '{}' not found for {}",
                self.spec.command, self.id
            )));
        }

        let mut channel = match ProcessChannel::spawn(
            self.id.as_str(),
            &self.spec.command,
            &self.spec.args,
            &self.project_path,
        ) {
            Ok(channel) => channel,
            Err(e) => {
                self.force_error();
                return Err(Error::Process(format!("failed to start {}: {}", self.id, e)));
            }
        };

        // Startup handshake: the first prompt must appear in time.
        if let Err(e) = channel
            .expect(&self.pattern, self.spec.startup_timeout())
            .await
        {
            self.force_error();
            channel.terminate(true).await;
            return Err(Error::Process(format!("failed to start {}: {}", self.id, e)));
        }

        if let Some(init) = &self.spec.init_command {
            rlog_debug!("sending init command to {}", self.id);
            if let Err(e) = channel.send_line(init).await {
                self.force_error();
                channel.terminate(true).await;
                return Err(Error::Process(format!(
                    "init command for {} failed: {}",
                    self.id, e
                )));
            }
            if let Err(e) = channel.expect(&self.pattern, self.spec.timeout()).await {
                self.force_error();
                channel.terminate(true).await;
                return Err(Error::Process(format!(
                    "init command for {} failed: {}",
                    self.id, e
                )));
            }
        }

        {
            let mut status = self.write_status();
            status.state = ProcessState::Running;
            status.health = Some(channel.health());
            status.pid = channel.pid();
        }
        rlog!("{} started (pid {:?})", self.id, channel.pid());
        *slot = Some(channel);
        Ok(true)
    }

    /// Send one command and block until the end-of-response pattern matches
    /// or the timeout elapses. `None` uses the spec's default timeout.
    pub async fn send_command(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        if self.state() != ProcessState::Running {
            return Err(Error::Process(format!("{} is not running", self.id)));
        }
        let timeout = timeout.unwrap_or_else(|| self.spec.timeout());

        let mut slot = self.channel.lock().await;
        let channel = slot
            .as_mut()
            .ok_or_else(|| Error::Process(format!("{} has no active channel", self.id)))?;

        if !channel.is_alive() {
            self.mark_error_if_running("process died before command");
            return Err(Error::Process(format!(
                "{} process terminated unexpectedly",
                self.id
            )));
        }

        channel.send_line(command).await.map_err(|e| {
            self.mark_error_if_running("write failed");
            e
        })?;
        rlog_debug!(
            "sent to {}: {}",
            self.id,
            command.chars().take(80).collect::<String>()
        );

        match channel.expect(&self.pattern, timeout).await {
            Ok(output) => {
                let output = output.trim().to_string();
                rlog_debug!(
                    "received from {}: {} chars",
                    self.id,
                    output.len()
                );
                Ok(output)
            }
            Err(Error::Timeout(elapsed)) => Err(Error::Timeout(elapsed)),
            Err(err) => {
                self.mark_error_if_running("process died mid-command");
                Err(err)
            }
        }
    }

    /// Send with automatic retry on timeout, using exponential backoff.
    ///
    /// Pending output from a timed-out attempt is discarded before each
    /// retry, so a slow reply cannot be misread as the retry's response.
    pub async fn send_command_with_retry(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        retry_on_timeout(&self.retry_policy, |retries| async move {
            if retries > 0 {
                self.discard_pending().await;
            }
            self.send_command(command, timeout).await
        })
        .await
    }

    async fn discard_pending(&self) {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_mut() {
            let dropped = channel.drain();
            if dropped > 0 {
                rlog_debug!(
                    "discarded {} bytes of stale output from {}",
                    dropped,
                    self.id
                );
            }
        }
    }

    /// Stop the process. Idempotent: stopping an already-stopped process is
    /// a no-op.
    pub async fn stop(&self, force: bool) -> Result<()> {
        let mut slot = self.channel.lock().await;
        if self.state() == ProcessState::Stopped {
            rlog_debug!("{} already stopped", self.id);
            return Ok(());
        }
        rlog!("stopping {}...", self.id);

        if let Some(channel) = slot.take() {
            channel.terminate(force).await;
        }

        {
            let mut status = self.write_status();
            status.state = ProcessState::Stopped;
            status.health = None;
            status.pid = None;
        }
        rlog!("{} stopped", self.id);
        Ok(())
    }

    /// Stop, pause briefly, start again; repeat up to `max_attempts` with
    /// backoff capped at 10s per attempt.
    pub async fn restart(&self, max_attempts: u32) -> Result<bool> {
        rlog!("restarting {}...", self.id);

        for attempt in 1..=max_attempts {
            rlog_debug!("restart attempt {}/{} for {}", attempt, max_attempts, self.id);
            let attempt_result = async {
                self.stop(false).await?;
                tokio::time::sleep(RESTART_PAUSE).await;
                self.start().await
            }
            .await;

            match attempt_result {
                Ok(true) => {
                    rlog!("successfully restarted {}", self.id);
                    return Ok(true);
                }
                Ok(false) => {
                    rlog_warn!(
                        "failed to restart {} (attempt {}/{})",
                        self.id,
                        attempt,
                        max_attempts
                    );
                }
                Err(e) => {
                    rlog_error!(
                        "error during restart attempt {}/{} for {}: {}",
                        attempt,
                        max_attempts,
                        self.id,
                        e
                    );
                }
            }

            if attempt < max_attempts {
                let delay = Duration::from_secs(2u64.pow(attempt).min(RESTART_BACKOFF_CAP_SECS));
                rlog_debug!("waiting {:?} before next restart attempt", delay);
                tokio::time::sleep(delay).await;
            }
        }

        Err(Error::Process(format!(
            "failed to restart {} after {} attempts",
            self.id, max_attempts
        )))
    }

    /// Recover from a crash: no-op when still alive, otherwise force the
    /// Error state and restart with a reduced attempt budget.
    pub async fn recover_from_crash(&self) -> bool {
        if self.is_alive() {
            rlog_debug!("{} is still alive, no recovery needed", self.id);
            return true;
        }
        rlog_warn!("attempting to recover {} from crash", self.id);
        self.force_error();

        match self.restart(RECOVERY_ATTEMPTS).await {
            Ok(ok) => ok,
            Err(e) => {
                rlog_error!("recovery failed for {}: {}", self.id, e);
                false
            }
        }
    }

    /// Checked transition; identity transitions are no-ops, illegal ones
    /// are rejected.
    fn transition(&self, to: ProcessState) -> Result<()> {
        let mut status = self.write_status();
        if status.state == to {
            return Ok(());
        }
        if !status.state.can_transition(to) {
            return Err(Error::Validation(format!(
                "invalid process state transition {} -> {} for {}",
                status.state, to, self.id
            )));
        }
        rlog_debug!("{}: {} -> {}", self.id, status.state, to);
        status.state = to;
        Ok(())
    }

    /// Flip Running to Error exactly once when a death is observed.
    fn mark_error_if_running(&self, reason: &str) {
        let mut status = self.write_status();
        if status.state == ProcessState::Running {
            rlog_warn!("{}: running -> error ({})", self.id, reason);
            status.state = ProcessState::Error;
        }
    }

    /// Unconditionally force the Error state (crash recovery entry point).
    fn force_error(&self) {
        let mut status = self.write_status();
        if status.state != ProcessState::Error {
            rlog_debug!("{}: {} -> error (forced)", self.id, status.state);
            status.state = ProcessState::Error;
        }
    }

    fn read_status(&self) -> RwLockReadGuard<'_, Status> {
        match self.status.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_status(&self) -> RwLockWriteGuard<'_, Status> {
        match self.status.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for SupervisedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisedProcess")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}
