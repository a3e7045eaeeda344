//! Bidirectional text channel to one external interactive process.
//!
//! A `ProcessChannel` spawns the process with piped stdio, runs one
//! background reader task that accumulates everything the process writes
//! (stdout and stderr merged), and lets a caller block until a
//! caller-supplied pattern marks the end of a response. The accumulated
//! buffer is consumed exclusively through `expect`; there is no separate
//! raw-output queue.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{rlog_debug, rlog_trace, rlog_warn, Error, Result};

/// How long a graceful terminate waits before escalating to a kill.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for the reader task to wind down.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Liveness flag shared between the reader task and whoever holds the
/// channel. Flipped exactly once, when the reader observes EOF.
#[derive(Debug, Default)]
pub struct ChannelHealth {
    dead: AtomicBool,
}

impl ChannelHealth {
    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::Relaxed)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::Relaxed);
    }
}

pub struct ProcessChannel {
    child: Child,
    stdin: ChildStdin,
    pid: Option<u32>,
    buffer: Arc<Mutex<String>>,
    notify: Arc<Notify>,
    health: Arc<ChannelHealth>,
    cancel: CancellationToken,
    reader: Option<tokio::task::JoinHandle<()>>,
    name: String,
}

impl ProcessChannel {
    /// Spawn the process and attach the background reader.
    ///
    /// `name` identifies the channel in logs and error messages.
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        cwd: &std::path::Path,
    ) -> Result<Self> {
        rlog_debug!(
            "ProcessChannel::spawn name={} command={} args={:?} cwd={}",
            name,
            command,
            args,
            cwd.display()
        );

        let mut child = Command::new(command)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Process(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Process(format!("no stdin handle for '{}'", name)))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process(format!("no stdout handle for '{}'", name)))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process(format!("no stderr handle for '{}'", name)))?;

        let pid = child.id();
        let buffer = Arc::new(Mutex::new(String::new()));
        let notify = Arc::new(Notify::new());
        let health = Arc::new(ChannelHealth::default());
        let cancel = CancellationToken::new();

        let reader = tokio::spawn({
            let buffer = Arc::clone(&buffer);
            let notify = Arc::clone(&notify);
            let health = Arc::clone(&health);
            let cancel = cancel.clone();
            let name = name.to_string();
            async move {
                let mut out_buf = [0u8; 4096];
                let mut err_buf = [0u8; 4096];
                let mut out_open = true;
                let mut err_open = true;
                while out_open || err_open {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        read = stdout.read(&mut out_buf), if out_open => match read {
                            Ok(0) => out_open = false,
                            Ok(n) => push_output(&name, &buffer, &notify, &out_buf[..n]),
                            Err(e) => {
                                rlog_warn!("read error on {} stdout: {}", name, e);
                                out_open = false;
                            }
                        },
                        read = stderr.read(&mut err_buf), if err_open => match read {
                            Ok(0) => err_open = false,
                            Ok(n) => push_output(&name, &buffer, &notify, &err_buf[..n]),
                            Err(e) => {
                                rlog_warn!("read error on {} stderr: {}", name, e);
                                err_open = false;
                            }
                        },
                    }
                }
                health.mark_dead();
                notify.notify_one();
                rlog_debug!("reader loop for {} stopped", name);
            }
        });

        rlog_debug!("ProcessChannel spawned: {} (pid {:?})", name, pid);

        Ok(Self {
            child,
            stdin,
            pid,
            buffer,
            notify,
            health,
            cancel,
            reader: Some(reader),
            name: name.to_string(),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Shared liveness flag for callers that must not block on the channel.
    pub fn health(&self) -> Arc<ChannelHealth> {
        Arc::clone(&self.health)
    }

    /// Write one command line, newline-terminated.
    pub async fn send_line(&mut self, text: &str) -> Result<()> {
        rlog_trace!("{} <- {} bytes", self.name, text.len() + 1);
        self.stdin
            .write_all(text.as_bytes())
            .await
            .map_err(|e| Error::Process(format!("write to {} failed: {}", self.name, e)))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Process(format!("write to {} failed: {}", self.name, e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| Error::Process(format!("flush to {} failed: {}", self.name, e)))?;
        Ok(())
    }

    /// Block until `pattern` matches in the output stream or `timeout`
    /// elapses. Returns everything before the match and consumes through
    /// the end of the match.
    pub async fn expect(&self, pattern: &Regex, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(output) = self.take_match(pattern) {
                return Ok(output);
            }
            if !self.health.is_alive() {
                // Output can land together with the EOF; scan once more.
                if let Some(output) = self.take_match(pattern) {
                    return Ok(output);
                }
                return Err(Error::Process(format!(
                    "{} terminated while waiting for response",
                    self.name
                )));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout(timeout));
            }
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return Err(Error::Timeout(timeout));
            }
        }
    }

    /// Discard any buffered output that no caller has consumed yet.
    /// Returns the number of bytes dropped.
    pub fn drain(&self) -> usize {
        let mut buf = lock_buffer(&self.buffer);
        let dropped = buf.len();
        buf.clear();
        if dropped > 0 {
            rlog_trace!("{}: drained {} stale bytes", self.name, dropped);
        }
        dropped
    }

    fn take_match(&self, pattern: &Regex) -> Option<String> {
        let mut buf = lock_buffer(&self.buffer);
        let m = pattern.find(&buf)?;
        let (start, end) = (m.start(), m.end());
        let output = buf[..start].to_string();
        let rest = buf.split_off(end);
        *buf = rest;
        Some(output)
    }

    /// Shut down the process and the reader task.
    ///
    /// Graceful mode sends SIGTERM and waits up to the grace period before
    /// killing; force mode kills immediately.
    pub async fn terminate(mut self, force: bool) {
        rlog_debug!("ProcessChannel::terminate name={} force={}", self.name, force);
        self.cancel.cancel();

        if force {
            if let Err(e) = self.child.start_kill() {
                rlog_warn!("failed to kill {}: {}", self.name, e);
            }
            let _ = self.child.wait().await;
        } else {
            if let Some(pid) = self.pid {
                crate::util::signal_terminate(pid);
            }
            match tokio::time::timeout(GRACE_PERIOD, self.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    rlog_warn!("{} did not exit after SIGTERM, killing", self.name);
                    if let Err(e) = self.child.start_kill() {
                        rlog_warn!("failed to kill {}: {}", self.name, e);
                    }
                    let _ = self.child.wait().await;
                }
            }
        }

        if let Some(handle) = self.reader.take() {
            if tokio::time::timeout(READER_JOIN_TIMEOUT, handle)
                .await
                .is_err()
            {
                rlog_warn!("reader for {} did not stop in time", self.name);
            }
        }
        rlog_debug!("ProcessChannel terminated: {}", self.name);
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the reader just needs the signal.
        self.cancel.cancel();
    }
}

fn lock_buffer(buffer: &Mutex<String>) -> MutexGuard<'_, String> {
    match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn push_output(name: &str, buffer: &Mutex<String>, notify: &Notify, bytes: &[u8]) {
    rlog_trace!("{} -> {} bytes", name, bytes.len());
    let text = String::from_utf8_lossy(bytes);
    let mut guard = lock_buffer(buffer);
    guard.push_str(&text);
    drop(guard);
    notify.notify_one();
}
