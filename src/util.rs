//! Shared utility functions: blocking helpers and OS process probes.

use std::time::Duration;

use tokio::task::spawn_blocking;

use crate::{Error, Result};

pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Check whether an OS process with the given pid is currently alive.
///
/// Uses a signal-0 probe. EPERM means the process exists but belongs to
/// another user, which still counts as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Send SIGTERM to a process. Best-effort, errors are ignored.
#[cfg(unix)]
pub fn signal_terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return;
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(not(unix))]
pub fn signal_terminate(_pid: u32) {}

/// Send SIGKILL to a process. Best-effort, errors are ignored.
#[cfg(unix)]
pub fn signal_kill(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return;
    }
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub fn signal_kill(_pid: u32) {}

/// Terminate a process gracefully: SIGTERM, poll for exit up to `wait`,
/// then SIGKILL if it is still alive. Never errors on already-dead pids.
pub fn terminate_pid(pid: u32, wait: Duration) {
    if !pid_alive(pid) {
        return;
    }
    signal_terminate(pid);
    let deadline = std::time::Instant::now() + wait;
    while pid_alive(pid) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    if pid_alive(pid) {
        signal_kill(pid);
    }
}
