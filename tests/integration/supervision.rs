//! Supervised process lifecycle: startup, exchanges, timeouts, retry,
//! crash detection and recovery.

use std::time::Duration;

use roundtable::{Error, ParticipantId, ProcessState, RetryPolicy};

use crate::fixtures::*;

#[tokio::test]
async fn test_full_lifecycle() {
    let process = supervised(ParticipantId::ClaudeCode, &echo_script());
    assert_eq!(process.state(), ProcessState::Stopped);

    assert!(process.start().await.unwrap());
    assert_eq!(process.state(), ProcessState::Running);
    assert!(process.is_alive());
    assert!(process.health_check());
    let pid = process.pid().expect("running process has a pid");
    assert!(roundtable::util::pid_alive(pid));

    let output = process.send_command("hello", None).await.unwrap();
    assert_eq!(output, "echo:hello");

    process.stop(false).await.unwrap();
    assert_eq!(process.state(), ProcessState::Stopped);
    assert!(!process.is_alive());
    assert!(process.pid().is_none());
}

#[tokio::test]
async fn test_start_when_running_is_noop() {
    let process = supervised(ParticipantId::ClaudeCode, &echo_script());
    process.start().await.unwrap();
    let pid = process.pid();
    assert!(process.start().await.unwrap());
    // Same process, not a respawn.
    assert_eq!(process.pid(), pid);
    process.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_sequential_commands_stay_aligned() {
    let process = supervised(ParticipantId::Codex, &echo_script());
    process.start().await.unwrap();

    for word in ["one", "two", "three"] {
        let output = process.send_command(word, None).await.unwrap();
        assert_eq!(output, format!("echo:{}", word));
    }
    process.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_restart_yields_fresh_process() {
    let process = supervised(ParticipantId::ClaudeCode, &echo_script());
    process.start().await.unwrap();
    let first_pid = process.pid();

    assert!(process.restart(1).await.unwrap());
    assert_eq!(process.state(), ProcessState::Running);
    assert_ne!(process.pid(), first_pid);

    let output = process.send_command("after", None).await.unwrap();
    assert_eq!(output, "echo:after");
    process.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_crash_is_observed_then_recovered() {
    let process = supervised(ParticipantId::ClaudeCode, &dies_on_first_command_script());
    process.start().await.unwrap();

    // The process exits mid-command: observed death flips state to Error.
    let result = process.send_command("boom", None).await;
    assert!(matches!(result, Err(Error::Process(_))));
    assert_eq!(process.state(), ProcessState::Error);
    assert!(!process.is_alive());
    assert!(!process.health_check());

    // Recovery restarts it behind a fresh prompt.
    assert!(process.recover_from_crash().await);
    assert_eq!(process.state(), ProcessState::Running);
    assert!(process.is_alive());
    process.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_recover_when_alive_is_noop() {
    let process = supervised(ParticipantId::Gemini, &echo_script());
    process.start().await.unwrap();
    let pid = process.pid();

    assert!(process.recover_from_crash().await);
    assert_eq!(process.pid(), pid);
    process.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_timeout_then_retry_exhaustion() {
    let policy = RetryPolicy {
        max_retries: 1,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        base: 2.0,
        jitter: false,
    };
    let process =
        supervised(ParticipantId::Codex, &silent_script()).with_retry_policy(policy);
    process.start().await.unwrap();

    let result = process
        .send_command_with_retry("anyone?", Some(Duration::from_millis(200)))
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    // Timeouts leave the process running; it is slow, not dead.
    assert_eq!(process.state(), ProcessState::Running);
    process.stop(true).await.unwrap();
}

#[tokio::test]
async fn test_retry_discards_stale_output_from_timed_out_attempt() {
    // First reply is delayed past the command timeout; it lands during the
    // backoff pause. The retry must not read it as its own response.
    let policy = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(5),
        base: 1.0,
        jitter: false,
    };
    let process = supervised(
        ParticipantId::ClaudeCode,
        &slow_first_responder_script("alpha"),
    )
    .with_retry_policy(policy);
    process.start().await.unwrap();

    let output = process
        .send_command_with_retry("ASK:hi", Some(Duration::from_millis(500)))
        .await
        .unwrap();
    // The stale reply was alpha-1; the retry's own reply is alpha-2.
    assert_eq!(output, "alpha-2");
    process.stop(true).await.unwrap();
}
