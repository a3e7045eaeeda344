//! Durable session state across orchestrator instances.

use std::time::Duration;

use roundtable::{Orchestrator, ParticipantId, SessionState};

use crate::fixtures::*;

#[tokio::test]
async fn test_session_file_tracks_real_process_liveness() {
    let env = test_env();
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|_| sh_spec(&echo_script())),
        env.store.clone(),
    )
    .unwrap();
    let session_id = orchestrator.session_id().await;

    orchestrator.start_all(false).await.unwrap();
    let record = env.store.load(&session_id).unwrap().unwrap();
    assert_eq!(record.participant_pids.len(), 3);
    for pid in record.participant_pids.values() {
        assert!(roundtable::util::pid_alive(*pid));
    }
    assert!(env.store.is_active(&record));

    orchestrator.stop_all(false).await.unwrap();
    let record = env.store.load(&session_id).unwrap().unwrap();
    assert!(record.participant_pids.is_empty());
    assert_eq!(record.state, SessionState::Stopped);
    assert!(!env.store.is_active(&record));
}

#[tokio::test]
async fn test_history_survives_orchestrator_restart() {
    let env = test_env();

    let session_id = {
        let orchestrator = Orchestrator::new(
            env.project_dir.path(),
            config_from(|_| sh_spec(&echo_script())),
            env.store.clone(),
        )
        .unwrap();
        orchestrator.start_all(false).await.unwrap();
        orchestrator
            .broadcast("remember this", Duration::from_secs(5))
            .await
            .unwrap();
        orchestrator.stop_all(false).await.unwrap();
        orchestrator.session_id().await
    };

    // A fresh orchestrator instance resumes the recorded session.
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|_| sh_spec(&echo_script())),
        env.store.clone(),
    )
    .unwrap();
    orchestrator.resume_session(&session_id).await.unwrap();

    let summary = orchestrator.summary().await;
    assert_eq!(summary.session_id, session_id);
    assert_eq!(summary.history_count, 1);
}

#[tokio::test]
async fn test_recover_reconciles_recorded_pids() {
    let env = test_env();

    // A session record pointing at one live and one reaped process.
    let mut live_child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let live_pid = live_child.id();

    let mut dead_child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = dead_child.id();
    dead_child.wait().unwrap();

    let mut record = env
        .store
        .create(env.project_dir.path(), Some("crashed".to_string()))
        .unwrap();
    record
        .participant_pids
        .insert(ParticipantId::ClaudeCode, dead_pid);
    record
        .participant_pids
        .insert(ParticipantId::Codex, live_pid);
    record.state = SessionState::Running;
    env.store.save(&mut record).unwrap();

    let recovered = env.store.recover("crashed").unwrap().unwrap();
    assert_eq!(recovered.participant_pids.len(), 1);
    assert_eq!(
        recovered.participant_pids.get(&ParticipantId::Codex),
        Some(&live_pid)
    );
    assert_eq!(recovered.state, SessionState::Running);

    live_child.kill().unwrap();
    live_child.wait().unwrap();
}

#[tokio::test]
async fn test_cleanup_terminates_recorded_processes() {
    let env = test_env();

    let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();

    let mut record = env
        .store
        .create(env.project_dir.path(), Some("leftover".to_string()))
        .unwrap();
    record.participant_pids.insert(ParticipantId::Gemini, pid);
    record.state = SessionState::Running;
    env.store.save(&mut record).unwrap();

    assert!(env.store.cleanup("leftover", true).unwrap());
    let mut child = child;
    let _ = child.wait();
    assert!(!roundtable::util::pid_alive(pid));
    assert!(env.store.load("leftover").unwrap().is_none());
}
