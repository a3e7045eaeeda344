//! Full orchestrator flows: start-all, discussions with history, partial
//! failure, pause/resume, shutdown.

use std::collections::HashMap;
use std::time::Duration;

use roundtable::{
    DiscussionMode, Error, Orchestrator, OrchestratorState, ParticipantId, SessionState,
};

use crate::fixtures::*;

fn echo_orchestrator(env: &TestEnv) -> Orchestrator {
    Orchestrator::new(
        env.project_dir.path(),
        config_from(|_| sh_spec(&echo_script())),
        env.store.clone(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_start_all_brings_up_every_participant() {
    let env = test_env();
    let orchestrator = echo_orchestrator(&env);

    let results = orchestrator.start_all(false).await.unwrap();
    let expected: HashMap<ParticipantId, bool> = ParticipantId::all()
        .into_iter()
        .map(|id| (id, true))
        .collect();
    assert_eq!(results, expected);
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);
    assert_eq!(orchestrator.active_participants().await.len(), 3);

    // Session on disk records live pids and the running state.
    let session_id = orchestrator.session_id().await;
    let record = env.store.load(&session_id).unwrap().unwrap();
    assert_eq!(record.participant_pids.len(), 3);
    assert_eq!(record.state, SessionState::Running);
    assert!(env.store.is_active(&record));

    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_start_all_generates_briefings() {
    let env = test_env();
    let orchestrator = echo_orchestrator(&env);

    for id in ParticipantId::all() {
        assert!(!env.project_dir.path().join(id.briefing_filename()).exists());
    }
    orchestrator.start_all(false).await.unwrap();
    for id in ParticipantId::all() {
        assert!(env.project_dir.path().join(id.briefing_filename()).exists());
    }
    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_start_all_twice_reports_running_participants() {
    let env = test_env();
    let orchestrator = echo_orchestrator(&env);

    orchestrator.start_all(false).await.unwrap();
    let again = orchestrator.start_all(false).await.unwrap();
    assert_eq!(again.len(), 3);
    assert!(again.values().all(|ok| *ok));
    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_partial_startup_commits_degraded_mode() {
    let env = test_env();
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|id| match id {
            ParticipantId::Codex => missing_spec(),
            _ => sh_spec(&echo_script()),
        }),
        env.store.clone(),
    )
    .unwrap();

    let result = orchestrator.start_all(false).await;
    match result {
        Err(Error::PartialStartup { succeeded, failed }) => {
            assert_eq!(
                succeeded,
                vec![ParticipantId::ClaudeCode, ParticipantId::Gemini]
            );
            assert!(failed.contains_key(&ParticipantId::Codex));
        }
        other => panic!("expected PartialStartup, got {:?}", other.map(|_| ())),
    }

    // Degraded but running: discussions proceed with who is available.
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);
    let responses = orchestrator
        .broadcast("still here?", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(responses.len(), 2);
    assert!(responses.iter().all(|r| r.is_ok()));

    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_zero_startup_is_fatal() {
    let env = test_env();
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|_| missing_spec()),
        env.store.clone(),
    )
    .unwrap();

    let result = orchestrator.start_all(false).await;
    assert!(matches!(result, Err(Error::NoParticipants)));
    assert_eq!(orchestrator.state().await, OrchestratorState::Error);
}

#[tokio::test]
async fn test_disabled_participants_are_skipped_not_failed() {
    let env = test_env();
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|id| {
            let mut spec = sh_spec(&echo_script());
            spec.enabled = id == ParticipantId::ClaudeCode;
            spec
        }),
        env.store.clone(),
    )
    .unwrap();

    // One enabled participant starting cleanly is a full (not partial)
    // startup.
    let results = orchestrator.start_all(false).await.unwrap();
    assert_eq!(results.get(&ParticipantId::ClaudeCode), Some(&true));
    assert_eq!(results.get(&ParticipantId::Codex), Some(&false));
    assert_eq!(orchestrator.active_participants().await.len(), 1);
    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_broadcast_persists_history_before_returning() {
    let env = test_env();
    let orchestrator = echo_orchestrator(&env);
    orchestrator.start_all(false).await.unwrap();

    orchestrator
        .broadcast("what do you think?", Duration::from_secs(5))
        .await
        .unwrap();

    // The entry must already be on disk, not just in memory.
    let session_id = orchestrator.session_id().await;
    let record = env.store.load(&session_id).unwrap().unwrap();
    assert_eq!(record.conversation_history.len(), 1);
    let entry = &record.conversation_history[0];
    assert_eq!(entry.mode, DiscussionMode::Parallel);
    assert_eq!(entry.question, "what do you think?");
    assert_eq!(entry.responses.len(), 3);

    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_relay_records_sequential_history() {
    let env = test_env();
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|id| match id {
            ParticipantId::ClaudeCode => sh_spec(&responder_script("alpha")),
            ParticipantId::Codex => sh_spec(&responder_script("bravo")),
            ParticipantId::Gemini => sh_spec(&responder_script("charlie")),
        }),
        env.store.clone(),
    )
    .unwrap();
    orchestrator.start_all(false).await.unwrap();

    let responses = orchestrator.relay("ASK:decide", None).await.unwrap();
    assert_eq!(responses.len(), 3);
    assert_eq!(responses[0].response, "alpha-1");

    let session_id = orchestrator.session_id().await;
    let record = env.store.load(&session_id).unwrap().unwrap();
    assert_eq!(record.conversation_history.len(), 1);
    assert_eq!(
        record.conversation_history[0].mode,
        DiscussionMode::Sequential
    );

    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_review_records_roles_in_metadata() {
    let env = test_env();
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|id| match id {
            ParticipantId::ClaudeCode => sh_spec(&responder_script("alpha")),
            _ => sh_spec(&responder_script("bravo")),
        }),
        env.store.clone(),
    )
    .unwrap();
    orchestrator.start_all(false).await.unwrap();

    let outcome = orchestrator
        .propose_review("ASK:plan", ParticipantId::ClaudeCode, ParticipantId::Codex, 1)
        .await
        .unwrap();
    assert_eq!(outcome.proposals.len(), 1);
    assert_eq!(outcome.reviews.len(), 1);

    let session_id = orchestrator.session_id().await;
    let record = env.store.load(&session_id).unwrap().unwrap();
    let entry = &record.conversation_history[0];
    assert_eq!(entry.mode, DiscussionMode::Review);
    assert_eq!(entry.metadata["proposer"], "claude_code");
    assert_eq!(entry.metadata["reviewer"], "codex");
    assert_eq!(entry.responses.len(), 2);

    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_stop_all_clears_session_and_is_idempotent() {
    let env = test_env();
    let orchestrator = echo_orchestrator(&env);
    orchestrator.start_all(false).await.unwrap();

    orchestrator.stop_all(false).await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    assert!(orchestrator.active_participants().await.is_empty());

    let session_id = orchestrator.session_id().await;
    let record = env.store.load(&session_id).unwrap().unwrap();
    assert!(record.participant_pids.is_empty());
    assert_eq!(record.state, SessionState::Stopped);
    assert!(!env.store.is_active(&record));

    // Second stop is a no-op.
    orchestrator.stop_all(true).await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
}

#[tokio::test]
async fn test_pause_blocks_discussions_until_resume() {
    let env = test_env();
    let orchestrator = echo_orchestrator(&env);
    orchestrator.start_all(false).await.unwrap();

    orchestrator.pause().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Paused);
    assert!(matches!(
        orchestrator.broadcast("q", Duration::from_secs(1)).await,
        Err(Error::NotRunning)
    ));

    orchestrator.resume().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);
    let responses = orchestrator
        .broadcast("back?", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(responses.len(), 3);

    orchestrator.stop_all(false).await.unwrap();
}

#[tokio::test]
async fn test_resume_restarts_participants_that_died_while_paused() {
    let env = test_env();
    let orchestrator = Orchestrator::new(
        env.project_dir.path(),
        config_from(|id| {
            let mut spec = if id == ParticipantId::ClaudeCode {
                sh_spec(&dies_on_first_command_script())
            } else {
                sh_spec(&echo_script())
            };
            spec.enabled = id != ParticipantId::Gemini;
            spec
        }),
        env.store.clone(),
    )
    .unwrap();
    orchestrator.start_all(false).await.unwrap();

    // Kill claude by talking to it, then pause with it dead.
    let responses = orchestrator
        .broadcast("die please", Duration::from_secs(5))
        .await
        .unwrap();
    let claude = responses
        .iter()
        .find(|r| r.participant == ParticipantId::ClaudeCode)
        .unwrap();
    assert!(!claude.is_ok());
    assert_eq!(orchestrator.active_participants().await.len(), 1);

    orchestrator.pause().await.unwrap();
    orchestrator.resume().await.unwrap();

    // Resume brought the dead participant back.
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);
    assert_eq!(orchestrator.active_participants().await.len(), 2);

    orchestrator.stop_all(false).await.unwrap();
}
