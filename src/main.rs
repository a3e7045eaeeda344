use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use roundtable::config::Config;
use roundtable::{rlog, Error, Orchestrator, ParticipantId, Result, SessionStore};

/// Roundtable - supervise AI CLI agents and run multi-party discussions
#[derive(Parser, Debug)]
#[command(name = "roundtable")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    ROUNDTABLE_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.roundtable/roundtable.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Project directory (defaults to the current directory)
    #[arg(short = 'p', long)]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Ask every participant the same question in parallel
    Ask {
        /// The question to broadcast
        question: String,

        /// Per-participant timeout in seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Regenerate participant briefings before starting
        #[arg(long)]
        reinit: bool,
    },

    /// Relay a question through participants, each seeing prior answers
    Relay {
        /// The question to relay
        question: String,
    },

    /// One participant proposes, another reviews
    Review {
        /// The task to propose a solution for
        task: String,

        #[arg(long, default_value = "claude_code")]
        proposer: ParticipantId,

        #[arg(long, default_value = "codex")]
        reviewer: ParticipantId,

        #[arg(long, default_value_t = 1)]
        iterations: u32,
    },

    /// List recorded sessions
    Sessions {
        /// Only sessions with a live participant process
        #[arg(long)]
        active: bool,
    },

    /// Reconcile a session's recorded pids against the process table
    Recover {
        /// Session ID to recover
        session_id: String,
    },

    /// Clean up a session, or all stale sessions with --stale-hours
    Cleanup {
        /// Session ID to clean up
        session_id: Option<String>,

        /// Remove all inactive sessions older than this many hours
        #[arg(long)]
        stale_hours: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    roundtable::log::init_with_debug(cli.debug);

    let project = match cli.project {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let store = SessionStore::default_location()?;

    match cli.command {
        Command::Sessions { active } => run_sessions(&store, active),
        Command::Recover { session_id } => run_recover(&store, &session_id),
        Command::Cleanup {
            session_id,
            stale_hours,
        } => run_cleanup(&store, session_id, stale_hours),
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_discussion(command, project, store))
        }
    }
}

/// Run one discussion end to end: start participants, run the protocol,
/// stop everything. The single orchestrator handle also feeds the ctrl-c
/// shutdown hook; there is no ambient global state.
async fn run_discussion(command: Command, project: PathBuf, store: SessionStore) -> Result<()> {
    let config = Config::load()?;
    let orchestrator = Arc::new(Orchestrator::new(project, config, store)?);

    let shutdown = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            rlog!("interrupt received, stopping participants");
            let _ = shutdown.stop_all(true).await;
            std::process::exit(130);
        }
    });

    let reinit = matches!(command, Command::Ask { reinit: true, .. });
    match orchestrator.start_all(reinit).await {
        Ok(_) => {}
        Err(Error::PartialStartup { succeeded, failed }) => {
            eprintln!(
                "Running in degraded mode with {}: unavailable: {}",
                succeeded
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                failed
                    .iter()
                    .map(|(id, reason)| format!("{} ({})", id, reason))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Err(e) => return Err(e),
    }

    // Stop participants even when the discussion itself failed.
    let result = run_command(&orchestrator, command).await;
    orchestrator.stop_all(false).await?;
    result
}

async fn run_command(orchestrator: &Orchestrator, command: Command) -> Result<()> {
    match command {
        Command::Ask {
            question,
            timeout_secs,
            ..
        } => {
            let responses = orchestrator
                .broadcast(&question, Duration::from_secs(timeout_secs))
                .await?;
            print_responses(&responses);
            Ok(())
        }
        Command::Relay { question } => {
            let responses = orchestrator.relay(&question, None).await?;
            print_responses(&responses);
            Ok(())
        }
        Command::Review {
            task,
            proposer,
            reviewer,
            iterations,
        } => {
            let outcome = orchestrator
                .propose_review(&task, proposer, reviewer, iterations)
                .await?;
            for (proposal, review) in outcome.proposals.iter().zip(outcome.reviews.iter()) {
                println!("--- proposal ({}) ---", proposal.participant);
                print_one(proposal);
                println!("--- review ({}) ---", review.participant);
                print_one(review);
            }
            Ok(())
        }
        Command::Sessions { .. } | Command::Recover { .. } | Command::Cleanup { .. } => {
            unreachable!("handled in main")
        }
    }
}

fn print_responses(responses: &[roundtable::DiscussionResponse]) {
    for response in responses {
        println!("--- {} ---", response.participant);
        print_one(response);
    }
}

fn print_one(response: &roundtable::DiscussionResponse) {
    match &response.error {
        Some(error) => println!("(error) {}", error),
        None => println!("{}", response.response),
    }
}

fn run_sessions(store: &SessionStore, active_only: bool) -> Result<()> {
    let sessions = store.list_sessions(active_only)?;
    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }
    for session in sessions {
        let active = if store.is_active(&session) {
            "active"
        } else {
            "inactive"
        };
        println!(
            "{}  {}  {}  last active {}  {} discussions",
            session.session_id,
            session.state,
            active,
            session.last_active.format("%Y-%m-%d %H:%M:%S UTC"),
            session.conversation_history.len()
        );
    }
    Ok(())
}

fn run_recover(store: &SessionStore, session_id: &str) -> Result<()> {
    match store.recover(session_id)? {
        Some(record) => {
            println!(
                "Recovered {}: state {}, {} live participant(s)",
                record.session_id,
                record.state,
                record.participant_pids.len()
            );
            Ok(())
        }
        None => Err(Error::SessionNotFound(session_id.to_string())),
    }
}

fn run_cleanup(
    store: &SessionStore,
    session_id: Option<String>,
    stale_hours: Option<u64>,
) -> Result<()> {
    if let Some(hours) = stale_hours {
        let cleaned = store.cleanup_stale(hours)?;
        println!("Removed {} stale session(s)", cleaned);
        return Ok(());
    }
    match session_id {
        Some(id) => {
            if store.cleanup(&id, true)? {
                println!("Cleaned up session {}", id);
                Ok(())
            } else {
                Err(Error::SessionNotFound(id))
            }
        }
        None => Err(Error::Validation(
            "provide a session id or --stale-hours".to_string(),
        )),
    }
}
