//! Orchestration: composing supervised processes into a roundtable.

mod briefing;
mod orchestrator;

pub use briefing::{BriefingProvider, FileBriefings, NoopBriefings};
pub use orchestrator::{Orchestrator, OrchestratorState, SessionSummary};
