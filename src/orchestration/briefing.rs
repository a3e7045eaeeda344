//! Boundary to the context-generation collaborator.
//!
//! Before starting participants, the orchestrator asks this collaborator
//! whether per-participant briefing files already exist and, if not (or on
//! force-reinit), asks it to produce one briefing per participant. The
//! orchestrator never inspects the content.

use std::fs;
use std::path::Path;

use crate::participant::ParticipantId;
use crate::{rlog, Result};

pub trait BriefingProvider: Send + Sync {
    /// Does every requested participant already have a briefing file?
    fn briefings_exist(&self, project_path: &Path, participants: &[ParticipantId]) -> bool;

    /// Produce one briefing file per participant.
    fn generate(&self, project_path: &Path, participants: &[ParticipantId]) -> Result<()>;
}

/// Filesystem-backed provider: one markdown file per participant at the
/// project root (CLAUDE.md, CODEX.md, GEMINI.md).
#[derive(Debug, Default)]
pub struct FileBriefings;

impl FileBriefings {
    pub fn new() -> Self {
        Self
    }
}

impl BriefingProvider for FileBriefings {
    fn briefings_exist(&self, project_path: &Path, participants: &[ParticipantId]) -> bool {
        participants
            .iter()
            .all(|id| project_path.join(id.briefing_filename()).exists())
    }

    fn generate(&self, project_path: &Path, participants: &[ParticipantId]) -> Result<()> {
        for id in participants {
            let path = project_path.join(id.briefing_filename());
            let contents = format!(
                "# Briefing for {}\n\nProject: {}\n",
                id,
                project_path.display()
            );
            fs::write(&path, contents)?;
            rlog!("generated {}", path.display());
        }
        Ok(())
    }
}

/// Provider that reports briefings present and generates nothing. Useful
/// when a project manages its own context files.
#[derive(Debug, Default)]
pub struct NoopBriefings;

impl BriefingProvider for NoopBriefings {
    fn briefings_exist(&self, _project_path: &Path, _participants: &[ParticipantId]) -> bool {
        true
    }

    fn generate(&self, _project_path: &Path, _participants: &[ParticipantId]) -> Result<()> {
        Ok(())
    }
}
