//! Discussion protocols over a set of supervised processes.
//!
//! Three protocols are supported: broadcast (the same question to every
//! live participant concurrently), relay (each participant sees the
//! question plus all prior answers), and propose-review (one participant
//! proposes, another reviews, for a number of iterations). Individual
//! participant failures never abort a batch; they become error-tagged
//! responses so every requested participant has exactly one entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::participant::ParticipantId;
use crate::supervisor::SupervisedProcess;
use crate::{rlog, rlog_error, rlog_warn, Error, Result};

/// Which protocol produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscussionMode {
    Parallel,
    Sequential,
    Review,
}

impl std::fmt::Display for DiscussionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscussionMode::Parallel => write!(f, "parallel"),
            DiscussionMode::Sequential => write!(f, "sequential"),
            DiscussionMode::Review => write!(f, "review"),
        }
    }
}

/// One participant's contribution to a discussion. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionResponse {
    pub participant: ParticipantId,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DiscussionResponse {
    pub fn ok(participant: ParticipantId, response: impl Into<String>) -> Self {
        Self {
            participant,
            response: response.into(),
            timestamp: Utc::now(),
            error: None,
            metadata: Map::new(),
        }
    }

    /// An error-tagged response with empty text.
    pub fn failed(participant: ParticipantId, error: impl Into<String>) -> Self {
        Self {
            participant,
            response: String::new(),
            timestamp: Utc::now(),
            error: Some(error.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Aligned proposal/review lists from one propose-review run. The two
/// roles are asymmetric, so they are not flattened into one batch.
#[derive(Debug, Clone)]
pub struct ReviewOutcome {
    pub proposals: Vec<DiscussionResponse>,
    pub reviews: Vec<DiscussionResponse>,
}

/// Grow the relay transcript with one participant's answer.
pub fn append_exchange(context: &str, id: ParticipantId, answer: &str) -> String {
    format!("{}\n\n{} response:\n{}", context, id, answer)
}

/// Wrap a proposal for the reviewer.
pub fn review_prompt(proposal: &str) -> String {
    format!("Review this proposal:\n\n{}", proposal)
}

/// Task for the next review iteration: the original task plus the previous
/// round's proposal and review.
pub fn next_iteration_task(task: &str, proposal: &str, review: &str) -> String {
    format!(
        "{}\n\nPrevious proposal:\n{}\n\nReview feedback:\n{}",
        task, proposal, review
    )
}

/// Runs discussion protocols over a snapshot of process handles.
///
/// The snapshot is taken under the orchestrator's lock; the sends happen
/// without it, so a long discussion never blocks lifecycle operations.
pub struct DiscussionCoordinator {
    participants: Vec<(ParticipantId, Arc<SupervisedProcess>)>,
}

impl DiscussionCoordinator {
    pub fn new(participants: Vec<(ParticipantId, Arc<SupervisedProcess>)>) -> Self {
        Self { participants }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn find(&self, id: ParticipantId) -> Option<Arc<SupervisedProcess>> {
        self.participants
            .iter()
            .find(|(pid, _)| *pid == id)
            .map(|(_, p)| Arc::clone(p))
    }

    /// Send the same question to every participant concurrently, one task
    /// per participant. Responses arrive in completion order, not
    /// participant order; the batch always has one entry per participant.
    pub async fn broadcast(&self, question: &str, timeout: Duration) -> Vec<DiscussionResponse> {
        rlog!(
            "broadcast to {} participants (timeout {:?})",
            self.participants.len(),
            timeout
        );

        let mut pending: FuturesUnordered<_> = self
            .participants
            .iter()
            .map(|(id, process)| {
                let id = *id;
                let process = Arc::clone(process);
                let question = question.to_string();
                tokio::spawn(async move { query_one(id, &process, &question, Some(timeout)).await })
            })
            .collect();

        let mut responses = Vec::with_capacity(self.participants.len());
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(response) => responses.push(response),
                Err(e) => rlog_error!("broadcast worker failed: {}", e),
            }
        }
        responses
    }

    /// Ask participants in order; each one sees the original question plus
    /// the growing transcript of prior answers. A failed participant
    /// contributes an error response and does not extend the transcript.
    pub async fn relay(&self, question: &str) -> Vec<DiscussionResponse> {
        rlog!("relay across {} participants", self.participants.len());

        let mut responses = Vec::with_capacity(self.participants.len());
        let mut context = question.to_string();

        for (id, process) in &self.participants {
            if !process.is_alive() {
                rlog_warn!("skipping {} (not available)", id);
                responses.push(DiscussionResponse::failed(
                    *id,
                    format!("{} not available", id),
                ));
                continue;
            }

            match process.send_command(&context, None).await {
                Ok(answer) => {
                    context = append_exchange(&context, *id, &answer);
                    rlog!("received relay response from {}", id);
                    responses.push(DiscussionResponse::ok(*id, answer));
                }
                Err(e) => {
                    rlog_error!("relay error from {}: {}", id, e);
                    responses.push(DiscussionResponse::failed(*id, e.to_string()));
                }
            }
        }
        responses
    }

    /// Run the propose-review loop. Halts early the first time either side
    /// fails; there is nothing constructive to review further.
    ///
    /// Errors only on protocol preconditions (a missing role); per-iteration
    /// failures are recorded as error responses in the outcome.
    pub async fn propose_review(
        &self,
        task: &str,
        proposer: ParticipantId,
        reviewer: ParticipantId,
        iterations: u32,
    ) -> Result<ReviewOutcome> {
        let proposer_proc = self
            .find(proposer)
            .ok_or(Error::ParticipantNotAvailable(proposer))?;
        let reviewer_proc = self
            .find(reviewer)
            .ok_or(Error::ParticipantNotAvailable(reviewer))?;

        rlog!(
            "review mode: {} -> {} ({} iterations)",
            proposer,
            reviewer,
            iterations
        );

        let mut proposals = Vec::new();
        let mut reviews = Vec::new();
        let mut current_task = task.to_string();

        for iteration in 1..=iterations {
            rlog!("review iteration {}/{}", iteration, iterations);

            let proposal_text = match proposer_proc.send_command(&current_task, None).await {
                Ok(text) => {
                    proposals.push(
                        DiscussionResponse::ok(proposer, text.clone())
                            .with_meta("iteration", iteration)
                            .with_meta("role", "proposer"),
                    );
                    text
                }
                Err(e) => {
                    rlog_error!("error getting proposal from {}: {}", proposer, e);
                    proposals.push(
                        DiscussionResponse::failed(proposer, e.to_string())
                            .with_meta("iteration", iteration)
                            .with_meta("role", "proposer"),
                    );
                    break;
                }
            };

            let prompt = review_prompt(&proposal_text);
            match reviewer_proc.send_command(&prompt, None).await {
                Ok(review_text) => {
                    reviews.push(
                        DiscussionResponse::ok(reviewer, review_text.clone())
                            .with_meta("iteration", iteration)
                            .with_meta("role", "reviewer"),
                    );
                    if iteration < iterations {
                        current_task = next_iteration_task(task, &proposal_text, &review_text);
                    }
                }
                Err(e) => {
                    rlog_error!("error getting review from {}: {}", reviewer, e);
                    reviews.push(
                        DiscussionResponse::failed(reviewer, e.to_string())
                            .with_meta("iteration", iteration)
                            .with_meta("role", "reviewer"),
                    );
                    break;
                }
            }
        }

        Ok(ReviewOutcome { proposals, reviews })
    }
}

async fn query_one(
    id: ParticipantId,
    process: &SupervisedProcess,
    question: &str,
    timeout: Option<Duration>,
) -> DiscussionResponse {
    if !process.is_alive() {
        return DiscussionResponse::failed(id, format!("{} not available", id));
    }
    match process.send_command(question, timeout).await {
        Ok(text) => {
            rlog!("received response from {}", id);
            DiscussionResponse::ok(id, text)
        }
        Err(e) => {
            rlog_error!("error from {}: {}", id, e);
            DiscussionResponse::failed(id, e.to_string())
        }
    }
}
