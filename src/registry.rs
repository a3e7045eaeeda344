//! Named collection of supervised processes, one per participant identity.
//!
//! The registry itself is a plain map; the orchestrator mutates it only
//! inside its own critical section, so no interior locking is needed here.

use std::collections::HashMap;
use std::sync::Arc;

use crate::participant::ParticipantId;
use crate::supervisor::SupervisedProcess;
use crate::{rlog_debug, rlog_error};

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: HashMap<ParticipantId, Arc<SupervisedProcess>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process for an identity, replacing any previous one.
    /// At most one live process per identity is the caller's invariant;
    /// replacing logs the event.
    pub fn insert(&mut self, id: ParticipantId, process: Arc<SupervisedProcess>) {
        if self.processes.insert(id, process).is_some() {
            rlog_debug!("registry: replaced process for {}", id);
        }
    }

    pub fn get(&self, id: &ParticipantId) -> Option<Arc<SupervisedProcess>> {
        self.processes.get(id).cloned()
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Arc<SupervisedProcess>> {
        self.processes.remove(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.processes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn clear(&mut self) {
        self.processes.clear();
    }

    /// Registered identities in canonical order.
    pub fn participants(&self) -> Vec<ParticipantId> {
        ParticipantId::all()
            .into_iter()
            .filter(|id| self.processes.contains_key(id))
            .collect()
    }

    /// Identities whose process currently reports alive.
    pub fn live(&self) -> Vec<ParticipantId> {
        self.participants()
            .into_iter()
            .filter(|id| self.alive(id))
            .collect()
    }

    pub fn alive(&self, id: &ParticipantId) -> bool {
        self.processes
            .get(id)
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    /// OS pids of every registered process that has one.
    pub fn pids(&self) -> HashMap<ParticipantId, u32> {
        self.processes
            .iter()
            .filter_map(|(id, p)| p.pid().map(|pid| (*id, pid)))
            .collect()
    }

    /// Cloned handles in canonical order, for use outside the lock.
    pub fn snapshot(&self) -> Vec<(ParticipantId, Arc<SupervisedProcess>)> {
        self.participants()
            .into_iter()
            .filter_map(|id| self.get(&id).map(|p| (id, p)))
            .collect()
    }

    /// Stop every registered process. Per-process failures are logged,
    /// never propagated; shutdown must visit everyone.
    pub async fn stop_all(&self, force: bool) {
        for (id, process) in &self.processes {
            if let Err(e) = process.stop(force).await {
                rlog_error!("error closing {}: {}", id, e);
            }
        }
    }
}
