//! Per-transaction commit state.

use crate::error::PipelineError;
use canopy_cohort::{CohortCoordinator, RegistrySnapshot};
use canopy_common::TransactionId;
use canopy_tree::{Candidate, Modification};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Lifecycle of one transaction inside the pipeline.
///
/// Operations performed out of the expected state are a programming
/// contract violation, reported as
/// [`PipelineError::ContractViolation`] and never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CohortState {
    Ready,
    CanCommitPending,
    CanCommitComplete,
    PreCommitPending,
    PreCommitComplete,
    CommitPending,
    Committed,
    Aborted,
    Failed,
}

impl CohortState {
    pub fn name(&self) -> &'static str {
        match self {
            CohortState::Ready => "READY",
            CohortState::CanCommitPending => "CAN_COMMIT_PENDING",
            CohortState::CanCommitComplete => "CAN_COMMIT_COMPLETE",
            CohortState::PreCommitPending => "PRE_COMMIT_PENDING",
            CohortState::PreCommitComplete => "PRE_COMMIT_COMPLETE",
            CohortState::CommitPending => "COMMIT_PENDING",
            CohortState::Committed => "COMMITTED",
            CohortState::Aborted => "ABORTED",
            CohortState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CohortState::Committed | CohortState::Aborted | CohortState::Failed
        )
    }
}

/// Callback for canCommit / preCommit / abort steps. Runs on the owner
/// task; it must only enqueue further work, never mutate pipeline state
/// directly.
pub type StepCallback = Box<dyn FnOnce(Result<(), PipelineError>) + Send>;

/// Callback for the commit step, resolved with the replication log index
/// once the transaction is durable and applied.
pub type CommitCallback = Box<dyn FnOnce(Result<u64, PipelineError>) + Send>;

/// One in-flight local transaction.
pub struct CommitCohort {
    id: TransactionId,
    modification: Arc<Modification>,
    participating_shards: Option<BTreeSet<String>>,
    registry_snapshot: RegistrySnapshot,
    state: CohortState,
    candidate: Option<Arc<Candidate>>,
    coordinator: Option<CohortCoordinator>,
    step_callback: Option<StepCallback>,
    commit_callback: Option<CommitCallback>,
    failure: Option<PipelineError>,
    log_index: Option<u64>,
}

impl CommitCohort {
    pub fn new(
        id: TransactionId,
        modification: Arc<Modification>,
        participating_shards: Option<BTreeSet<String>>,
        registry_snapshot: RegistrySnapshot,
    ) -> Self {
        Self {
            id,
            modification,
            participating_shards,
            registry_snapshot,
            state: CohortState::Ready,
            candidate: None,
            coordinator: None,
            step_callback: None,
            commit_callback: None,
            failure: None,
            log_index: None,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn state(&self) -> CohortState {
        self.state
    }

    pub fn set_state(&mut self, state: CohortState) {
        self.state = state;
    }

    pub fn modification(&self) -> &Modification {
        &self.modification
    }

    pub fn registry_snapshot(&self) -> &RegistrySnapshot {
        &self.registry_snapshot
    }

    pub fn candidate(&self) -> Option<&Arc<Candidate>> {
        self.candidate.as_ref()
    }

    pub fn set_candidate(&mut self, candidate: Arc<Candidate>) {
        self.candidate = Some(candidate);
    }

    pub fn coordinator(&self) -> Option<&CohortCoordinator> {
        self.coordinator.as_ref()
    }

    pub fn set_coordinator(&mut self, coordinator: CohortCoordinator) {
        self.coordinator = Some(coordinator);
    }

    pub fn take_coordinator(&mut self) -> Option<CohortCoordinator> {
        self.coordinator.take()
    }

    pub fn set_step_callback(&mut self, callback: StepCallback) {
        debug_assert!(self.step_callback.is_none(), "step callback already pending");
        self.step_callback = Some(callback);
    }

    pub fn take_step_callback(&mut self) -> Option<StepCallback> {
        self.step_callback.take()
    }

    pub fn set_commit_callback(&mut self, callback: CommitCallback) {
        debug_assert!(
            self.commit_callback.is_none(),
            "commit callback already pending"
        );
        self.commit_callback = Some(callback);
    }

    pub fn take_commit_callback(&mut self) -> Option<CommitCallback> {
        self.commit_callback.take()
    }

    /// Whether a commit has been requested but not yet submitted.
    pub fn commit_requested(&self) -> bool {
        self.commit_callback.is_some()
    }

    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some() || self.state == CohortState::Failed
    }

    /// Record a terminal failure. The first recorded failure wins; it is
    /// surfaced on whatever operation next touches this transaction.
    pub fn record_failure(&mut self, failure: PipelineError) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
        self.state = CohortState::Failed;
    }

    pub fn log_index(&self) -> Option<u64> {
        self.log_index
    }

    pub fn set_log_index(&mut self, index: u64) {
        self.log_index = Some(index);
    }

    /// The subset of this transaction's declared participating shards
    /// that lexicographically precede `own_shard`. `None` when the
    /// transaction declared no participant set.
    pub fn preceding_shards(&self, own_shard: &str) -> Option<BTreeSet<String>> {
        self.participating_shards.as_ref().map(|shards| {
            shards
                .iter()
                .filter(|shard| shard.as_str() < own_shard)
                .cloned()
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_cohort::CohortRegistry;
    use canopy_common::{ClientId, FrontendId, LocalHistoryId};

    fn cohort(participants: Option<&[&str]>) -> CommitCohort {
        let client = ClientId::new(FrontendId::new("member-1"), 0);
        let id = TransactionId::new(LocalHistoryId::standalone(client), 0);
        CommitCohort::new(
            id,
            Arc::new(Modification::new()),
            participants.map(|p| p.iter().map(|s| s.to_string()).collect()),
            CohortRegistry::new().snapshot(),
        )
    }

    #[test]
    fn test_preceding_shards_subset() {
        let cohort = cohort(Some(&["cars", "people", "topology"]));
        let preceding = cohort.preceding_shards("people").unwrap();
        assert_eq!(preceding, BTreeSet::from(["cars".to_string()]));

        let all_before = cohort.preceding_shards("zzz").unwrap();
        assert_eq!(all_before.len(), 3);
    }

    #[test]
    fn test_preceding_shards_undeclared() {
        assert!(cohort(None).preceding_shards("people").is_none());
    }

    #[test]
    fn test_first_failure_wins() {
        let mut cohort = cohort(None);
        cohort.record_failure(PipelineError::Aborted);
        cohort.record_failure(PipelineError::Committing);
        assert_eq!(cohort.failure(), Some(&PipelineError::Aborted));
        assert_eq!(cohort.state(), CohortState::Failed);
    }
}
