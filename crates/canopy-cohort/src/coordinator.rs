//! Three-phase coordination across the cohorts affected by one
//! transaction.
//!
//! The coordinator fans a phase out to every affected cohort, gathers the
//! answers and, on any failure, compensates by aborting exactly the
//! cohorts that succeeded in that same round. Compensation scope is a
//! correctness requirement: a cohort that already refused must not
//! receive an abort for work it never accepted.

use crate::affected::CanCommitMessage;
use crate::protocol::CohortError;
use canopy_common::TransactionId;
use futures::future::join_all;
use std::time::Duration;

/// Per-phase round-trip timeouts.
#[derive(Debug, Clone)]
pub struct CohortTimeouts {
    pub can_commit: Duration,
    pub pre_commit: Duration,
    pub commit: Duration,
    pub abort: Duration,
}

impl Default for CohortTimeouts {
    fn default() -> Self {
        Self {
            can_commit: Duration::from_secs(5),
            pre_commit: Duration::from_secs(5),
            commit: Duration::from_secs(5),
            abort: Duration::from_secs(5),
        }
    }
}

/// Coordination progress for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinationState {
    Idle,
    CanCommitSent,
    CanCommitSuccessful,
    PreCommitSent,
    PreCommitSuccessful,
    CommitSent,
    Committed,
    Aborted,
    Failed,
}

/// Drives the three-phase protocol against the cohorts affected by one
/// transaction's candidate.
#[derive(Debug)]
pub struct CohortCoordinator {
    tx: TransactionId,
    state: CoordinationState,
    messages: Vec<CanCommitMessage>,
    timeouts: CohortTimeouts,
}

impl CohortCoordinator {
    pub fn new(
        tx: TransactionId,
        messages: Vec<CanCommitMessage>,
        timeouts: CohortTimeouts,
    ) -> Self {
        Self {
            tx,
            state: CoordinationState::Idle,
            messages,
            timeouts,
        }
    }

    pub fn state(&self) -> CoordinationState {
        self.state
    }

    /// Whether no cohort is affected at all. Every phase is then a no-op
    /// without network round-trips.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Phase one: deliver each cohort its aggregated affected subtrees.
    pub async fn can_commit(&mut self) -> Result<(), CohortError> {
        self.expect(CoordinationState::Idle, "canCommit");
        self.state = CoordinationState::CanCommitSent;

        let timeout = self.timeouts.can_commit;
        let tx = self.tx.clone();
        let outcomes = join_all(self.messages.iter().map(|message| {
            let tx = tx.clone();
            let subtrees = message.subtrees.clone();
            async move { message.handle.can_commit(tx, subtrees, timeout).await }
        }))
        .await;

        self.settle_round(outcomes, CoordinationState::CanCommitSuccessful)
            .await
    }

    /// Phase two.
    pub async fn pre_commit(&mut self) -> Result<(), CohortError> {
        self.expect(CoordinationState::CanCommitSuccessful, "preCommit");
        self.state = CoordinationState::PreCommitSent;

        let timeout = self.timeouts.pre_commit;
        let tx = self.tx.clone();
        let outcomes = join_all(self.messages.iter().map(|message| {
            let tx = tx.clone();
            async move { message.handle.pre_commit(tx, timeout).await }
        }))
        .await;

        self.settle_round(outcomes, CoordinationState::PreCommitSuccessful)
            .await
    }

    /// Phase three. The transaction is already replicated at this point:
    /// a refusing cohort cannot undo it, so failures are surfaced but no
    /// compensation is attempted.
    pub async fn commit(&mut self) -> Result<(), CohortError> {
        self.expect(CoordinationState::PreCommitSuccessful, "commit");
        self.state = CoordinationState::CommitSent;

        let timeout = self.timeouts.commit;
        let tx = self.tx.clone();
        let outcomes = join_all(self.messages.iter().map(|message| {
            let tx = tx.clone();
            async move { message.handle.commit(tx, timeout).await }
        }))
        .await;

        let mut first_failure = None;
        for outcome in outcomes {
            if let Err(e) = outcome {
                tracing::error!("{}: cohort failed after consensus: {}", self.tx, e);
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            None => {
                self.state = CoordinationState::Committed;
                Ok(())
            }
            Some(e) => {
                self.state = CoordinationState::Failed;
                Err(e)
            }
        }
    }

    /// Abort every affected cohort, e.g. because the transaction was
    /// aborted locally after its cohorts had already answered.
    pub async fn abort(&mut self) {
        self.state = CoordinationState::Aborted;
        let handles: Vec<_> = self.messages.iter().map(|m| m.handle.clone()).collect();
        self.abort_handles(&handles).await;
    }

    /// Gather one round's outcomes; on failure abort the same-round
    /// successes and report the first failure.
    async fn settle_round(
        &mut self,
        outcomes: Vec<Result<(), CohortError>>,
        success_state: CoordinationState,
    ) -> Result<(), CohortError> {
        let mut succeeded = Vec::new();
        let mut first_failure = None;
        for (message, outcome) in self.messages.iter().zip(outcomes) {
            match outcome {
                Ok(()) => succeeded.push(message.handle.clone()),
                Err(e) => {
                    tracing::warn!("{}: cohort round-trip failed: {}", self.tx, e);
                    first_failure.get_or_insert(e);
                }
            }
        }

        match first_failure {
            None => {
                self.state = success_state;
                Ok(())
            }
            Some(e) => {
                self.abort_handles(&succeeded).await;
                self.state = CoordinationState::Failed;
                Err(e)
            }
        }
    }

    async fn abort_handles(&self, handles: &[crate::protocol::CohortHandle]) {
        let timeout = self.timeouts.abort;
        let tx = self.tx.clone();
        let outcomes = join_all(handles.iter().map(|handle| {
            let tx = tx.clone();
            async move { handle.abort(tx, timeout).await }
        }))
        .await;

        for outcome in outcomes {
            if let Err(e) = outcome {
                tracing::warn!("{}: cohort abort failed: {}", self.tx, e);
            }
        }
    }

    fn expect(&self, state: CoordinationState, phase: &str) {
        debug_assert_eq!(
            self.state, state,
            "{}: {} issued in state {:?}",
            self.tx, phase, self.state
        );
    }
}
