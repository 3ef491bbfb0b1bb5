//! Pipeline errors.

use canopy_cohort::CohortError;
use canopy_tree::{CommitError, ValidationError};
use thiserror::Error;

/// Terminal failure of a pipeline operation. Every variant is surfaced
/// to the client envelope; nothing is silently swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Optimistic-lock conflict during validation. Local to the
    /// offending transaction; the client must resubmit.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Local apply failure after replication consensus. A hard error,
    /// never retried: retrying could double-apply or desynchronize
    /// followers.
    #[error("commit failed after consensus: {0}")]
    Commit(#[from] CommitError),

    /// An external participant failed a protocol phase.
    #[error("cohort coordination failed: {0}")]
    Cohort(#[from] CohortError),

    /// Idle past the configured deadline.
    #[error("transaction timed out in state {state}")]
    Timeout { state: &'static str },

    /// The transaction was aborted while an operation was outstanding.
    #[error("transaction aborted")]
    Aborted,

    /// A predecessor abort invalidated this transaction's prepared
    /// candidate while it could not be re-prepared.
    #[error("prepared candidate was invalidated by a predecessor abort")]
    CandidateInvalidated,

    /// The transaction reached the replication log; the only paths
    /// forward are replication success or failure.
    #[error("transaction is committing and cannot be aborted")]
    Committing,

    /// An operation was issued against the wrong state. Fatal, not
    /// retried.
    #[error("commit contract violated: {0}")]
    ContractViolation(String),

    /// The replication log rejected a submission outright.
    #[error("replication submission failed: {0}")]
    Replication(String),

    /// The shard is surrendering its state (leadership loss, shutdown).
    #[error("shard is shutting down")]
    Shutdown,
}
