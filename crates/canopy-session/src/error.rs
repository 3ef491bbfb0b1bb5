//! Session-boundary errors.
//!
//! The taxonomy matters to clients: sequencing and generation errors are
//! rejected at the session boundary, lifecycle errors distinguish
//! "already decided" from "never existed", and pipeline errors carry the
//! validation/commit/cohort/timeout detail through unchanged.

use canopy_common::{LocalHistoryId, TransactionId};
use canopy_shard::PipelineError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// Request sequence above the expected one: a gap in the stream.
    #[error("out-of-order request sequence {actual}, expecting {expected}")]
    OutOfOrder { expected: u64, actual: u64 },

    /// Request sequence at or below the replay purge low-water mark.
    #[error("request sequence {0} was already purged from the replay window")]
    DeadSequence(u64),

    /// The transaction never existed or its bookkeeping was purged.
    #[error("transaction {0} does not exist")]
    DeadTransaction(TransactionId),

    /// The history never existed or was purged.
    #[error("history {0} does not exist")]
    DeadHistory(LocalHistoryId),

    /// The history accepts no further transactions.
    #[error("history {0} is closed")]
    ClosedHistory(LocalHistoryId),

    /// The transaction was already decided as committed.
    #[error("transaction {0} was already committed")]
    AlreadyCommitted(TransactionId),

    /// The transaction was already decided as aborted.
    #[error("transaction {0} was already aborted")]
    AlreadyAborted(TransactionId),

    /// Connect carried a generation below the tracked one.
    #[error("stale generation {actual}, current generation is {current}")]
    StaleGeneration { current: u64, actual: u64 },

    /// No mutually supported protocol version.
    #[error("no mutually supported protocol version")]
    UnsupportedVersion,

    /// The client has no established session (never connected, or its
    /// generation was superseded and torn down).
    #[error("client has no active session")]
    NoSession,

    /// The request does not apply to the transaction's current state.
    #[error("request not valid while the transaction is {state}")]
    UnexpectedRequest { state: &'static str },

    /// Commit machinery failure, classified by the pipeline.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
