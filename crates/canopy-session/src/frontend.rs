//! Frontend transaction state as observed by the shard leader.

use crate::error::SessionError;
use crate::messages::ResponseEnvelope;
use canopy_common::TransactionId;
use canopy_tree::{Modification, Snapshot};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// Pipeline progress of a readied transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadyStage {
    CanCommitPending,
    CanCommitComplete,
    PreCommitPending,
    PreCommitComplete,
    CommitPending,
}

/// Transaction lifecycle at the session boundary.
pub(crate) enum TxPhase {
    /// Accepting modifications and reads.
    Open {
        modification: Modification,
        snapshot: Snapshot,
    },
    /// Modification sealed, not yet readied into the pipeline.
    Sealed {
        modification: Arc<Modification>,
        participating_shards: Option<BTreeSet<String>>,
    },
    /// Enqueued in the commit pipeline.
    Ready { stage: ReadyStage },
    Committed,
    /// Abort requested, durable decision pending.
    Aborting,
    Aborted,
    /// A local failure was recorded; all subsequent requests
    /// short-circuit to it.
    Failed(SessionError),
    /// The owning history or generation was torn down; late callbacks
    /// and requests are suppressed.
    Retired,
}

impl TxPhase {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            TxPhase::Open { .. } => "open",
            TxPhase::Sealed { .. } => "sealed",
            TxPhase::Ready { .. } => "ready",
            TxPhase::Committed => "committed",
            TxPhase::Aborting => "aborting",
            TxPhase::Aborted => "aborted",
            TxPhase::Failed(_) => "failed",
            TxPhase::Retired => "retired",
        }
    }
}

/// Outcome of a replay lookup.
pub(crate) enum ReplayOutcome {
    /// The recorded response, to be resent verbatim.
    Recorded(ResponseEnvelope),
    /// The sequence fell below the purge low-water mark.
    Purged,
    /// Valid window but no response yet; the reply is still in the
    /// works and the client will retry.
    InFlight,
}

/// Per-transaction session state: lifecycle phase plus the bounded
/// replay window of previously sent responses.
pub(crate) struct FrontendTransaction {
    id: TransactionId,
    pub(crate) phase: TxPhase,
    /// Responses already sent, oldest first, keyed by their envelope
    /// sequence. Bounded by the configured replay window.
    replay: VecDeque<ResponseEnvelope>,
    /// Highest sequence evicted from the replay window.
    last_purged_sequence: Option<u64>,
}

impl FrontendTransaction {
    pub(crate) fn new_open(id: TransactionId, snapshot: Snapshot) -> Self {
        Self {
            id,
            phase: TxPhase::Open {
                modification: Modification::new(),
                snapshot,
            },
            replay: VecDeque::new(),
            last_purged_sequence: None,
        }
    }

    pub(crate) fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Record a response for replay, evicting the oldest entry once the
    /// window is full. Eviction advances the purge low-water mark.
    pub(crate) fn record_response(&mut self, envelope: &ResponseEnvelope, window: usize) {
        while self.replay.len() >= window.max(1) {
            if let Some(evicted) = self.replay.pop_front() {
                self.last_purged_sequence = Some(evicted.sequence);
            }
        }
        self.replay.push_back(envelope.clone());
    }

    /// Look up the recorded response for `sequence`.
    pub(crate) fn replay(&self, sequence: u64) -> ReplayOutcome {
        if let Some(purged) = self.last_purged_sequence {
            if sequence <= purged {
                return ReplayOutcome::Purged;
            }
        }
        for recorded in &self.replay {
            if recorded.sequence == sequence {
                return ReplayOutcome::Recorded(recorded.clone());
            }
        }
        ReplayOutcome::InFlight
    }

    pub(crate) fn retire(&mut self) {
        self.phase = TxPhase::Retired;
    }
}
