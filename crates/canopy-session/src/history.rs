//! Local history bookkeeping.
//!
//! Decided and purged transaction ids are kept as compacted range sets,
//! never enumerated individually, so a retried request against an
//! already-decided transaction is answered without re-deriving anything
//! from the tree.

use crate::frontend::FrontendTransaction;
use canopy_common::{LocalHistoryId, RangeSet};
use std::collections::HashMap;

/// Durable outcome of a closed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecidedOutcome {
    Committed,
    Aborted,
}

/// One local history of a connected client. History 0 is the standalone
/// history; the rest are client-created chains.
pub(crate) struct LocalHistory {
    id: LocalHistoryId,
    pub(crate) transactions: HashMap<u64, FrontendTransaction>,
    committed: RangeSet,
    aborted: RangeSet,
    purged: RangeSet,
    closed: bool,
}

impl LocalHistory {
    pub(crate) fn new(id: LocalHistoryId) -> Self {
        Self {
            id,
            transactions: HashMap::new(),
            committed: RangeSet::new(),
            aborted: RangeSet::new(),
            purged: RangeSet::new(),
            closed: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn record_committed(&mut self, transaction: u64) {
        self.committed.insert(transaction);
    }

    pub(crate) fn record_aborted(&mut self, transaction: u64) {
        self.aborted.insert(transaction);
    }

    /// Drop all bookkeeping for `transaction`, replay window included.
    pub(crate) fn record_purged(&mut self, transaction: u64) {
        self.purged.insert(transaction);
        self.transactions.remove(&transaction);
    }

    pub(crate) fn is_purged(&self, transaction: u64) -> bool {
        self.purged.contains(transaction)
    }

    pub(crate) fn outcome_of(&self, transaction: u64) -> Option<DecidedOutcome> {
        if self.committed.contains(transaction) {
            Some(DecidedOutcome::Committed)
        } else if self.aborted.contains(transaction) {
            Some(DecidedOutcome::Aborted)
        } else {
            None
        }
    }

    /// Suppress all remaining transaction state; late callbacks become
    /// no-ops.
    pub(crate) fn retire(&mut self) {
        tracing::debug!("retiring history {}", self.id);
        for transaction in self.transactions.values_mut() {
            transaction.retire();
        }
        self.closed = true;
    }
}
