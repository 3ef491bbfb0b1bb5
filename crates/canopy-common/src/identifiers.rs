//! Client, history and transaction identifiers.
//!
//! Identity is hierarchical: a frontend connects under a generation epoch,
//! opens local histories inside that generation, and allocates transactions
//! with a per-history monotonic counter. The composite identifiers sort
//! lexicographically along that hierarchy, which gives a deterministic total
//! order for free.

use serde::{Deserialize, Serialize};
use std::fmt;

/// History id reserved for the always-present standalone history.
pub const STANDALONE_HISTORY: u64 = 0;

/// Name of a client frontend instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrontendId(String);

impl FrontendId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrontendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A frontend at a particular generation epoch.
///
/// Generations are compared unsigned; a connect with a higher generation
/// supersedes all state belonging to lower generations of the same frontend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId {
    frontend: FrontendId,
    generation: u64,
}

impl ClientId {
    pub fn new(frontend: FrontendId, generation: u64) -> Self {
        Self {
            frontend,
            generation,
        }
    }

    pub fn frontend(&self) -> &FrontendId {
        &self.frontend
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-gen-{}", self.frontend, self.generation)
    }
}

/// Identifier of a local history within a client generation.
///
/// History 0 is the standalone history which exists for every connected
/// client; chained histories use ids allocated by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalHistoryId {
    client: ClientId,
    history: u64,
}

impl LocalHistoryId {
    pub fn new(client: ClientId, history: u64) -> Self {
        Self { client, history }
    }

    /// The standalone history of a client.
    pub fn standalone(client: ClientId) -> Self {
        Self::new(client, STANDALONE_HISTORY)
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn history(&self) -> u64 {
        self.history
    }

    pub fn is_standalone(&self) -> bool {
        self.history == STANDALONE_HISTORY
    }
}

impl fmt::Display for LocalHistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-chn-{}", self.client, self.history)
    }
}

/// Identifier of a single transaction within a local history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    history: LocalHistoryId,
    transaction: u64,
}

impl TransactionId {
    pub fn new(history: LocalHistoryId, transaction: u64) -> Self {
        Self {
            history,
            transaction,
        }
    }

    pub fn history(&self) -> &LocalHistoryId {
        &self.history
    }

    pub fn transaction(&self) -> u64 {
        self.transaction
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-txn-{}", self.history, self.transaction)
    }
}
