//! Durable payloads.
//!
//! Every decision that must survive leadership change travels through the
//! replication log as one of these payloads: transaction commits carry
//! their candidate, everything else is a bare identifier. Payloads are
//! encoded to opaque bytes before submission; the log itself never
//! inspects them.

use canopy_common::{LocalHistoryId, TransactionId};
use canopy_tree::Candidate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A replicated decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    /// Commit a prepared transaction; followers apply the candidate.
    CommitTransaction {
        id: TransactionId,
        candidate: Arc<Candidate>,
    },
    /// A transaction was aborted before reaching the commit step.
    AbortTransaction { id: TransactionId },
    /// A transaction's bookkeeping may be discarded.
    PurgeTransaction { id: TransactionId },
    /// A chained local history came into existence.
    CreateHistory { id: LocalHistoryId },
    /// A chained local history accepts no further transactions.
    CloseHistory { id: LocalHistoryId },
    /// A local history's bookkeeping may be discarded.
    PurgeHistory { id: LocalHistoryId },
}

impl Payload {
    /// Encode to the opaque byte form handed to the log.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| Error::EncodeFailed(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from the opaque byte form.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| Error::DecodeFailed(e.to_string()))
    }

    /// Identity used to match a replicated payload back to the submission
    /// that produced it.
    pub fn key(&self) -> PayloadKey {
        match self {
            Payload::CommitTransaction { id, .. } => PayloadKey::CommitTransaction(id.clone()),
            Payload::AbortTransaction { id } => PayloadKey::AbortTransaction(id.clone()),
            Payload::PurgeTransaction { id } => PayloadKey::PurgeTransaction(id.clone()),
            Payload::CreateHistory { id } => PayloadKey::CreateHistory(id.clone()),
            Payload::CloseHistory { id } => PayloadKey::CloseHistory(id.clone()),
            Payload::PurgeHistory { id } => PayloadKey::PurgeHistory(id.clone()),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::CommitTransaction { id, .. } => write!(f, "commit-transaction {}", id),
            Payload::AbortTransaction { id } => write!(f, "abort-transaction {}", id),
            Payload::PurgeTransaction { id } => write!(f, "purge-transaction {}", id),
            Payload::CreateHistory { id } => write!(f, "create-history {}", id),
            Payload::CloseHistory { id } => write!(f, "close-history {}", id),
            Payload::PurgeHistory { id } => write!(f, "purge-history {}", id),
        }
    }
}

/// Payload identity: kind plus identifier, without the payload body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadKey {
    CommitTransaction(TransactionId),
    AbortTransaction(TransactionId),
    PurgeTransaction(TransactionId),
    CreateHistory(LocalHistoryId),
    CloseHistory(LocalHistoryId),
    PurgeHistory(LocalHistoryId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_common::{ClientId, FrontendId};

    fn tx_id() -> TransactionId {
        let client = ClientId::new(FrontendId::new("member-1"), 0);
        TransactionId::new(LocalHistoryId::standalone(client), 7)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let payload = Payload::AbortTransaction { id: tx_id() };
        let bytes = payload.encode().unwrap();
        let decoded = Payload::decode(&bytes).unwrap();
        assert_eq!(decoded.key(), payload.key());
    }

    #[test]
    fn test_key_distinguishes_kinds() {
        let abort = Payload::AbortTransaction { id: tx_id() };
        let purge = Payload::PurgeTransaction { id: tx_id() };
        assert_ne!(abort.key(), purge.key());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Payload::decode(b"not a payload").is_err());
    }
}
