//! Client request and response envelopes.

use crate::error::SessionError;
use canopy_common::{ClientId, FrontendId, LocalHistoryId, TransactionId, TreePath};
use canopy_tree::{ModOp, Node};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Session establishment request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub frontend: FrontendId,
    pub generation: u64,
    /// Inclusive range of protocol versions the client supports.
    pub min_version: u32,
    pub max_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Highest mutually supported protocol version.
    pub version: u32,
}

/// How a modify request finishes the transaction, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishProtocol {
    /// Discard the transaction.
    Abort,
    /// Seal the modification for a later commit request.
    Ready,
    /// Run canCommit, preCommit and commit as one step.
    Simple,
    /// Run canCommit now; preCommit and commit arrive as separate
    /// requests.
    ThreePhase,
}

/// Operations against a single transaction.
#[derive(Debug)]
pub enum TransactionAction {
    Modify {
        ops: Vec<ModOp>,
        protocol: Option<FinishProtocol>,
        /// Shards participating in this transaction, for cross-shard
        /// ordering. `None` for single-shard transactions.
        participating_shards: Option<BTreeSet<String>>,
    },
    Read { path: TreePath },
    Exists { path: TreePath },
    PreCommit,
    DoCommit,
    Abort,
    Purge,
}

#[derive(Debug)]
pub struct TransactionRequest {
    pub id: TransactionId,
    pub action: TransactionAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryAction {
    Create,
    Close,
    Purge,
}

#[derive(Debug)]
pub struct HistoryRequest {
    pub id: LocalHistoryId,
    pub action: HistoryAction,
}

/// A client request routed through the session.
#[derive(Debug)]
pub enum Request {
    Transaction(TransactionRequest),
    History(HistoryRequest),
}

impl Request {
    /// The client this request belongs to.
    pub fn client(&self) -> &ClientId {
        match self {
            Request::Transaction(request) => request.id.history().client(),
            Request::History(request) => request.id.client(),
        }
    }
}

/// Successful response payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    ModifyAck,
    ReadData { data: Option<Arc<Node>> },
    ExistsData { present: bool },
    CanCommitAck,
    PreCommitAck,
    CommitAck { log_index: u64 },
    AbortAck,
    PurgeAck,
    HistoryAck,
}

/// The reply sent for one request envelope. Recorded replies are resent
/// verbatim on replay, original execution time included.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub sequence: u64,
    pub result: Result<ResponseBody, SessionError>,
    pub execution_ticks: u64,
}

/// One client request plus its per-connection sequence number and reply
/// channel. Retries carry a fresh reply channel with the same sequence.
#[derive(Debug)]
pub struct RequestEnvelope {
    pub sequence: u64,
    pub request: Request,
    pub reply: oneshot::Sender<ResponseEnvelope>,
}
