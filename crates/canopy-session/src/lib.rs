//! Client sessions over the shard commit pipeline.
//!
//! Gives retrying clients exactly-once-visible semantics over an
//! at-least-once channel: per-connection request sequencing, a bounded
//! idempotent replay cache per transaction, local-history lifecycle
//! driven through the replication log, and generation arbitration across
//! client restarts.

pub mod error;
mod frontend;
mod history;
pub mod messages;
pub mod session;

pub use error::SessionError;
pub use messages::{
    ConnectRequest, ConnectResponse, FinishProtocol, HistoryAction, HistoryRequest, Request,
    RequestEnvelope, ResponseBody, ResponseEnvelope, TransactionAction, TransactionRequest,
};
pub use session::{FrontendHandle, ShardFrontend, SUPPORTED_VERSIONS};
