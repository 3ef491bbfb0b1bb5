//! The cohort round-trip protocol.
//!
//! A cohort is an external participant subscribed to part of the tree.
//! The coordinator talks to it over a plain message channel; each
//! round-trip is answered on a oneshot and bounded by its own timeout.

use canopy_common::{TransactionId, TreePath};
use canopy_tree::CandidateNode;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// One affected subtree delivered to a cohort during canCommit.
#[derive(Debug, Clone)]
pub struct AffectedSubtree {
    /// Registration-relative location of the subtree.
    pub path: TreePath,
    /// The candidate's delta for that subtree.
    pub delta: CandidateNode,
}

/// A cohort's answer to a phase request.
pub type PhaseReply = std::result::Result<(), String>;

/// Requests delivered to a cohort.
#[derive(Debug)]
pub enum CohortRequest {
    CanCommit {
        tx: TransactionId,
        subtrees: Vec<AffectedSubtree>,
        reply: oneshot::Sender<PhaseReply>,
    },
    PreCommit {
        tx: TransactionId,
        reply: oneshot::Sender<PhaseReply>,
    },
    Commit {
        tx: TransactionId,
        reply: oneshot::Sender<PhaseReply>,
    },
    Abort {
        tx: TransactionId,
        reply: oneshot::Sender<PhaseReply>,
    },
}

/// Failure of a single cohort round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CohortError {
    #[error("cohort {cohort} rejected {phase}: {reason}")]
    Refused {
        cohort: String,
        phase: &'static str,
        reason: String,
    },

    #[error("cohort {cohort} did not answer {phase} in time")]
    Timeout { cohort: String, phase: &'static str },

    #[error("cohort {cohort} is unreachable")]
    Unreachable { cohort: String },
}

/// Handle through which the coordinator reaches one registered cohort.
#[derive(Debug, Clone)]
pub struct CohortHandle {
    id: Uuid,
    name: String,
    sender: mpsc::UnboundedSender<CohortRequest>,
}

impl CohortHandle {
    /// Create a handle plus the receiving end the cohort drains.
    pub fn new(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<CohortRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::now_v7(),
                name: name.into(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn can_commit(
        &self,
        tx: TransactionId,
        subtrees: Vec<AffectedSubtree>,
        timeout: Duration,
    ) -> Result<(), CohortError> {
        let (reply, rx) = oneshot::channel();
        self.round_trip(
            CohortRequest::CanCommit {
                tx,
                subtrees,
                reply,
            },
            rx,
            timeout,
            "canCommit",
        )
        .await
    }

    pub async fn pre_commit(
        &self,
        tx: TransactionId,
        timeout: Duration,
    ) -> Result<(), CohortError> {
        let (reply, rx) = oneshot::channel();
        self.round_trip(CohortRequest::PreCommit { tx, reply }, rx, timeout, "preCommit")
            .await
    }

    pub async fn commit(&self, tx: TransactionId, timeout: Duration) -> Result<(), CohortError> {
        let (reply, rx) = oneshot::channel();
        self.round_trip(CohortRequest::Commit { tx, reply }, rx, timeout, "commit")
            .await
    }

    pub async fn abort(&self, tx: TransactionId, timeout: Duration) -> Result<(), CohortError> {
        let (reply, rx) = oneshot::channel();
        self.round_trip(CohortRequest::Abort { tx, reply }, rx, timeout, "abort")
            .await
    }

    async fn round_trip(
        &self,
        request: CohortRequest,
        rx: oneshot::Receiver<PhaseReply>,
        timeout: Duration,
        phase: &'static str,
    ) -> Result<(), CohortError> {
        self.sender
            .send(request)
            .map_err(|_| CohortError::Unreachable {
                cohort: self.name.clone(),
            })?;

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => Err(CohortError::Timeout {
                cohort: self.name.clone(),
                phase,
            }),
            Ok(Err(_)) => Err(CohortError::Unreachable {
                cohort: self.name.clone(),
            }),
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(CohortError::Refused {
                cohort: self.name.clone(),
                phase,
                reason,
            }),
        }
    }
}
