//! Tree engine errors.

use canopy_common::TreePath;
use thiserror::Error;

/// Optimistic validation failure: the modification no longer applies to
/// the tip it is being validated against, typically because a pipelined
/// predecessor changed the structure it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("conflicting modification at {path}: parent node does not exist")]
    MissingParent { path: TreePath },

    #[error("conflicting modification at {path}: node does not exist")]
    NoSuchNode { path: TreePath },
}

/// Local commit failure after consensus. This is a hard error: the
/// candidate was replicated but cannot be applied to the local tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
    #[error("candidate does not apply to the current tree root")]
    BaseMismatch,
}
