//! Path-addressed hierarchical store.
//!
//! The tree offers the snapshot / modification / validate / prepare /
//! commit primitives the commit pipeline is built on. Nodes are shared
//! structurally through `Arc`, so snapshots are O(1) and preparing a
//! candidate only rebuilds the spine touched by the modification.

pub mod candidate;
pub mod error;
pub mod modification;
pub mod node;
pub mod tree;

pub use candidate::{Candidate, CandidateNode, ModificationType};
pub use error::{CommitError, ValidationError};
pub use modification::{ModOp, Modification};
pub use node::{Node, Value};
pub use tree::{prepare, validate, Snapshot, Tree};
