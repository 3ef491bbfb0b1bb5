//! Client-built modifications.

use crate::node::Node;
use canopy_common::TreePath;
use serde::{Deserialize, Serialize};

/// A single operation within a modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModOp {
    /// Replace the node at `path` with `node`. The parent must exist at
    /// validation time.
    Write { path: TreePath, node: Node },
    /// Merge `node` into the node at `path`, creating missing interior
    /// nodes. Values in `node` win over existing values.
    Merge { path: TreePath, node: Node },
    /// Remove the node at `path`. The node must exist at validation time.
    Delete { path: TreePath },
}

impl ModOp {
    pub fn path(&self) -> &TreePath {
        match self {
            ModOp::Write { path, .. } | ModOp::Merge { path, .. } | ModOp::Delete { path } => path,
        }
    }
}

/// An ordered list of operations recorded against a snapshot. Ordering
/// matters: later operations see the effect of earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    ops: Vec<ModOp>,
}

impl Modification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, path: TreePath, node: Node) {
        self.ops.push(ModOp::Write { path, node });
    }

    pub fn merge(&mut self, path: TreePath, node: Node) {
        self.ops.push(ModOp::Merge { path, node });
    }

    pub fn delete(&mut self, path: TreePath) {
        self.ops.push(ModOp::Delete { path });
    }

    pub fn push(&mut self, op: ModOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, ops: impl IntoIterator<Item = ModOp>) {
        self.ops.extend(ops);
    }

    pub fn ops(&self) -> &[ModOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
