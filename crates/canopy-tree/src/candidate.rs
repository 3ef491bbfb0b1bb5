//! Prepared candidates.
//!
//! A candidate is the immutable outcome of preparing a modification
//! against a tip: the resulting root plus a delta tree describing, per
//! path, how the tree changed. The delta tree is what cohort
//! registrations are matched against.

use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a node changed in a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModificationType {
    /// Untouched. Delta trees never contain these below the root; the
    /// root delta is `Unmodified` only for an empty modification.
    Unmodified,
    /// The node itself is unchanged but something below it changed.
    Subtree,
    /// The node (or its value) was written.
    Write,
    /// The node was removed.
    Delete,
}

/// One node of a candidate's delta tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateNode {
    pub kind: ModificationType,
    /// Data after the change; absent for deletes.
    pub data: Option<Arc<Node>>,
    /// Per-child deltas. Fully materialized, including below writes and
    /// deletes, so registration matching can descend uniformly.
    pub children: BTreeMap<String, CandidateNode>,
}

impl CandidateNode {
    pub fn unmodified() -> Self {
        Self {
            kind: ModificationType::Unmodified,
            data: None,
            children: BTreeMap::new(),
        }
    }

    pub fn is_unmodified(&self) -> bool {
        self.kind == ModificationType::Unmodified
    }
}

/// An immutable, validated delta produced from a modification prior to
/// commit. `root_before` is the tip the candidate was prepared against;
/// `root_after` is the tip it produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    root_before: Arc<Node>,
    root_after: Arc<Node>,
    delta: CandidateNode,
}

impl Candidate {
    pub(crate) fn new(root_before: Arc<Node>, root_after: Arc<Node>, delta: CandidateNode) -> Self {
        Self {
            root_before,
            root_after,
            delta,
        }
    }

    pub fn root_before(&self) -> &Arc<Node> {
        &self.root_before
    }

    pub fn root_after(&self) -> &Arc<Node> {
        &self.root_after
    }

    pub fn delta(&self) -> &CandidateNode {
        &self.delta
    }
}

/// Compute the delta between two roots. Shared `Arc`s short-circuit as
/// unmodified without descending.
pub(crate) fn diff(before: Option<&Arc<Node>>, after: Option<&Arc<Node>>) -> Option<CandidateNode> {
    match (before, after) {
        (None, None) => None,
        (None, Some(node)) => Some(whole_subtree(node, ModificationType::Write)),
        (Some(node), None) => Some(whole_subtree(node, ModificationType::Delete)),
        (Some(b), Some(a)) => {
            if Arc::ptr_eq(b, a) {
                return None;
            }

            let children = diff_children(b, a);
            if b.value != a.value {
                return Some(CandidateNode {
                    kind: ModificationType::Write,
                    data: Some(a.clone()),
                    children,
                });
            }
            if children.is_empty() {
                return None;
            }
            Some(CandidateNode {
                kind: ModificationType::Subtree,
                data: Some(a.clone()),
                children,
            })
        }
    }
}

fn diff_children(before: &Arc<Node>, after: &Arc<Node>) -> BTreeMap<String, CandidateNode> {
    let mut children = BTreeMap::new();
    for (name, child) in &after.children {
        if let Some(delta) = diff(before.children.get(name), Some(child)) {
            children.insert(name.clone(), delta);
        }
    }
    for (name, child) in &before.children {
        if !after.children.contains_key(name) {
            if let Some(delta) = diff(Some(child), None) {
                children.insert(name.clone(), delta);
            }
        }
    }
    children
}

fn whole_subtree(node: &Arc<Node>, kind: ModificationType) -> CandidateNode {
    let children = node
        .children
        .iter()
        .map(|(name, child)| (name.clone(), whole_subtree(child, kind)))
        .collect();
    CandidateNode {
        kind,
        data: match kind {
            ModificationType::Delete => None,
            _ => Some(node.clone()),
        },
        children,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Value;

    #[test]
    fn test_diff_shared_root_is_unmodified() {
        let root = Arc::new(Node::container([("a".to_string(), Node::empty())]));
        assert!(diff(Some(&root), Some(&root)).is_none());
    }

    #[test]
    fn test_diff_new_subtree_is_write() {
        let before = Arc::new(Node::empty());
        let after = Arc::new(Node::container([(
            "a".to_string(),
            Node::container([("b".to_string(), Node::leaf(Value::from(1)))]),
        )]));

        let delta = diff(Some(&before), Some(&after)).unwrap();
        assert_eq!(delta.kind, ModificationType::Subtree);
        let a = &delta.children["a"];
        assert_eq!(a.kind, ModificationType::Write);
        assert_eq!(a.children["b"].kind, ModificationType::Write);
    }

    #[test]
    fn test_diff_removal_is_delete_with_children() {
        let before = Arc::new(Node::container([(
            "a".to_string(),
            Node::container([("b".to_string(), Node::leaf(Value::from(1)))]),
        )]));
        let after = Arc::new(Node::empty());

        let delta = diff(Some(&before), Some(&after)).unwrap();
        let a = &delta.children["a"];
        assert_eq!(a.kind, ModificationType::Delete);
        assert!(a.data.is_none());
        assert_eq!(a.children["b"].kind, ModificationType::Delete);
    }

    #[test]
    fn test_diff_untouched_sibling_is_absent() {
        let keep = Arc::new(Node::leaf(Value::from("keep")));
        let before = Arc::new(Node {
            value: None,
            children: [
                ("keep".to_string(), keep.clone()),
                ("drop".to_string(), Arc::new(Node::leaf(Value::from(0)))),
            ]
            .into_iter()
            .collect(),
        });
        let after = Arc::new(Node {
            value: None,
            children: [("keep".to_string(), keep)].into_iter().collect(),
        });

        let delta = diff(Some(&before), Some(&after)).unwrap();
        assert!(!delta.children.contains_key("keep"));
        assert_eq!(delta.children["drop"].kind, ModificationType::Delete);
    }
}
