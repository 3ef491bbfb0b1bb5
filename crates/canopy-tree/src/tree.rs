//! The tree engine proper: snapshots, validation, preparation, commit.

use crate::candidate::{diff, Candidate, CandidateNode};
use crate::error::{CommitError, ValidationError};
use crate::modification::{ModOp, Modification};
use crate::node::Node;
use canopy_common::TreePath;
use std::sync::Arc;

/// The committed state of one shard's tree.
#[derive(Debug)]
pub struct Tree {
    root: Arc<Node>,
}

impl Tree {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::empty()),
        }
    }

    /// Current committed root.
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Point-in-time snapshot for reads. O(1).
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            root: self.root.clone(),
        }
    }

    /// Apply a prepared candidate. The candidate's base must be the
    /// current root; a mismatch means the caller lost track of commit
    /// ordering and must not be papered over.
    pub fn commit(&mut self, candidate: &Candidate) -> Result<(), CommitError> {
        if !Arc::ptr_eq(&self.root, candidate.root_before())
            && self.root != *candidate.root_before()
        {
            return Err(CommitError::BaseMismatch);
        }
        self.root = candidate.root_after().clone();
        Ok(())
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// A stable read-only view of the tree at some point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    root: Arc<Node>,
}

impl Snapshot {
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Read the node at `path`, sharing its subtree.
    pub fn read(&self, path: &TreePath) -> Option<Arc<Node>> {
        match path.segments().split_last() {
            None => Some(self.root.clone()),
            Some((last, parents)) => {
                let mut current: &Node = &self.root;
                for segment in parents {
                    current = current.children.get(segment)?;
                }
                current.children.get(last).cloned()
            }
        }
    }

    pub fn exists(&self, path: &TreePath) -> bool {
        self.root.find(path).is_some()
    }
}

/// Check that `modification` still applies on top of `base`.
pub fn validate(base: &Arc<Node>, modification: &Modification) -> Result<(), ValidationError> {
    apply_all(base, modification).map(|_| ())
}

/// Validate and apply `modification` on top of `base`, producing an
/// immutable candidate.
pub fn prepare(base: &Arc<Node>, modification: &Modification) -> Result<Candidate, ValidationError> {
    let root_after = apply_all(base, modification)?;
    let delta = diff(Some(base), Some(&root_after)).unwrap_or_else(CandidateNode::unmodified);
    Ok(Candidate::new(base.clone(), root_after, delta))
}

fn apply_all(base: &Arc<Node>, modification: &Modification) -> Result<Arc<Node>, ValidationError> {
    let mut root = base.clone();
    for op in modification.ops() {
        root = apply_op(&root, op)?;
    }
    Ok(root)
}

fn apply_op(root: &Arc<Node>, op: &ModOp) -> Result<Arc<Node>, ValidationError> {
    match op {
        ModOp::Write { path, node } => write_at(root, path.segments(), path, node),
        ModOp::Merge { path, node } => Ok(merge_at(root, path.segments(), node)),
        ModOp::Delete { path } => delete_at(root, path.segments(), path),
    }
}

fn write_at(
    base: &Arc<Node>,
    segments: &[String],
    path: &TreePath,
    node: &Node,
) -> Result<Arc<Node>, ValidationError> {
    let Some((segment, rest)) = segments.split_first() else {
        return Ok(Arc::new(node.clone()));
    };

    let mut updated = (**base).clone();
    if rest.is_empty() {
        updated.children.insert(segment.clone(), Arc::new(node.clone()));
    } else {
        let child = base
            .children
            .get(segment)
            .ok_or_else(|| ValidationError::MissingParent { path: path.clone() })?;
        updated
            .children
            .insert(segment.clone(), write_at(child, rest, path, node)?);
    }
    Ok(Arc::new(updated))
}

fn delete_at(
    base: &Arc<Node>,
    segments: &[String],
    path: &TreePath,
) -> Result<Arc<Node>, ValidationError> {
    let Some((segment, rest)) = segments.split_first() else {
        // Deleting the root clears the tree.
        return Ok(Arc::new(Node::empty()));
    };

    let child = base
        .children
        .get(segment)
        .ok_or_else(|| ValidationError::NoSuchNode { path: path.clone() })?;

    let mut updated = (**base).clone();
    if rest.is_empty() {
        updated.children.remove(segment);
    } else {
        updated
            .children
            .insert(segment.clone(), delete_at(child, rest, path)?);
    }
    Ok(Arc::new(updated))
}

fn merge_at(base: &Arc<Node>, segments: &[String], node: &Node) -> Arc<Node> {
    let Some((segment, rest)) = segments.split_first() else {
        return merge_nodes(base, node);
    };

    let child = base
        .children
        .get(segment)
        .cloned()
        .unwrap_or_else(|| Arc::new(Node::empty()));
    let mut updated = (**base).clone();
    updated
        .children
        .insert(segment.clone(), merge_at(&child, rest, node));
    Arc::new(updated)
}

fn merge_nodes(base: &Arc<Node>, incoming: &Node) -> Arc<Node> {
    let mut merged = (**base).clone();
    if incoming.value.is_some() {
        merged.value = incoming.value.clone();
    }
    for (name, child) in &incoming.children {
        let merged_child = match merged.children.get(name) {
            Some(existing) => merge_nodes(existing, child),
            None => child.clone(),
        };
        merged.children.insert(name.clone(), merged_child);
    }
    Arc::new(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Value;
    use crate::ModificationType;

    fn write(path: &str, value: Value) -> Modification {
        let mut modification = Modification::new();
        modification.write(TreePath::parse(path), Node::leaf(value));
        modification
    }

    #[test]
    fn test_write_then_read() {
        let mut tree = Tree::new();

        let mut modification = Modification::new();
        modification.write(TreePath::parse("/cars"), Node::empty());
        modification.write(TreePath::parse("/cars/car-1"), Node::leaf(Value::from("vw")));

        let candidate = prepare(tree.root(), &modification).unwrap();
        tree.commit(&candidate).unwrap();

        let snapshot = tree.snapshot();
        assert_eq!(
            snapshot.read(&TreePath::parse("/cars/car-1")).unwrap().value,
            Some(Value::from("vw"))
        );
    }

    #[test]
    fn test_write_requires_parent() {
        let tree = Tree::new();
        let modification = write("/cars/car-1", Value::from("vw"));
        assert!(matches!(
            validate(tree.root(), &modification),
            Err(ValidationError::MissingParent { .. })
        ));
    }

    #[test]
    fn test_delete_requires_presence() {
        let tree = Tree::new();
        let mut modification = Modification::new();
        modification.delete(TreePath::parse("/cars"));
        assert!(matches!(
            validate(tree.root(), &modification),
            Err(ValidationError::NoSuchNode { .. })
        ));
    }

    #[test]
    fn test_merge_creates_interior_nodes() {
        let mut tree = Tree::new();
        let mut modification = Modification::new();
        modification.merge(
            TreePath::parse("/people/person-1"),
            Node::leaf(Value::from("alice")),
        );
        let candidate = prepare(tree.root(), &modification).unwrap();
        tree.commit(&candidate).unwrap();

        assert!(tree.snapshot().exists(&TreePath::parse("/people/person-1")));
    }

    #[test]
    fn test_merge_preserves_siblings() {
        let mut tree = Tree::new();
        let mut setup = Modification::new();
        setup.merge(TreePath::parse("/cars/car-1"), Node::leaf(Value::from("vw")));
        tree.commit(&prepare(tree.root(), &setup).unwrap()).unwrap();

        let mut modification = Modification::new();
        modification.merge(TreePath::parse("/cars/car-2"), Node::leaf(Value::from("bmw")));
        tree.commit(&prepare(tree.root(), &modification).unwrap())
            .unwrap();

        let snapshot = tree.snapshot();
        assert!(snapshot.exists(&TreePath::parse("/cars/car-1")));
        assert!(snapshot.exists(&TreePath::parse("/cars/car-2")));
    }

    #[test]
    fn test_ops_apply_in_order() {
        let tree = Tree::new();
        let mut modification = Modification::new();
        modification.merge(TreePath::parse("/cars"), Node::empty());
        modification.write(TreePath::parse("/cars/car-1"), Node::leaf(Value::from(1)));
        modification.delete(TreePath::parse("/cars/car-1"));

        let candidate = prepare(tree.root(), &modification).unwrap();
        assert!(candidate.root_after().find(&TreePath::parse("/cars")).is_some());
        assert!(candidate
            .root_after()
            .find(&TreePath::parse("/cars/car-1"))
            .is_none());
    }

    #[test]
    fn test_commit_rejects_stale_candidate() {
        let mut tree = Tree::new();
        let stale = prepare(tree.root(), &{
            let mut m = Modification::new();
            m.merge(TreePath::parse("/a"), Node::leaf(Value::from(1)));
            m
        })
        .unwrap();

        // Another candidate commits first and changes the root.
        let other = prepare(tree.root(), &{
            let mut m = Modification::new();
            m.merge(TreePath::parse("/b"), Node::leaf(Value::from(2)));
            m
        })
        .unwrap();
        tree.commit(&other).unwrap();

        assert_eq!(tree.commit(&stale), Err(CommitError::BaseMismatch));
    }

    #[test]
    fn test_pipelined_candidates_commit_in_sequence() {
        let mut tree = Tree::new();
        let first = prepare(tree.root(), &{
            let mut m = Modification::new();
            m.merge(TreePath::parse("/a"), Node::leaf(Value::from(1)));
            m
        })
        .unwrap();
        // Second candidate prepared speculatively on top of the first.
        let second = prepare(first.root_after(), &{
            let mut m = Modification::new();
            m.merge(TreePath::parse("/b"), Node::leaf(Value::from(2)));
            m
        })
        .unwrap();

        tree.commit(&first).unwrap();
        tree.commit(&second).unwrap();
        assert!(tree.snapshot().exists(&TreePath::parse("/a")));
        assert!(tree.snapshot().exists(&TreePath::parse("/b")));
    }

    #[test]
    fn test_prepare_produces_delta() {
        let tree = Tree::new();
        let mut modification = Modification::new();
        modification.merge(TreePath::parse("/cars/car-1"), Node::leaf(Value::from("vw")));
        let candidate = prepare(tree.root(), &modification).unwrap();

        let delta = candidate.delta();
        assert_eq!(delta.kind, ModificationType::Subtree);
        assert!(delta.children.contains_key("cars"));
    }
}
