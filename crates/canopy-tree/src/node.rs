//! Tree nodes.

use canopy_common::TreePath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Scalar payload carried by a node.
pub type Value = serde_json::Value;

/// A node in the hierarchical store: an optional scalar value plus named
/// children. Children are `Arc`-shared so unmodified subtrees are reused
/// across versions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub value: Option<Value>,
    pub children: BTreeMap<String, Arc<Node>>,
}

impl Node {
    /// An empty container node.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A leaf carrying a value.
    pub fn leaf(value: Value) -> Self {
        Self {
            value: Some(value),
            children: BTreeMap::new(),
        }
    }

    /// A container with the given children.
    pub fn container(children: impl IntoIterator<Item = (String, Node)>) -> Self {
        Self {
            value: None,
            children: children
                .into_iter()
                .map(|(name, child)| (name, Arc::new(child)))
                .collect(),
        }
    }

    /// Find the node at `path` relative to this node.
    pub fn find(&self, path: &TreePath) -> Option<&Node> {
        let mut current = self;
        for segment in path.segments() {
            current = current.children.get(segment)?;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_walks_segments() {
        let root = Arc::new(Node::container([(
            "cars".to_string(),
            Node::container([("car-1".to_string(), Node::leaf(Value::from("vw")))]),
        )]));

        let found = root.find(&TreePath::parse("/cars/car-1")).unwrap();
        assert_eq!(found.value, Some(Value::from("vw")));
        assert!(root.find(&TreePath::parse("/cars/car-2")).is_none());
        assert!(root.find(&TreePath::root()).is_some());
    }
}
