//! Cohort registration trie.
//!
//! Registrations map tree paths to cohort handles. The trie is
//! persistent: the single writer rebuilds the path being touched and
//! shares everything else, so a snapshot is just an `Arc` clone that
//! stays stable while registrations keep changing underneath.

use crate::protocol::CohortHandle;
use canopy_common::TreePath;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// One node of the registration trie.
#[derive(Debug, Default)]
pub(crate) struct RegistryNode {
    pub(crate) children: HashMap<String, Arc<RegistryNode>>,
    pub(crate) registrations: Vec<CohortHandle>,
}

impl RegistryNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.registrations.is_empty()
    }
}

/// Writer side of the registration trie.
#[derive(Debug)]
pub struct CohortRegistry {
    root: Arc<RegistryNode>,
    count: usize,
}

impl CohortRegistry {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RegistryNode::default()),
            count: 0,
        }
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Register `handle` at `path`. The handle's id identifies the
    /// registration for later removal.
    pub fn register(&mut self, path: &TreePath, handle: CohortHandle) -> Uuid {
        let id = handle.id();
        self.root = Self::with_registration(&self.root, path.segments(), handle);
        self.count += 1;
        tracing::debug!("registry: registered cohort {} at {}", id, path);
        id
    }

    /// Remove the registration `id` at `path`. Returns whether anything
    /// was removed.
    pub fn unregister(&mut self, path: &TreePath, id: Uuid) -> bool {
        let (root, removed) = Self::without_registration(&self.root, path.segments(), id);
        if removed {
            self.root = root.unwrap_or_default();
            self.count -= 1;
            tracing::debug!("registry: removed cohort {} at {}", id, path);
        }
        removed
    }

    /// A stable point-in-time view for iteration.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            root: self.root.clone(),
        }
    }

    fn with_registration(
        node: &Arc<RegistryNode>,
        segments: &[String],
        handle: CohortHandle,
    ) -> Arc<RegistryNode> {
        let mut updated = RegistryNode {
            children: node.children.clone(),
            registrations: node.registrations.clone(),
        };
        match segments.split_first() {
            None => updated.registrations.push(handle),
            Some((segment, rest)) => {
                let child = node
                    .children
                    .get(segment)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(RegistryNode::default()));
                updated
                    .children
                    .insert(segment.clone(), Self::with_registration(&child, rest, handle));
            }
        }
        Arc::new(updated)
    }

    /// Returns the rebuilt node (`None` when it became empty and can be
    /// pruned) and whether the registration was found.
    fn without_registration(
        node: &Arc<RegistryNode>,
        segments: &[String],
        id: Uuid,
    ) -> (Option<Arc<RegistryNode>>, bool) {
        let mut updated = RegistryNode {
            children: node.children.clone(),
            registrations: node.registrations.clone(),
        };

        let removed = match segments.split_first() {
            None => {
                let before = updated.registrations.len();
                updated.registrations.retain(|handle| handle.id() != id);
                updated.registrations.len() != before
            }
            Some((segment, rest)) => match node.children.get(segment) {
                None => false,
                Some(child) => {
                    let (rebuilt, removed) = Self::without_registration(child, rest, id);
                    if removed {
                        match rebuilt {
                            Some(child) => {
                                updated.children.insert(segment.clone(), child);
                            }
                            None => {
                                updated.children.remove(segment);
                            }
                        }
                    }
                    removed
                }
            },
        };

        if !removed {
            return (None, false);
        }
        if updated.is_empty() {
            (None, true)
        } else {
            (Some(Arc::new(updated)), true)
        }
    }
}

impl Default for CohortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader side: a frozen view of the trie.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub(crate) root: Arc<RegistryNode>,
}

impl RegistrySnapshot {
    /// Whether the snapshot holds no registrations at all.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}
