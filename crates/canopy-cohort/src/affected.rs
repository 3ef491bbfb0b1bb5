//! Affected-cohort computation.
//!
//! Joint recursive descent of a candidate's delta tree and the
//! registration trie. Unmodified subtrees are never entered, wildcard
//! registration children match any sibling, and results are aggregated
//! per cohort so each one receives at most one canCommit message per
//! transaction.

use crate::protocol::{AffectedSubtree, CohortHandle};
use crate::registry::{RegistryNode, RegistrySnapshot};
use canopy_common::{TreePath, WILDCARD_SEGMENT};
use canopy_tree::{Candidate, CandidateNode};
use std::collections::HashMap;
use uuid::Uuid;

/// All subtrees of one transaction's candidate that concern one cohort.
#[derive(Debug, Clone)]
pub struct CanCommitMessage {
    pub handle: CohortHandle,
    pub subtrees: Vec<AffectedSubtree>,
}

/// Compute, for each registered cohort affected by `candidate`, the
/// single canCommit message it should receive.
pub fn affected_cohorts(snapshot: &RegistrySnapshot, candidate: &Candidate) -> Vec<CanCommitMessage> {
    let mut collector = Collector::default();
    descend(
        &snapshot.root,
        candidate.delta(),
        &TreePath::root(),
        &mut collector,
    );
    collector.messages
}

#[derive(Default)]
struct Collector {
    messages: Vec<CanCommitMessage>,
    by_cohort: HashMap<Uuid, usize>,
}

impl Collector {
    fn emit(&mut self, handle: &CohortHandle, path: &TreePath, delta: &CandidateNode) {
        let subtree = AffectedSubtree {
            path: path.clone(),
            delta: delta.clone(),
        };
        match self.by_cohort.get(&handle.id()) {
            Some(&index) => self.messages[index].subtrees.push(subtree),
            None => {
                self.by_cohort.insert(handle.id(), self.messages.len());
                self.messages.push(CanCommitMessage {
                    handle: handle.clone(),
                    subtrees: vec![subtree],
                });
            }
        }
    }
}

fn descend(
    registry: &RegistryNode,
    delta: &CandidateNode,
    path: &TreePath,
    collector: &mut Collector,
) {
    if delta.is_unmodified() {
        return;
    }

    for handle in &registry.registrations {
        collector.emit(handle, path, delta);
    }

    for (segment, child_delta) in &delta.children {
        let child_path = path.child(segment.clone());
        if let Some(child_registry) = registry.children.get(segment) {
            descend(child_registry, child_delta, &child_path, collector);
        }
        if let Some(wildcard) = registry.children.get(WILDCARD_SEGMENT) {
            descend(wildcard, child_delta, &child_path, collector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CohortRegistry;
    use canopy_tree::{prepare, Modification, Node, Tree, Value};

    fn candidate_for(ops: impl FnOnce(&mut Modification)) -> Candidate {
        let tree = Tree::new();
        let mut modification = Modification::new();
        ops(&mut modification);
        prepare(tree.root(), &modification).unwrap()
    }

    fn registry_with(paths: &[&str]) -> (CohortRegistry, Vec<CohortHandle>) {
        let mut registry = CohortRegistry::new();
        let mut handles = Vec::new();
        for path in paths {
            let (handle, _rx) = CohortHandle::new(*path);
            registry.register(&TreePath::parse(path), handle.clone());
            handles.push(handle);
        }
        (registry, handles)
    }

    #[test]
    fn test_unrelated_path_is_not_notified() {
        let (registry, _) = registry_with(&["/cars"]);
        let candidate = candidate_for(|m| {
            m.merge(TreePath::parse("/people/person-1"), Node::leaf(Value::from(1)));
        });

        let messages = affected_cohorts(&registry.snapshot(), &candidate);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_descendant_modification_notifies_ancestor_registration() {
        let (registry, handles) = registry_with(&["/cars"]);
        let candidate = candidate_for(|m| {
            m.merge(TreePath::parse("/cars/car-1"), Node::leaf(Value::from("vw")));
        });

        let messages = affected_cohorts(&registry.snapshot(), &candidate);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].handle.id(), handles[0].id());
        assert_eq!(messages[0].subtrees.len(), 1);
        assert_eq!(messages[0].subtrees[0].path, TreePath::parse("/cars"));
    }

    #[test]
    fn test_single_message_for_disjoint_subtrees() {
        let (registry, _) = registry_with(&["/cars", "/people"]);
        let mut registry = registry;
        // Same cohort registered at both paths.
        let (shared, _rx) = CohortHandle::new("shared");
        registry.register(&TreePath::parse("/cars"), shared.clone());
        registry.register(&TreePath::parse("/people"), shared.clone());

        let candidate = candidate_for(|m| {
            m.merge(TreePath::parse("/cars/car-1"), Node::leaf(Value::from(1)));
            m.merge(TreePath::parse("/people/person-1"), Node::leaf(Value::from(2)));
        });

        let messages = affected_cohorts(&registry.snapshot(), &candidate);
        let shared_message = messages
            .iter()
            .find(|message| message.handle.id() == shared.id())
            .unwrap();
        assert_eq!(shared_message.subtrees.len(), 2);
    }

    #[test]
    fn test_wildcard_matches_any_sibling() {
        let (registry, handles) = registry_with(&["/cars/*/owner"]);
        let candidate = candidate_for(|m| {
            m.merge(
                TreePath::parse("/cars/car-7/owner"),
                Node::leaf(Value::from("alice")),
            );
        });

        let messages = affected_cohorts(&registry.snapshot(), &candidate);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].handle.id(), handles[0].id());
        assert_eq!(
            messages[0].subtrees[0].path,
            TreePath::parse("/cars/car-7/owner")
        );
    }

    #[test]
    fn test_delete_of_registered_subtree_is_delivered() {
        let mut tree = Tree::new();
        let mut setup = Modification::new();
        setup.merge(TreePath::parse("/cars/car-1"), Node::leaf(Value::from(1)));
        tree.commit(&prepare(tree.root(), &setup).unwrap()).unwrap();

        let (registry, _) = registry_with(&["/cars/car-1"]);
        let mut modification = Modification::new();
        modification.delete(TreePath::parse("/cars/car-1"));
        let candidate = prepare(tree.root(), &modification).unwrap();

        let messages = affected_cohorts(&registry.snapshot(), &candidate);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].subtrees[0].delta.kind,
            canopy_tree::ModificationType::Delete
        );
    }

    #[test]
    fn test_registration_below_write_is_reached() {
        let (registry, _) = registry_with(&["/cars/car-1/owner"]);
        // A wholesale write at /cars materializes delta children deep
        // enough to reach the registration.
        let candidate = candidate_for(|m| {
            m.merge(
                TreePath::parse("/cars/car-1/owner"),
                Node::leaf(Value::from("alice")),
            );
        });

        let messages = affected_cohorts(&registry.snapshot(), &candidate);
        assert_eq!(messages.len(), 1);
    }
}
