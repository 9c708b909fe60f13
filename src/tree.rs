//! Traversal, lookup, and structural mutation over an issue tree.
//!
//! Every function here works on base node ids. View-scoped identities are
//! reduced by the caller before anything in this module is touched.

use crate::types::{IssueNode, IssueTree, NodeId, ViewId};
use std::collections::HashSet;
use thiserror::Error;

/// One step of a pre-order walk.
#[derive(Debug, Clone)]
pub struct Visit<'a> {
    pub node: &'a IssueNode,
    /// Root first, excluding `node` itself.
    pub ancestors: Vec<&'a IssueNode>,
    pub depth: usize,
}

impl Visit<'_> {
    pub fn parent(&self) -> Option<&IssueNode> {
        self.ancestors.last().copied()
    }
}

/// Where `insert_under` actually put the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Root,
    UnderParent,
    /// The requested parent was missing; nodes went to the root instead.
    RootFallback,
}

/// Why a relocation (move or attach) cannot be performed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelationError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("target parent {0} not found")]
    TargetNotFound(NodeId),
    #[error("cannot place {node} under {target}: target is self or descendant")]
    Cycle { node: NodeId, target: NodeId },
}

/// Pre-order walk returning each node with its ancestor chain.
pub fn walk(tree: &IssueTree) -> Vec<Visit<'_>> {
    fn visit<'a>(nodes: &'a [IssueNode], path: &mut Vec<&'a IssueNode>, out: &mut Vec<Visit<'a>>) {
        for node in nodes {
            out.push(Visit {
                node,
                ancestors: path.clone(),
                depth: path.len(),
            });
            path.push(node);
            visit(&node.children, path, out);
            path.pop();
        }
    }

    let mut out = Vec::with_capacity(tree.node_count());
    visit(&tree.root_nodes, &mut Vec::new(), &mut out);
    out
}

pub fn find_by_id<'a>(tree: &'a IssueTree, id: &NodeId) -> Option<&'a IssueNode> {
    tree.iter().find(|n| &n.id == id)
}

pub fn find_by_id_mut<'a>(nodes: &'a mut [IssueNode], id: &NodeId) -> Option<&'a mut IssueNode> {
    for node in nodes.iter_mut() {
        if &node.id == id {
            return Some(node);
        }
        if let Some(found) = find_by_id_mut(&mut node.children, id) {
            return Some(found);
        }
    }
    None
}

/// Find a node and return the sibling vector that owns it plus its index,
/// so the caller can splice it out directly.
pub fn locate_mut<'a>(
    siblings: &'a mut Vec<IssueNode>,
    id: &NodeId,
) -> Option<(&'a mut Vec<IssueNode>, usize)> {
    if let Some(index) = siblings.iter().position(|n| &n.id == id) {
        return Some((siblings, index));
    }
    for node in siblings.iter_mut() {
        if let Some(found) = locate_mut(&mut node.children, id) {
            return Some(found);
        }
    }
    None
}

/// Ancestor chain of `id`, root first. `None` when the id is absent.
pub fn ancestors_of<'a>(tree: &'a IssueTree, id: &NodeId) -> Option<Vec<&'a IssueNode>> {
    fn search<'a>(nodes: &'a [IssueNode], id: &NodeId, path: &mut Vec<&'a IssueNode>) -> bool {
        for node in nodes {
            if &node.id == id {
                return true;
            }
            path.push(node);
            if search(&node.children, id, path) {
                return true;
            }
            path.pop();
        }
        false
    }

    let mut path = Vec::new();
    search(&tree.root_nodes, id, &mut path).then_some(path)
}

/// Direct parent of `id`; `None` for roots and for unknown ids.
pub fn parent_of<'a>(tree: &'a IssueTree, id: &NodeId) -> Option<&'a IssueNode> {
    ancestors_of(tree, id)?.last().copied()
}

/// True iff `node_id` lives somewhere below `candidate`.
/// A node is never its own ancestor.
pub fn is_ancestor(tree: &IssueTree, candidate: &NodeId, node_id: &NodeId) -> bool {
    fn contains(nodes: &[IssueNode], id: &NodeId) -> bool {
        nodes
            .iter()
            .any(|n| &n.id == id || contains(&n.children, id))
    }

    find_by_id(tree, candidate).is_some_and(|node| contains(&node.children, node_id))
}

/// Human-readable location: the document refs from the root down to `id`.
pub fn breadcrumb(tree: &IssueTree, id: &NodeId) -> Option<String> {
    let node = find_by_id(tree, id)?;
    let ancestors = ancestors_of(tree, id)?;
    let mut parts: Vec<&str> = ancestors.iter().map(|a| a.document_ref.as_str()).collect();
    parts.push(&node.document_ref);
    Some(parts.join(" / "))
}

/// Verify that `node` may be placed under `target` without creating a cycle.
///
/// Must pass before every move or attach.
pub fn check_relocation(
    tree: &IssueTree,
    node: &NodeId,
    target: Option<&NodeId>,
) -> Result<(), RelationError> {
    if find_by_id(tree, node).is_none() {
        return Err(RelationError::NodeNotFound(node.clone()));
    }
    let Some(target) = target else {
        return Ok(());
    };
    if target == node || is_ancestor(tree, node, target) {
        return Err(RelationError::Cycle {
            node: node.clone(),
            target: target.clone(),
        });
    }
    if find_by_id(tree, target).is_none() {
        return Err(RelationError::TargetNotFound(target.clone()));
    }
    Ok(())
}

/// Detach a node and its whole subtree. The subtree is returned untouched.
pub fn remove(tree: &mut IssueTree, id: &NodeId) -> Option<IssueNode> {
    let (siblings, index) = locate_mut(&mut tree.root_nodes, id)?;
    Some(siblings.remove(index))
}

/// Insert `nodes` at the front of `parent`'s children (or of the roots),
/// keeping their relative order. An unknown parent falls back to the root.
pub fn insert_under(
    tree: &mut IssueTree,
    parent: Option<&NodeId>,
    nodes: Vec<IssueNode>,
) -> Placement {
    let Some(parent_id) = parent else {
        tree.root_nodes.splice(0..0, nodes);
        return Placement::Root;
    };

    match find_by_id_mut(&mut tree.root_nodes, parent_id) {
        Some(parent) => {
            parent.children.splice(0..0, nodes);
            Placement::UnderParent
        }
        None => {
            tracing::warn!(parent = %parent_id, "parent not found, inserting at root");
            tree.root_nodes.splice(0..0, nodes);
            Placement::RootFallback
        }
    }
}

/// Relocate a subtree. The same instance is reinserted, so every descendant
/// keeps its id. Run [`check_relocation`] first.
pub fn move_node(tree: &mut IssueTree, id: &NodeId, target: Option<&NodeId>) -> Option<Placement> {
    let node = remove(tree, id)?;
    Some(insert_under(tree, target, vec![node]))
}

/// Copy a node with fresh identities.
///
/// A shallow clone has no children. A deep clone mirrors the subtree shape
/// with a new id on every node and the same document refs.
pub fn clone_with_new_identities(node: &IssueNode, include_descendants: bool) -> IssueNode {
    let children = if include_descendants {
        node.children
            .iter()
            .map(|c| clone_with_new_identities(c, true))
            .collect()
    } else {
        Vec::new()
    };
    IssueNode {
        id: NodeId::generate(),
        document_ref: node.document_ref.clone(),
        expanded: node.expanded && include_descendants,
        children,
    }
}

/// Clone `source` and insert the clone under `target`. Run
/// [`check_relocation`] first. Returns the new node's id.
pub fn attach(
    tree: &mut IssueTree,
    source: &NodeId,
    target: Option<&NodeId>,
    include_descendants: bool,
) -> Option<(NodeId, Placement)> {
    let clone = clone_with_new_identities(find_by_id(tree, source)?, include_descendants);
    let id = clone.id.clone();
    let placement = insert_under(tree, target, vec![clone]);
    Some((id, placement))
}

/// Create a fresh leaf node for `document_ref`.
pub fn create_node(
    tree: &mut IssueTree,
    parent: Option<&NodeId>,
    document_ref: &str,
) -> (NodeId, Placement) {
    let node = IssueNode::new(document_ref);
    let id = node.id.clone();
    let placement = insert_under(tree, parent, vec![node]);
    (id, placement)
}

pub fn set_expanded(tree: &mut IssueTree, id: &NodeId, expanded: bool) -> bool {
    match find_by_id_mut(&mut tree.root_nodes, id) {
        Some(node) => {
            node.expanded = expanded;
            true
        }
        None => false,
    }
}

/// Flip the display flag; returns the new value.
pub fn toggle_expanded(tree: &mut IssueTree, id: &NodeId) -> Option<bool> {
    let node = find_by_id_mut(&mut tree.root_nodes, id)?;
    node.expanded = !node.expanded;
    Some(node.expanded)
}

/// An entry of a focus-scoped view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusEntry {
    pub view: ViewId,
    pub document_ref: String,
    /// Depth relative to the focus root (the root itself is 0).
    pub depth: usize,
}

/// The sub-hierarchy rooted at `focus_root`, tagged with that scope.
pub fn focus_view(tree: &IssueTree, focus_root: &NodeId) -> Option<Vec<FocusEntry>> {
    fn visit(node: &IssueNode, root: &NodeId, depth: usize, out: &mut Vec<FocusEntry>) {
        out.push(FocusEntry {
            view: ViewId::in_focus(node.id.clone(), root.clone()),
            document_ref: node.document_ref.clone(),
            depth,
        });
        for child in &node.children {
            visit(child, root, depth + 1, out);
        }
    }

    let root = find_by_id(tree, focus_root)?;
    let mut out = Vec::with_capacity(root.subtree_len());
    visit(root, focus_root, 0, &mut out);
    Some(out)
}

/// Ids that occur more than once, each reported once, in walk order.
pub fn repeated_ids(tree: &IssueTree) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut repeated = Vec::new();
    for node in tree.iter() {
        if !seen.insert(&node.id) && reported.insert(&node.id) {
            repeated.push(node.id.clone());
        }
    }
    repeated
}

pub fn all_ids_unique(tree: &IssueTree) -> bool {
    repeated_ids(tree).is_empty()
}

/// Give every later occurrence of a repeated id a fresh identity.
/// Returns how many nodes were renamed.
pub fn reidentify_repeats(tree: &mut IssueTree) -> usize {
    fn visit(nodes: &mut [IssueNode], seen: &mut HashSet<NodeId>) -> usize {
        let mut renamed = 0;
        for node in nodes {
            if !seen.insert(node.id.clone()) {
                node.id = NodeId::generate();
                seen.insert(node.id.clone());
                renamed += 1;
            }
            renamed += visit(&mut node.children, seen);
        }
        renamed
    }

    visit(&mut tree.root_nodes, &mut HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn leaf(i: &str) -> IssueNode {
        IssueNode::with_id(i, format!("{i}.md"))
    }

    /// a -> b -> c, a -> e, d
    fn sample() -> IssueTree {
        IssueTree::with_roots(vec![
            leaf("a").with_children(vec![
                leaf("b").with_children(vec![leaf("c")]),
                leaf("e"),
            ]),
            leaf("d"),
        ])
    }

    fn root_ids(tree: &IssueTree) -> Vec<&str> {
        tree.root_nodes.iter().map(|n| n.id.as_str()).collect()
    }

    // --- lookup ---

    #[test]
    fn test_walk_reports_depth_and_ancestors() {
        let tree = sample();
        let visits = walk(&tree);
        let c = visits.iter().find(|v| v.node.id == id("c")).unwrap();
        assert_eq!(c.depth, 2);
        let chain: Vec<&str> = c.ancestors.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(chain, vec!["a", "b"]);
        assert_eq!(c.parent().unwrap().id, id("b"));
        assert_eq!(visits.len(), 5);
    }

    #[test]
    fn test_walk_does_not_mutate() {
        let tree = sample();
        let before = tree.clone();
        let _ = walk(&tree);
        assert_eq!(tree, before);
    }

    #[test]
    fn test_locate_mut_returns_owning_siblings() {
        let mut tree = sample();
        let (siblings, index) = locate_mut(&mut tree.root_nodes, &id("e")).unwrap();
        assert_eq!(index, 1);
        assert_eq!(siblings[0].id, id("b"));

        assert!(locate_mut(&mut tree.root_nodes, &id("zz")).is_none());
    }

    #[test]
    fn test_ancestors_of() {
        let tree = sample();
        let chain = ancestors_of(&tree, &id("c")).unwrap();
        let chain: Vec<&str> = chain.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(chain, vec!["a", "b"]);

        assert!(ancestors_of(&tree, &id("a")).unwrap().is_empty());
        assert!(ancestors_of(&tree, &id("missing")).is_none());
    }

    #[test]
    fn test_parent_of() {
        let tree = sample();
        assert_eq!(parent_of(&tree, &id("c")).unwrap().id, id("b"));
        assert!(parent_of(&tree, &id("a")).is_none());
    }

    #[test]
    fn test_is_ancestor_deep_and_self() {
        let tree = sample();
        assert!(is_ancestor(&tree, &id("a"), &id("c")));
        assert!(is_ancestor(&tree, &id("a"), &id("b")));
        assert!(!is_ancestor(&tree, &id("c"), &id("a")));
        assert!(!is_ancestor(&tree, &id("a"), &id("a")));
        assert!(!is_ancestor(&tree, &id("a"), &id("d")));
        assert!(!is_ancestor(&tree, &id("missing"), &id("a")));
    }

    #[test]
    fn test_breadcrumb() {
        let tree = sample();
        assert_eq!(
            breadcrumb(&tree, &id("c")).unwrap(),
            "a.md / b.md / c.md"
        );
    }

    // --- relocation checks ---

    #[test]
    fn test_check_relocation_rejects_cycles() {
        let tree = sample();
        let err = check_relocation(&tree, &id("a"), Some(&id("c"))).unwrap_err();
        assert!(matches!(err, RelationError::Cycle { .. }));
        assert!(err.to_string().contains("self or descendant"));

        let err = check_relocation(&tree, &id("a"), Some(&id("a"))).unwrap_err();
        assert!(matches!(err, RelationError::Cycle { .. }));
    }

    #[test]
    fn test_check_relocation_missing_ids() {
        let tree = sample();
        assert_eq!(
            check_relocation(&tree, &id("x"), None),
            Err(RelationError::NodeNotFound(id("x")))
        );
        assert_eq!(
            check_relocation(&tree, &id("c"), Some(&id("x"))),
            Err(RelationError::TargetNotFound(id("x")))
        );
        assert!(check_relocation(&tree, &id("c"), Some(&id("d"))).is_ok());
        assert!(check_relocation(&tree, &id("c"), None).is_ok());
    }

    // --- mutation ---

    #[test]
    fn test_remove_detaches_subtree_intact() {
        let mut tree = sample();
        let removed = remove(&mut tree, &id("b")).unwrap();
        assert_eq!(removed.children[0].id, id("c"));
        assert!(find_by_id(&tree, &id("b")).is_none());
        assert!(find_by_id(&tree, &id("c")).is_none());
        assert!(remove(&mut tree, &id("b")).is_none());
    }

    #[test]
    fn test_insert_under_front_preserves_batch_order() {
        let mut tree = sample();
        let placement = insert_under(&mut tree, Some(&id("a")), vec![leaf("x"), leaf("y")]);
        assert_eq!(placement, Placement::UnderParent);
        let a = find_by_id(&tree, &id("a")).unwrap();
        let kids: Vec<&str> = a.children.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(kids, vec!["x", "y", "b", "e"]);
    }

    #[test]
    fn test_insert_under_missing_parent_falls_back_to_root() {
        let mut tree = sample();
        let placement = insert_under(&mut tree, Some(&id("nope")), vec![leaf("x")]);
        assert_eq!(placement, Placement::RootFallback);
        assert_eq!(root_ids(&tree), vec!["x", "a", "d"]);
    }

    #[test]
    fn test_move_to_root_unshifts() {
        // a -> b -> c; moving c to the root puts it first.
        let mut tree = IssueTree::with_roots(vec![
            leaf("a").with_children(vec![leaf("b").with_children(vec![leaf("c")])]),
        ]);
        check_relocation(&tree, &id("c"), None).unwrap();
        move_node(&mut tree, &id("c"), None).unwrap();

        assert_eq!(root_ids(&tree), vec!["c", "a"]);
        let a = find_by_id(&tree, &id("a")).unwrap();
        assert_eq!(a.children.len(), 1);
        assert_eq!(a.children[0].id, id("b"));
        assert!(a.children[0].children.is_empty());
    }

    #[test]
    fn test_move_preserves_subtree() {
        let mut tree = sample();
        let before = find_by_id(&tree, &id("b")).unwrap().children.clone();
        move_node(&mut tree, &id("b"), Some(&id("d"))).unwrap();
        let after = find_by_id(&tree, &id("b")).unwrap();
        assert_eq!(after.children, before);
        assert_eq!(parent_of(&tree, &id("b")).unwrap().id, id("d"));
        assert!(all_ids_unique(&tree));
    }

    #[test]
    fn test_clone_shallow_has_no_children() {
        let tree = sample();
        let a = find_by_id(&tree, &id("a")).unwrap();
        let clone = clone_with_new_identities(a, false);
        assert!(clone.children.is_empty());
        assert_ne!(clone.id, a.id);
        assert_eq!(clone.document_ref, a.document_ref);
    }

    #[test]
    fn test_clone_deep_mirrors_shape_with_fresh_ids() {
        let tree = sample();
        let a = find_by_id(&tree, &id("a")).unwrap();
        let clone = clone_with_new_identities(a, true);

        fn shape(n: &IssueNode) -> Vec<(usize, String)> {
            let mut out = vec![(n.children.len(), n.document_ref.clone())];
            for c in &n.children {
                out.extend(shape(c));
            }
            out
        }
        assert_eq!(shape(&clone), shape(a));

        let original: HashSet<NodeId> = a.subtree_ids().into_iter().collect();
        for cloned in clone.subtree_ids() {
            assert!(!original.contains(&cloned));
        }
    }

    #[test]
    fn test_attach_shallow_adds_second_reference() {
        let mut tree = sample();
        let (new_id, placement) = attach(&mut tree, &id("a"), None, false).unwrap();
        assert_eq!(placement, Placement::Root);
        assert_eq!(tree.root_nodes[0].id, new_id);
        assert_eq!(tree.root_nodes[0].document_ref, "a.md");
        assert!(tree.root_nodes[0].children.is_empty());
        // Original untouched.
        assert_eq!(find_by_id(&tree, &id("a")).unwrap().children.len(), 2);
        assert!(all_ids_unique(&tree));
    }

    #[test]
    fn test_create_node_and_toggle() {
        let mut tree = sample();
        let (new_id, placement) = create_node(&mut tree, Some(&id("d")), "new.md");
        assert_eq!(placement, Placement::UnderParent);
        let d = find_by_id(&tree, &id("d")).unwrap();
        assert_eq!(d.children[0].id, new_id);

        assert_eq!(toggle_expanded(&mut tree, &id("d")), Some(true));
        assert_eq!(toggle_expanded(&mut tree, &id("d")), Some(false));
        assert!(toggle_expanded(&mut tree, &id("missing")).is_none());
        assert!(set_expanded(&mut tree, &id("a"), true));
        assert!(find_by_id(&tree, &id("a")).unwrap().expanded);
    }

    #[test]
    fn test_focus_view_tags_scope() {
        let tree = sample();
        let view = focus_view(&tree, &id("a")).unwrap();
        assert_eq!(view.len(), 4);
        assert!(view[0].view.is_focus_root());
        assert_eq!(view[0].depth, 0);
        let c = view.iter().find(|e| e.view.base() == &id("c")).unwrap();
        assert_eq!(c.depth, 2);
        assert!(!c.view.is_focus_root());
        assert_eq!(c.view.focus_root(), Some(&id("a")));

        assert!(focus_view(&tree, &id("missing")).is_none());
    }

    #[test]
    fn test_repeated_ids_and_reidentify() {
        let mut tree = IssueTree::with_roots(vec![
            leaf("a").with_children(vec![leaf("b")]),
            leaf("b"),
            leaf("b"),
        ]);
        assert_eq!(repeated_ids(&tree), vec![id("b")]);
        assert!(!all_ids_unique(&tree));

        assert_eq!(reidentify_repeats(&mut tree), 2);
        assert!(all_ids_unique(&tree));
        // First occurrence keeps its identity.
        assert_eq!(tree.root_nodes[0].children[0].id, id("b"));
    }
}
