//! Core types for issue nodes, trees, and view identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Current persisted tree format.
pub const FORMAT_VERSION: &str = "1.0";

/// Opaque node identifier. Generated once at node creation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Allocate a fresh identifier.
    pub fn generate() -> Self {
        NodeId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// A node identity as seen from a view.
///
/// `focus` is set when the node is displayed inside a scope rooted at some
/// ancestor. The tree itself only ever stores plain ids, so every view id has
/// to be reduced with [`ViewId::base`] before it reaches a store operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewId {
    #[serde(rename = "baseId")]
    base: NodeId,
    #[serde(
        rename = "focusRootId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    focus: Option<NodeId>,
}

impl ViewId {
    pub fn plain(base: NodeId) -> Self {
        ViewId { base, focus: None }
    }

    pub fn in_focus(base: NodeId, focus_root: NodeId) -> Self {
        ViewId {
            base,
            focus: Some(focus_root),
        }
    }

    /// The underlying tree identity.
    pub fn base(&self) -> &NodeId {
        &self.base
    }

    pub fn focus_root(&self) -> Option<&NodeId> {
        self.focus.as_ref()
    }

    /// True when this entry is the root of its own focus scope.
    pub fn is_focus_root(&self) -> bool {
        self.focus.as_ref() == Some(&self.base)
    }

    pub fn into_base(self) -> NodeId {
        self.base
    }
}

impl From<NodeId> for ViewId {
    fn from(id: NodeId) -> Self {
        ViewId::plain(id)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.focus {
            Some(root) => write!(f, "{} (in {})", self.base, root),
            None => write!(f, "{}", self.base),
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A placement of a document within the hierarchy.
///
/// Several nodes may point at the same `document_ref`; that is how a
/// document appears in more than one place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueNode {
    pub id: NodeId,
    pub document_ref: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub expanded: bool,
    #[serde(default)]
    pub children: Vec<IssueNode>,
}

impl IssueNode {
    /// A new leaf with a freshly generated id.
    pub fn new(document_ref: impl Into<String>) -> Self {
        IssueNode {
            id: NodeId::generate(),
            document_ref: document_ref.into(),
            expanded: false,
            children: Vec::new(),
        }
    }

    /// A leaf with a caller-supplied id.
    pub fn with_id(id: impl Into<NodeId>, document_ref: impl Into<String>) -> Self {
        IssueNode {
            id: id.into(),
            document_ref: document_ref.into(),
            expanded: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<IssueNode>) -> Self {
        self.children = children;
        self
    }

    /// Number of nodes in this subtree, including itself.
    pub fn subtree_len(&self) -> usize {
        1 + self.children.iter().map(|c| c.subtree_len()).sum::<usize>()
    }

    /// Every id in this subtree, pre-order.
    pub fn subtree_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.subtree_len());
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            ids.push(node.id.clone());
            stack.extend(node.children.iter().rev());
        }
        ids
    }
}

/// The persisted hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueTree {
    pub format_version: String,
    pub last_modified: String,
    #[serde(default)]
    pub root_nodes: Vec<IssueNode>,
}

impl IssueTree {
    pub fn empty() -> Self {
        IssueTree {
            format_version: FORMAT_VERSION.to_string(),
            last_modified: chrono::Utc::now().to_rfc3339(),
            root_nodes: Vec::new(),
        }
    }

    pub fn with_roots(root_nodes: Vec<IssueNode>) -> Self {
        IssueTree {
            root_nodes,
            ..Self::empty()
        }
    }

    pub fn node_count(&self) -> usize {
        self.root_nodes.iter().map(|n| n.subtree_len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.root_nodes.is_empty()
    }

    /// Pre-order iteration over every node.
    pub fn iter(&self) -> impl Iterator<Item = &IssueNode> {
        let mut stack: Vec<&IssueNode> = self.root_nodes.iter().rev().collect();
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    /// Structural equality, ignoring `last_modified`.
    pub fn same_structure(&self, other: &IssueTree) -> bool {
        self.format_version == other.format_version && self.root_nodes == other.root_nodes
    }
}

impl Default for IssueTree {
    fn default() -> Self {
        Self::empty()
    }
}

/// A document known to the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    #[serde(rename = "ref")]
    pub doc_ref: String,
    pub title: String,
}
