//! Duplicate-reference and orphan-document analysis.
//!
//! Both views are derived from a single traversal and never persisted.

use crate::types::{DocumentInfo, IssueTree, NodeId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// All nodes that reference the same document, when there are two or more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub document_ref: String,
    pub node_ids: Vec<NodeId>,
}

impl DuplicateGroup {
    pub fn count(&self) -> usize {
        self.node_ids.len()
    }
}

/// Map from document ref to the ids referencing it, in walk order.
pub fn reference_map(tree: &IssueTree) -> BTreeMap<&str, Vec<NodeId>> {
    let mut refs: BTreeMap<&str, Vec<NodeId>> = BTreeMap::new();
    for node in tree.iter() {
        refs.entry(node.document_ref.as_str())
            .or_default()
            .push(node.id.clone());
    }
    refs
}

/// Duplicate groups, largest first, ties broken by document ref.
pub fn duplicate_groups(tree: &IssueTree) -> Vec<DuplicateGroup> {
    let mut groups: Vec<DuplicateGroup> = reference_map(tree)
        .into_iter()
        .filter(|(_, ids)| ids.len() >= 2)
        .map(|(document_ref, node_ids)| DuplicateGroup {
            document_ref: document_ref.to_string(),
            node_ids,
        })
        .collect();
    groups.sort_by(|a, b| {
        b.count()
            .cmp(&a.count())
            .then_with(|| a.document_ref.cmp(&b.document_ref))
    });
    groups
}

/// Known documents that no node references.
pub fn orphan_documents(tree: &IssueTree, documents: &[DocumentInfo]) -> Vec<DocumentInfo> {
    let referenced: HashSet<&str> = tree.iter().map(|n| n.document_ref.as_str()).collect();
    documents
        .iter()
        .filter(|d| !referenced.contains(d.doc_ref.as_str()))
        .cloned()
        .collect()
}

/// Nodes whose document is not among the known documents.
pub fn dangling_references(tree: &IssueTree, documents: &[DocumentInfo]) -> Vec<(NodeId, String)> {
    let known: HashSet<&str> = documents.iter().map(|d| d.doc_ref.as_str()).collect();
    tree.iter()
        .filter(|n| !known.contains(n.document_ref.as_str()))
        .map(|n| (n.id.clone(), n.document_ref.clone()))
        .collect()
}
