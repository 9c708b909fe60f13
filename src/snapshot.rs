//! Size-bounded projection of the tree for an external planner.
//!
//! The reduction is deterministic: the same tree, titles, and instruction
//! always produce the same snapshot.

use crate::analysis::duplicate_groups;
use crate::storage::stem_title;
use crate::tree::{Visit, walk};
use crate::types::{DocumentInfo, IssueTree, NodeId};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

pub const MAX_KEYWORDS: usize = 10;
/// Ancestor levels included above each matched node.
pub const ANCESTOR_LEVELS: usize = 4;
/// Direct children included below each matched node, and the preview length.
pub const CHILD_PREVIEW: usize = 8;
pub const FALLBACK_MAX_DEPTH: usize = 1;
pub const FALLBACK_NODE_CAP: usize = 120;
pub const MAX_SNAPSHOT_NODES: usize = 220;
pub const TOP_DUPLICATE_GROUPS: usize = 10;
pub const DEFAULT_BYTE_BUDGET: usize = 48_000;

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)"|“([^”]+)”|`([^`]+)`"#).unwrap());
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9_\-]*").unwrap());
static SCRIPT_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\x00-\x7F\s\p{P}\p{S}]{2,}").unwrap());

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "from", "in", "into", "is", "it", "of", "on",
    "or", "the", "to", "under", "with",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    pub id: NodeId,
    pub document_ref: String,
    pub display_title: String,
    pub parent_id: Option<NodeId>,
    pub depth: usize,
    /// Preview of direct children; dropped first when the snapshot is too large.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children_ids: Option<Vec<NodeId>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub total_nodes: usize,
    pub included_nodes: usize,
    pub keywords: Vec<String>,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateSummary {
    pub document_ref: String,
    pub count: usize,
    pub node_ids: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub nodes: Vec<SnapshotNode>,
    pub duplicates_by_document: Vec<DuplicateSummary>,
}

impl Snapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// Document ref to title lookup used for display titles.
pub fn title_map(documents: &[DocumentInfo]) -> HashMap<String, String> {
    documents
        .iter()
        .map(|d| (d.doc_ref.clone(), d.title.clone()))
        .collect()
}

/// Candidate keywords: quoted phrases, then alphanumeric tokens, then runs of
/// non-ASCII script. Lowercased, deduplicated, longest first, at most ten.
pub fn extract_keywords(instruction: &str) -> Vec<String> {
    let mut candidates: Vec<String> = Vec::new();

    for caps in QUOTED.captures_iter(instruction) {
        if let Some(m) = caps.iter().skip(1).flatten().next() {
            candidates.push(m.as_str().trim().to_string());
        }
    }
    for m in TOKEN.find_iter(instruction) {
        candidates.push(m.as_str().to_string());
    }
    for m in SCRIPT_RUN.find_iter(instruction) {
        candidates.push(m.as_str().to_string());
    }

    let mut seen = HashSet::new();
    let mut keywords: Vec<String> = candidates
        .into_iter()
        .map(|k| k.to_lowercase())
        .filter(|k| k.chars().count() >= 2 && !STOPWORDS.contains(&k.as_str()))
        .filter(|k| seen.insert(k.clone()))
        .collect();

    // Stable, so equal lengths keep extraction order.
    keywords.sort_by_key(|k| std::cmp::Reverse(k.chars().count()));
    keywords.truncate(MAX_KEYWORDS);
    keywords
}

fn display_title(doc_ref: &str, titles: &HashMap<String, String>) -> String {
    titles
        .get(doc_ref)
        .cloned()
        .unwrap_or_else(|| stem_title(doc_ref))
}

fn matches_any(visit: &Visit<'_>, title: &str, keywords: &[String]) -> bool {
    let title = title.to_lowercase();
    let doc_ref = visit.node.document_ref.to_lowercase();
    keywords
        .iter()
        .any(|k| title.contains(k.as_str()) || doc_ref.contains(k.as_str()))
}

/// Build the planner snapshot for `instruction`.
pub fn build_snapshot(
    tree: &IssueTree,
    instruction: &str,
    titles: &HashMap<String, String>,
    byte_budget: usize,
) -> Snapshot {
    let visits = walk(tree);
    let keywords = extract_keywords(instruction);

    let mut index_of: HashMap<&NodeId, usize> = HashMap::with_capacity(visits.len());
    for (i, v) in visits.iter().enumerate() {
        index_of.entry(&v.node.id).or_insert(i);
    }

    let node_titles: Vec<String> = visits
        .iter()
        .map(|v| display_title(&v.node.document_ref, titles))
        .collect();

    let matched: Vec<usize> = if keywords.is_empty() {
        Vec::new()
    } else {
        (0..visits.len())
            .filter(|&i| matches_any(&visits[i], &node_titles[i], &keywords))
            .collect()
    };

    let mut notes = Vec::new();
    let mut selected: Vec<usize> = if matched.is_empty() {
        notes.push(format!(
            "no keyword matched; showing top-level structure (depth <= {})",
            FALLBACK_MAX_DEPTH
        ));
        visits
            .iter()
            .enumerate()
            .filter(|(_, v)| v.depth <= FALLBACK_MAX_DEPTH)
            .map(|(i, _)| i)
            .take(FALLBACK_NODE_CAP)
            .collect()
    } else {
        notes.push(format!(
            "{} node(s) matched {} keyword(s); including up to {} ancestor levels and {} children each",
            matched.len(),
            keywords.len(),
            ANCESTOR_LEVELS,
            CHILD_PREVIEW
        ));
        let mut include: HashSet<usize> = HashSet::new();
        for &m in &matched {
            include.insert(m);
            let visit = &visits[m];
            for ancestor in visit.ancestors.iter().rev().take(ANCESTOR_LEVELS) {
                if let Some(&i) = index_of.get(&ancestor.id) {
                    include.insert(i);
                }
            }
            for child in visit.node.children.iter().take(CHILD_PREVIEW) {
                if let Some(&i) = index_of.get(&child.id) {
                    include.insert(i);
                }
            }
        }
        let mut selected: Vec<usize> = include.into_iter().collect();
        selected.sort_unstable();
        selected
    };

    if selected.len() > MAX_SNAPSHOT_NODES {
        notes.push(format!(
            "truncated from {} to {} nodes",
            selected.len(),
            MAX_SNAPSHOT_NODES
        ));
        selected.truncate(MAX_SNAPSHOT_NODES);
    }

    let nodes: Vec<SnapshotNode> = selected
        .iter()
        .map(|&i| {
            let visit = &visits[i];
            SnapshotNode {
                id: visit.node.id.clone(),
                document_ref: visit.node.document_ref.clone(),
                display_title: node_titles[i].clone(),
                parent_id: visit.parent().map(|p| p.id.clone()),
                depth: visit.depth,
                children_ids: Some(
                    visit
                        .node
                        .children
                        .iter()
                        .take(CHILD_PREVIEW)
                        .map(|c| c.id.clone())
                        .collect(),
                ),
            }
        })
        .collect();

    let included: HashSet<&NodeId> = nodes.iter().map(|n| &n.id).collect();
    let duplicates_by_document: Vec<DuplicateSummary> = duplicate_groups(tree)
        .into_iter()
        .enumerate()
        .filter(|(rank, g)| {
            *rank < TOP_DUPLICATE_GROUPS || g.node_ids.iter().any(|id| included.contains(id))
        })
        .map(|(_, g)| DuplicateSummary {
            count: g.count(),
            document_ref: g.document_ref,
            node_ids: g.node_ids,
        })
        .collect();

    let mut snapshot = Snapshot {
        meta: SnapshotMeta {
            total_nodes: visits.len(),
            included_nodes: nodes.len(),
            keywords,
            note: notes.join("; "),
        },
        nodes,
        duplicates_by_document,
    };

    if snapshot.serialized_len() > byte_budget {
        for node in &mut snapshot.nodes {
            node.children_ids = None;
        }
        snapshot
            .meta
            .note
            .push_str("; children previews dropped to fit the size budget");
        tracing::debug!(
            bytes = snapshot.serialized_len(),
            budget = byte_budget,
            "snapshot over budget, dropped children previews"
        );
    }

    snapshot
}
