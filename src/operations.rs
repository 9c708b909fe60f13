//! Proposed structural edits: parsing, validation, and batch application.
//!
//! Each operation in a batch is validated against the tree as it stands when
//! that operation is reached. Operations are never reordered and never depend
//! on each other, so a batch that touches the same node twice gives
//! order-dependent results.

use crate::tree::{self, RelationError};
use crate::types::{IssueTree, NodeId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// An absent or `null` flag reads as false.
fn null_as_false<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// A planner-suggested edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProposedOperation {
    Move {
        source_id: NodeId,
        #[serde(default)]
        target_parent_id: Option<NodeId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Attach {
        source_id: NodeId,
        #[serde(default)]
        target_parent_id: Option<NodeId>,
        #[serde(default, deserialize_with = "null_as_false")]
        include_descendants: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Disassociate {
        node_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Move,
    Attach,
    Disassociate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Move => write!(f, "move"),
            OperationKind::Attach => write!(f, "attach"),
            OperationKind::Disassociate => write!(f, "disassociate"),
        }
    }
}

fn target_label(target: &Option<NodeId>) -> String {
    target
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "root".to_string())
}

impl ProposedOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            ProposedOperation::Move { .. } => OperationKind::Move,
            ProposedOperation::Attach { .. } => OperationKind::Attach,
            ProposedOperation::Disassociate { .. } => OperationKind::Disassociate,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ProposedOperation::Move { reason, .. }
            | ProposedOperation::Attach { reason, .. }
            | ProposedOperation::Disassociate { reason, .. } => reason.as_deref(),
        }
    }

    /// The node the operation acts on.
    pub fn subject(&self) -> &NodeId {
        match self {
            ProposedOperation::Move { source_id, .. }
            | ProposedOperation::Attach { source_id, .. } => source_id,
            ProposedOperation::Disassociate { node_id, .. } => node_id,
        }
    }

    /// Blank target ids mean the root.
    fn normalized(mut self) -> Option<Self> {
        match &mut self {
            ProposedOperation::Move {
                target_parent_id, ..
            }
            | ProposedOperation::Attach {
                target_parent_id, ..
            } => {
                if target_parent_id.as_ref().is_some_and(|t| t.is_empty()) {
                    *target_parent_id = None;
                }
            }
            ProposedOperation::Disassociate { .. } => {}
        }
        (!self.subject().is_empty()).then_some(self)
    }
}

impl fmt::Display for ProposedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposedOperation::Move {
                source_id,
                target_parent_id,
                ..
            } => write!(f, "move {} -> {}", source_id, target_label(target_parent_id)),
            ProposedOperation::Attach {
                source_id,
                target_parent_id,
                include_descendants,
                ..
            } => write!(
                f,
                "attach {} -> {}{}",
                source_id,
                target_label(target_parent_id),
                if *include_descendants { " (deep)" } else { "" }
            ),
            ProposedOperation::Disassociate { node_id, .. } => write!(f, "disassociate {}", node_id),
        }
    }
}

/// Parse a planner response. Accepts `{"operations": [...]}` or a bare array.
/// Entries that do not deserialize, or that name an empty id, are dropped.
pub fn parse_operations(value: &Value) -> Vec<ProposedOperation> {
    let entries = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("operations") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => {
                tracing::debug!("response has no operations array");
                return Vec::new();
            }
        },
        _ => return Vec::new(),
    };

    entries
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            match serde_json::from_value::<ProposedOperation>(entry.clone()) {
                Ok(op) => {
                    let op = op.normalized();
                    if op.is_none() {
                        tracing::debug!(index = i, "dropping operation with empty id");
                    }
                    op
                }
                Err(e) => {
                    tracing::debug!(index = i, error = %e, "dropping malformed operation");
                    None
                }
            }
        })
        .collect()
}

/// Parse JSON text; anything unparseable yields no operations.
pub fn parse_operations_str(text: &str) -> Vec<ProposedOperation> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => parse_operations(&value),
        Err(e) => {
            tracing::debug!(error = %e, "operations payload is not JSON");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum OperationStatus {
    Applied,
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub index: usize,
    pub kind: OperationKind,
    pub description: String,
    #[serde(flatten)]
    pub status: OperationStatus,
    /// Node created by an applied attach.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_id: Option<NodeId>,
}

/// Result of applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub warnings: Vec<String>,
    pub outcomes: Vec<OperationOutcome>,
}

impl ApplyReport {
    /// The batch was empty; informational, not a failure.
    pub fn nothing_to_apply(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn changed(&self) -> bool {
        self.applied > 0
    }

    /// Ids touched by applied operations, including created clones.
    pub fn touched_ids(&self, operations: &[ProposedOperation]) -> Vec<NodeId> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OperationStatus::Applied)
            .flat_map(|o| {
                let mut ids = Vec::with_capacity(2);
                if let Some(op) = operations.get(o.index) {
                    ids.push(op.subject().clone());
                }
                ids.extend(o.created_id.clone());
                ids
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        if self.nothing_to_apply() {
            return "nothing to apply".to_string();
        }
        format!("{} applied, {} skipped", self.applied, self.skipped)
    }
}

/// Apply one operation. Returns the id of a created clone, if any.
fn apply_one(tree: &mut IssueTree, op: &ProposedOperation) -> Result<Option<NodeId>, RelationError> {
    match op {
        ProposedOperation::Move {
            source_id,
            target_parent_id,
            ..
        } => {
            tree::check_relocation(tree, source_id, target_parent_id.as_ref())?;
            tree::move_node(tree, source_id, target_parent_id.as_ref())
                .ok_or_else(|| RelationError::NodeNotFound(source_id.clone()))?;
            Ok(None)
        }
        ProposedOperation::Attach {
            source_id,
            target_parent_id,
            include_descendants,
            ..
        } => {
            tree::check_relocation(tree, source_id, target_parent_id.as_ref())?;
            let (id, _) = tree::attach(
                tree,
                source_id,
                target_parent_id.as_ref(),
                *include_descendants,
            )
            .ok_or_else(|| RelationError::NodeNotFound(source_id.clone()))?;
            Ok(Some(id))
        }
        ProposedOperation::Disassociate { node_id, .. } => {
            tree::remove(tree, node_id).ok_or_else(|| RelationError::NodeNotFound(node_id.clone()))?;
            Ok(None)
        }
    }
}

/// Apply `operations` in order. Every operation ends applied or skipped with
/// a warning; structural problems never abort the batch.
pub fn apply_operations(tree: &mut IssueTree, operations: &[ProposedOperation]) -> ApplyReport {
    let mut report = ApplyReport::default();

    for (index, op) in operations.iter().enumerate() {
        let description = op.to_string();
        let (status, created_id) = match apply_one(tree, op) {
            Ok(created) => {
                report.applied += 1;
                tracing::debug!(index, op = %description, "operation applied");
                (OperationStatus::Applied, created)
            }
            Err(e) => {
                report.skipped += 1;
                let warning = format!("#{} {}: {}", index + 1, description, e);
                tracing::warn!("skipped {}", warning);
                report.warnings.push(warning);
                (OperationStatus::Skipped(e.to_string()), None)
            }
        };
        report.outcomes.push(OperationOutcome {
            index,
            kind: op.kind(),
            description,
            status,
            created_id,
        });
    }

    report
}

/// Validate a batch against a copy of the tree.
pub fn dry_run(tree: &IssueTree, operations: &[ProposedOperation]) -> ApplyReport {
    let mut scratch = tree.clone();
    apply_operations(&mut scratch, operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::duplicate_groups;
    use crate::tree::find_by_id;
    use crate::types::IssueNode;
    use serde_json::json;

    fn mv(source: &str, target: Option<&str>) -> ProposedOperation {
        ProposedOperation::Move {
            source_id: source.into(),
            target_parent_id: target.map(NodeId::from),
            reason: None,
        }
    }

    fn attach(source: &str, target: Option<&str>, deep: bool) -> ProposedOperation {
        ProposedOperation::Attach {
            source_id: source.into(),
            target_parent_id: target.map(NodeId::from),
            include_descendants: deep,
            reason: None,
        }
    }

    fn detach(id: &str) -> ProposedOperation {
        ProposedOperation::Disassociate {
            node_id: id.into(),
            reason: None,
        }
    }

    fn root_ids(tree: &IssueTree) -> Vec<&str> {
        tree.root_nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn chain() -> IssueTree {
        IssueTree::with_roots(vec![IssueNode::with_id("A", "a.md").with_children(vec![
            IssueNode::with_id("B", "b.md").with_children(vec![IssueNode::with_id("C", "c.md")]),
        ])])
    }

    // --- parsing ---

    #[test]
    fn test_parse_wrapped_and_bare() {
        let wrapped = json!({"operations": [
            {"type": "move", "sourceId": "a", "targetParentId": "b", "reason": "belongs there"},
            {"type": "attach", "sourceId": "a", "targetParentId": null, "includeDescendants": true},
            {"type": "disassociate", "nodeId": "c"}
        ]});
        let ops = parse_operations(&wrapped);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].reason(), Some("belongs there"));
        assert_eq!(ops[1], attach("a", None, true));
        assert_eq!(ops[2], detach("c"));

        let bare = json!([{"type": "move", "sourceId": "a"}]);
        assert_eq!(parse_operations(&bare), vec![mv("a", None)]);
    }

    #[test]
    fn test_parse_drops_malformed_entries() {
        let value = json!({"operations": [
            {"type": "move", "sourceId": "a", "targetParentId": "b"},
            {"type": "teleport", "sourceId": "a"},
            {"type": "move"},
            {"type": "disassociate", "nodeId": ""},
            "not an object",
            {"type": "attach", "sourceId": "x", "targetParentId": ""}
        ]});
        let ops = parse_operations(&value);
        assert_eq!(ops, vec![mv("a", Some("b")), attach("x", None, false)]);
    }

    #[test]
    fn test_parse_attach_with_null_flags() {
        let value = json!({"operations": [
            {"type": "attach", "sourceId": "a", "targetParentId": null, "includeDescendants": null},
            {"type": "attach", "sourceId": "b", "targetParentId": "c", "reason": null}
        ]});
        let ops = parse_operations(&value);
        assert_eq!(ops, vec![attach("a", None, false), attach("b", Some("c"), false)]);
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(parse_operations_str("not json").is_empty());
        assert!(parse_operations_str(r#"{"ops": []}"#).is_empty());
        assert!(parse_operations_str("42").is_empty());
    }

    #[test]
    fn test_operation_serializes_with_tag() {
        let value = serde_json::to_value(mv("a", Some("b"))).unwrap();
        assert_eq!(value["type"], "move");
        assert_eq!(value["sourceId"], "a");
        assert_eq!(value["targetParentId"], "b");
        assert!(value.get("reason").is_none());
    }

    // --- applying ---

    #[test]
    fn test_move_under_descendant_is_rejected() {
        let mut tree = IssueTree::with_roots(vec![
            IssueNode::with_id("A", "a.md").with_children(vec![IssueNode::with_id("B", "b.md")]),
        ]);
        let before = tree.clone();

        let report = apply_operations(&mut tree, &[mv("A", Some("B"))]);
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("self or descendant"));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_move_to_self_is_rejected() {
        let mut tree = chain();
        let report = apply_operations(&mut tree, &[mv("B", Some("B"))]);
        assert_eq!(report.skipped, 1);
        assert!(report.warnings[0].contains("self or descendant"));
    }

    #[test]
    fn test_move_to_root_goes_to_front() {
        let mut tree = chain();
        let report = apply_operations(&mut tree, &[mv("C", None)]);
        assert_eq!(report.applied, 1);
        assert_eq!(root_ids(&tree), vec!["C", "A"]);
        assert!(find_by_id(&tree, &"B".into()).unwrap().children.is_empty());
    }

    #[test]
    fn test_attach_shallow_to_root() {
        let mut tree = chain();
        let report = apply_operations(&mut tree, &[attach("A", None, false)]);
        assert_eq!(report.applied, 1);
        let created = report.outcomes[0].created_id.clone().unwrap();

        assert_eq!(tree.root_nodes.len(), 2);
        let clone = &tree.root_nodes[0];
        assert_eq!(clone.id, created);
        assert_ne!(clone.id.as_str(), "A");
        assert_eq!(clone.document_ref, "a.md");
        assert!(clone.children.is_empty());

        let groups = duplicate_groups(&tree);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].document_ref, "a.md");
    }

    #[test]
    fn test_attach_under_own_descendant_is_rejected() {
        let mut tree = chain();
        let report = apply_operations(&mut tree, &[attach("A", Some("C"), true)]);
        assert_eq!(report.skipped, 1);
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn test_disassociate_missing_is_skipped() {
        let mut tree = chain();
        let report = apply_operations(&mut tree, &[detach("nope")]);
        assert_eq!(report.skipped, 1);
        assert!(report.warnings[0].contains("not found"));
    }

    #[test]
    fn test_missing_target_parent_is_skipped() {
        let mut tree = chain();
        let before = tree.clone();
        let report = apply_operations(&mut tree, &[mv("C", Some("ghost"))]);
        assert_eq!(report.skipped, 1);
        assert!(report.warnings[0].contains("ghost"));
        assert_eq!(tree, before);
    }

    #[test]
    fn test_batch_counts_valid_and_invalid() {
        let mut tree = IssueTree::with_roots(vec![
            IssueNode::with_id("A", "a.md").with_children(vec![IssueNode::with_id("B", "b.md")]),
            IssueNode::with_id("X", "x.md"),
            IssueNode::with_id("Y", "x.md"),
        ]);
        let ops = vec![
            mv("A", Some("B")),      // cycle
            mv("X", Some("A")),      // ok
            attach("B", None, true), // ok
            detach("missing"),       // not found
            detach("Y"),             // ok
        ];
        let report = apply_operations(&mut tree, &ops);
        assert_eq!(report.applied, 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(report.outcomes.len(), 5);
        assert!(matches!(report.outcomes[0].status, OperationStatus::Skipped(_)));
        assert_eq!(report.outcomes[1].status, OperationStatus::Applied);
        assert!(tree::all_ids_unique(&tree));
        assert!(report.changed());
        assert_eq!(report.summary(), "3 applied, 2 skipped");
    }

    #[test]
    fn test_same_node_twice_is_order_dependent() {
        let mut first = chain();
        let report = apply_operations(&mut first, &[detach("C"), mv("C", None)]);
        assert_eq!((report.applied, report.skipped), (1, 1));

        let mut second = chain();
        let report = apply_operations(&mut second, &[mv("C", None), detach("C")]);
        assert_eq!((report.applied, report.skipped), (2, 0));
        assert_eq!(second.node_count(), 2);
    }

    #[test]
    fn test_empty_batch_is_nothing_to_apply() {
        let mut tree = chain();
        let report = apply_operations(&mut tree, &[]);
        assert!(report.nothing_to_apply());
        assert!(!report.changed());
        assert_eq!(report.summary(), "nothing to apply");
    }

    #[test]
    fn test_dry_run_leaves_tree_alone() {
        let tree = chain();
        let report = dry_run(&tree, &[mv("C", None)]);
        assert_eq!(report.applied, 1);
        assert_eq!(root_ids(&tree), vec!["A"]);
    }

    #[test]
    fn test_touched_ids_include_clones() {
        let mut tree = chain();
        let ops = vec![attach("B", None, false), mv("ghost", None)];
        let report = apply_operations(&mut tree, &ops);
        let touched = report.touched_ids(&ops);
        assert_eq!(touched.len(), 2);
        assert_eq!(touched[0].as_str(), "B");
    }

    #[test]
    fn test_report_json_shape() {
        let mut tree = chain();
        let report = apply_operations(&mut tree, &[mv("A", Some("C"))]);
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["skipped"], 1);
        assert_eq!(value["outcomes"][0]["status"], "skipped");
        assert_eq!(value["outcomes"][0]["kind"], "move");
        assert!(
            value["outcomes"][0]["reason"]
                .as_str()
                .unwrap()
                .contains("self or descendant")
        );
    }
}
