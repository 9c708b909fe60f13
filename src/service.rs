//! Tree service: the single entry point for mutating a stored tree.
//!
//! Every command runs one load, mutate, save cycle and then notifies
//! subscribers once. There is no locking between cycles; the last writer wins.

use crate::analysis::{self, DuplicateGroup};
use crate::operations::{self, ApplyReport, OperationStatus, ProposedOperation};
use crate::snapshot::{self, Snapshot};
use crate::storage::{LoadOutcome, StorageError, TreeStore};
use crate::tree;
use crate::types::{DocumentInfo, IssueNode, IssueTree, NodeId, ViewId};
use std::path::Path;
use thiserror::Error;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum ServiceError {
    /// The command was structurally invalid; nothing was changed.
    #[error("{0}")]
    Rejected(String),
    /// The in-memory change happened but could not be written.
    #[error("failed to save tree: {source}")]
    Persist {
        #[source]
        source: StorageError,
        report: Option<ApplyReport>,
    },
    /// The tree file exists but does not parse; edits would overwrite it.
    #[error("tree file is corrupted ({bytes} bytes kept): {reason}")]
    CorruptTree { bytes: usize, reason: String },
    #[error("failed to read tree: {0}")]
    Load(#[source] StorageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Moved,
    Attached,
    Disassociated,
    Toggled,
    BatchApplied { applied: usize },
    Repaired,
}

/// Sent to subscribers after a change has been saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEvent {
    pub kind: ChangeKind,
    pub node_ids: Vec<NodeId>,
}

pub struct TreeService {
    store: TreeStore,
    events: broadcast::Sender<TreeEvent>,
}

impl TreeService {
    pub fn new(store: TreeStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        TreeService { store, events }
    }

    /// Service over the tree file of the workspace at `root`.
    pub fn open(root: &Path) -> Self {
        Self::new(TreeStore::for_workspace(root))
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut TreeStore {
        &mut self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, kind: ChangeKind, node_ids: Vec<NodeId>) {
        // No subscribers is fine.
        let _ = self.events.send(TreeEvent { kind, node_ids });
    }

    fn commit(&mut self, tree: &mut IssueTree) -> Result<(), ServiceError> {
        self.store
            .save(tree)
            .map_err(|source| ServiceError::Persist {
                source,
                report: None,
            })
    }

    /// Current tree; missing or corrupted files read as empty.
    pub fn tree(&mut self) -> IssueTree {
        self.store.load_or_default()
    }

    /// The tree to edit. A missing file starts empty, but a corrupted one
    /// is refused so the next save cannot clobber it.
    fn editable_tree(&mut self) -> Result<IssueTree, ServiceError> {
        match self.store.load().map_err(ServiceError::Load)? {
            LoadOutcome::Loaded(tree) => Ok(tree),
            LoadOutcome::Missing => Ok(IssueTree::empty()),
            LoadOutcome::Corrupted { raw, reason } => {
                tracing::warn!(
                    path = %self.store.path().display(),
                    bytes = raw.len(),
                    %reason,
                    "refusing to edit a corrupted tree file"
                );
                Err(ServiceError::CorruptTree {
                    bytes: raw.len(),
                    reason,
                })
            }
        }
    }

    fn require(tree: &IssueTree, id: &NodeId) -> Result<(), ServiceError> {
        match tree::find_by_id(tree, id) {
            Some(_) => Ok(()),
            None => Err(ServiceError::Rejected(format!("node {} not found", id))),
        }
    }

    /// Run one operation through the batch pipeline and reject on skip.
    fn apply_single(
        &mut self,
        op: ProposedOperation,
        kind: ChangeKind,
    ) -> Result<Option<NodeId>, ServiceError> {
        let mut tree = self.editable_tree()?;
        let report = operations::apply_operations(&mut tree, std::slice::from_ref(&op));
        let outcome = report
            .outcomes
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Rejected("nothing to apply".to_string()))?;
        if let OperationStatus::Skipped(reason) = outcome.status {
            return Err(ServiceError::Rejected(reason));
        }

        self.commit(&mut tree)?;
        let mut ids = vec![op.subject().clone()];
        ids.extend(outcome.created_id.clone());
        self.emit(kind, ids);
        Ok(outcome.created_id)
    }

    /// Create a node for `document_ref` at the front of `parent` (or the roots).
    pub fn create(
        &mut self,
        parent: Option<&ViewId>,
        document_ref: &str,
    ) -> Result<NodeId, ServiceError> {
        let document_ref = document_ref.trim();
        if document_ref.is_empty() {
            return Err(ServiceError::Rejected("document ref is empty".to_string()));
        }

        let mut tree = self.editable_tree()?;
        let parent = parent.map(ViewId::base);
        if let Some(p) = parent {
            Self::require(&tree, p)?;
        }
        let (id, _) = tree::create_node(&mut tree, parent, document_ref);
        self.commit(&mut tree)?;
        self.emit(ChangeKind::Created, vec![id.clone()]);
        Ok(id)
    }

    pub fn move_to(&mut self, node: &ViewId, target: Option<&ViewId>) -> Result<(), ServiceError> {
        let op = ProposedOperation::Move {
            source_id: node.base().clone(),
            target_parent_id: target.map(|t| t.base().clone()),
            reason: None,
        };
        self.apply_single(op, ChangeKind::Moved).map(|_| ())
    }

    /// Attach a clone of `node` under `target`; returns the clone's id.
    pub fn attach(
        &mut self,
        node: &ViewId,
        target: Option<&ViewId>,
        include_descendants: bool,
    ) -> Result<NodeId, ServiceError> {
        let op = ProposedOperation::Attach {
            source_id: node.base().clone(),
            target_parent_id: target.map(|t| t.base().clone()),
            include_descendants,
            reason: None,
        };
        self.apply_single(op, ChangeKind::Attached)?
            .ok_or_else(|| ServiceError::Rejected("attach created no node".to_string()))
    }

    /// Remove one reference (and its subtree); returns what was removed.
    pub fn disassociate(&mut self, node: &ViewId) -> Result<IssueNode, ServiceError> {
        let mut tree = self.editable_tree()?;
        let removed = tree::remove(&mut tree, node.base())
            .ok_or_else(|| ServiceError::Rejected(format!("node {} not found", node.base())))?;
        self.commit(&mut tree)?;
        self.emit(ChangeKind::Disassociated, removed.subtree_ids());
        Ok(removed)
    }

    /// Flip the display flag; returns the new value.
    pub fn toggle_expanded(&mut self, node: &ViewId) -> Result<bool, ServiceError> {
        let mut tree = self.editable_tree()?;
        let expanded = tree::toggle_expanded(&mut tree, node.base())
            .ok_or_else(|| ServiceError::Rejected(format!("node {} not found", node.base())))?;
        self.commit(&mut tree)?;
        self.emit(ChangeKind::Toggled, vec![node.base().clone()]);
        Ok(expanded)
    }

    /// Apply a proposed batch. Saves and notifies once, and only when at
    /// least one operation applied.
    pub fn apply_batch(
        &mut self,
        operations: &[ProposedOperation],
    ) -> Result<ApplyReport, ServiceError> {
        let mut tree = self.editable_tree()?;
        let report = operations::apply_operations(&mut tree, operations);

        if !report.changed() {
            tracing::info!(summary = %report.summary(), "batch made no changes");
            return Ok(report);
        }

        if let Err(source) = self.store.save(&mut tree) {
            return Err(ServiceError::Persist {
                source,
                report: Some(report),
            });
        }
        tracing::info!(applied = report.applied, skipped = report.skipped, "batch applied");
        self.emit(
            ChangeKind::BatchApplied {
                applied: report.applied,
            },
            report.touched_ids(operations),
        );
        Ok(report)
    }

    /// Give later copies of repeated ids fresh identities. Returns how many
    /// nodes were renamed; saves only when something changed.
    pub fn repair_identities(&mut self) -> Result<usize, ServiceError> {
        let mut tree = self.editable_tree()?;
        let repeated = tree::repeated_ids(&tree);
        let renamed = tree::reidentify_repeats(&mut tree);
        if renamed > 0 {
            self.commit(&mut tree)?;
            self.emit(ChangeKind::Repaired, repeated);
        }
        Ok(renamed)
    }

    pub fn snapshot(
        &mut self,
        instruction: &str,
        documents: &[DocumentInfo],
        byte_budget: usize,
    ) -> Snapshot {
        let tree = self.tree();
        snapshot::build_snapshot(
            &tree,
            instruction,
            &snapshot::title_map(documents),
            byte_budget,
        )
    }

    pub fn duplicates(&mut self) -> Vec<DuplicateGroup> {
        analysis::duplicate_groups(&self.tree())
    }

    pub fn orphans(&mut self, documents: &[DocumentInfo]) -> Vec<DocumentInfo> {
        analysis::orphan_documents(&self.tree(), documents)
    }
}
