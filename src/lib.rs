//! issuetree - a persisted hierarchy of issue documents.
//!
//! Documents are placed in a tree of nodes. A node can be moved, a document
//! can be attached at further places (each placement is its own node), and a
//! single placement can be disassociated without touching the others. Batches
//! of such edits proposed by an external planner are validated and applied
//! with per-operation outcomes.

pub mod analysis;
pub mod lint;
pub mod mcp;
pub mod operations;
pub mod planner;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod tree;
pub mod types;

pub use analysis::{DuplicateGroup, duplicate_groups, orphan_documents};
pub use lint::{LintReport, LintSeverity, fix_issues, lint_workspace};
pub use operations::{
    ApplyReport, OperationStatus, ProposedOperation, apply_operations, parse_operations,
    parse_operations_str,
};
pub use planner::{HttpPlanner, PlanOutcome, Planner, PlannerError, cancel_channel, plan_and_apply};
pub use service::{ChangeKind, ServiceError, TreeEvent, TreeService};
pub use snapshot::{Snapshot, build_snapshot};
pub use storage::{
    DocumentStore, FsDocumentStore, LoadOutcome, StorageError, TreeStore, WORKSPACE_DIR,
    find_workspace_root, init_workspace, load_config,
};
pub use types::{DocumentInfo, IssueNode, IssueTree, NodeId, ViewId};
