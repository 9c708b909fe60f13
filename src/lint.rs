//! Lint and validation for an issuetree workspace.

use crate::analysis::{dangling_references, duplicate_groups, orphan_documents};
use crate::service::TreeService;
use crate::storage::{
    CONFIG_FILE, DocumentStore, FsDocumentStore, LoadOutcome, TreeStore, WORKSPACE_DIR,
    write_default_config,
};
use crate::tree::repeated_ids;
use crate::types::{FORMAT_VERSION, IssueTree};
use std::fmt;
use std::path::{Path, PathBuf};

/// Severity of a lint issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintSeverity {
    Error,
    Warning,
    /// Reported for awareness; never fails a strict run.
    Info,
}

impl fmt::Display for LintSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintSeverity::Error => write!(f, "error"),
            LintSeverity::Warning => write!(f, "warning"),
            LintSeverity::Info => write!(f, "info"),
        }
    }
}

/// Whether a lint issue can be auto-fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixable {
    Yes,
    No,
}

/// What a lint issue is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintKind {
    MissingWorkspace,
    MissingConfig,
    MissingTree,
    UnreadableTree,
    FormatVersion,
    EmptyDocumentRef,
    RepeatedId,
    MissingDocument,
    SharedDocument,
    OrphanDocument,
}

/// A single lint issue.
#[derive(Debug, Clone)]
pub struct LintIssue {
    pub file: PathBuf,
    pub node_id: Option<String>,
    pub kind: LintKind,
    pub severity: LintSeverity,
    pub message: String,
    pub fixable: Fixable,
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file_display = self
            .file
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| self.file.display().to_string());
        let node_part = self
            .node_id
            .as_ref()
            .map(|id| format!(" ({})", id))
            .unwrap_or_default();
        write!(
            f,
            "{}: {}{}: {}",
            self.severity, file_display, node_part, self.message
        )
    }
}

/// Result of linting a workspace.
#[derive(Debug, Clone, Default)]
pub struct LintReport {
    pub issues: Vec<LintIssue>,
}

impl LintReport {
    fn by_severity(&self, severity: LintSeverity) -> Vec<&LintIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == severity)
            .collect()
    }

    pub fn errors(&self) -> Vec<&LintIssue> {
        self.by_severity(LintSeverity::Error)
    }

    pub fn warnings(&self) -> Vec<&LintIssue> {
        self.by_severity(LintSeverity::Warning)
    }

    pub fn infos(&self) -> Vec<&LintIssue> {
        self.by_severity(LintSeverity::Info)
    }

    pub fn fixable(&self) -> Vec<&LintIssue> {
        self.issues
            .iter()
            .filter(|i| i.fixable == Fixable::Yes)
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == LintSeverity::Error)
    }

    /// Errors or warnings present; what `--strict` fails on.
    pub fn is_actionable(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity != LintSeverity::Info)
    }

    fn push(
        &mut self,
        file: &Path,
        node_id: Option<String>,
        kind: LintKind,
        severity: LintSeverity,
        message: String,
        fixable: Fixable,
    ) {
        self.issues.push(LintIssue {
            file: file.to_path_buf(),
            node_id,
            kind,
            severity,
            message,
            fixable,
        });
    }
}

/// Lint the tree and documents of the workspace at `root`.
pub fn lint_workspace(root: &Path) -> LintReport {
    let workspace_dir = root.join(WORKSPACE_DIR);
    let mut report = LintReport::default();

    if !workspace_dir.exists() {
        report.push(
            &workspace_dir,
            None,
            LintKind::MissingWorkspace,
            LintSeverity::Error,
            "No .issuetree directory found".to_string(),
            Fixable::No,
        );
        return report;
    }

    let config_path = workspace_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        report.push(
            &config_path,
            None,
            LintKind::MissingConfig,
            LintSeverity::Warning,
            "Missing config.yaml".to_string(),
            Fixable::Yes,
        );
    }

    let mut store = TreeStore::for_workspace(root);
    let tree_path = store.path().to_path_buf();
    let tree = match store.load() {
        Ok(LoadOutcome::Loaded(tree)) => tree,
        Ok(LoadOutcome::Missing) => {
            report.push(
                &tree_path,
                None,
                LintKind::MissingTree,
                LintSeverity::Warning,
                "Tree file missing".to_string(),
                Fixable::Yes,
            );
            return report;
        }
        Ok(LoadOutcome::Corrupted { raw, reason }) => {
            report.push(
                &tree_path,
                None,
                LintKind::UnreadableTree,
                LintSeverity::Error,
                format!("Invalid tree file ({} bytes): {}", raw.len(), reason),
                Fixable::No,
            );
            return report;
        }
        Err(e) => {
            report.push(
                &tree_path,
                None,
                LintKind::UnreadableTree,
                LintSeverity::Error,
                format!("Cannot read tree file: {}", e),
                Fixable::No,
            );
            return report;
        }
    };

    check_structure(&tree, &tree_path, &mut report);

    let documents = FsDocumentStore::for_workspace(root);
    match documents.list_documents() {
        Ok(docs) => check_documents(&tree, &tree_path, &documents, &docs, &mut report),
        Err(e) => report.push(
            documents.root(),
            None,
            LintKind::MissingDocument,
            LintSeverity::Warning,
            format!("Cannot list documents: {}", e),
            Fixable::No,
        ),
    }

    report
}

fn check_structure(tree: &IssueTree, tree_path: &Path, report: &mut LintReport) {
    if tree.format_version != FORMAT_VERSION {
        report.push(
            tree_path,
            None,
            LintKind::FormatVersion,
            LintSeverity::Warning,
            format!(
                "Unknown format version '{}' (expected {})",
                tree.format_version, FORMAT_VERSION
            ),
            Fixable::No,
        );
    }

    for node in tree.iter() {
        if node.document_ref.trim().is_empty() {
            report.push(
                tree_path,
                Some(node.id.to_string()),
                LintKind::EmptyDocumentRef,
                LintSeverity::Error,
                "Node has an empty documentRef".to_string(),
                Fixable::No,
            );
        }
    }

    for id in repeated_ids(tree) {
        let count = tree.iter().filter(|n| n.id == id).count();
        report.push(
            tree_path,
            Some(id.to_string()),
            LintKind::RepeatedId,
            LintSeverity::Error,
            format!("Node id '{}' appears {} times", id, count),
            Fixable::Yes,
        );
    }
}

fn check_documents(
    tree: &IssueTree,
    tree_path: &Path,
    store: &FsDocumentStore,
    docs: &[crate::types::DocumentInfo],
    report: &mut LintReport,
) {
    for (id, doc_ref) in dangling_references(tree, docs) {
        if doc_ref.trim().is_empty() {
            continue;
        }
        report.push(
            &store.resolve(&doc_ref),
            Some(id.to_string()),
            LintKind::MissingDocument,
            LintSeverity::Warning,
            format!("Document '{}' not found", doc_ref),
            Fixable::No,
        );
    }

    for group in duplicate_groups(tree) {
        report.push(
            tree_path,
            None,
            LintKind::SharedDocument,
            LintSeverity::Info,
            format!(
                "Document '{}' is placed {} times",
                group.document_ref,
                group.count()
            ),
            Fixable::No,
        );
    }

    for doc in orphan_documents(tree, docs) {
        report.push(
            &store.resolve(&doc.doc_ref),
            None,
            LintKind::OrphanDocument,
            LintSeverity::Warning,
            format!("Document '{}' is not placed in the tree", doc.doc_ref),
            Fixable::No,
        );
    }
}

/// Apply auto-fixes for fixable issues.
pub fn fix_issues(root: &Path, report: &LintReport) -> Vec<String> {
    let mut fixed = Vec::new();
    let fixable = report.fixable();

    if fixable.iter().any(|i| i.kind == LintKind::MissingConfig) {
        match write_default_config(root) {
            Ok(path) => fixed.push(format!("Created {}", path.display())),
            Err(e) => tracing::warn!(error = %e, "could not write default config"),
        }
    }

    if fixable.iter().any(|i| i.kind == LintKind::MissingTree) {
        let mut store = TreeStore::for_workspace(root);
        match store.save(&mut IssueTree::empty()) {
            Ok(()) => fixed.push(format!("Created empty tree at {}", store.path().display())),
            Err(e) => tracing::warn!(error = %e, "could not write empty tree"),
        }
    }

    if fixable.iter().any(|i| i.kind == LintKind::RepeatedId) {
        match TreeService::open(root).repair_identities() {
            Ok(renamed) if renamed > 0 => {
                fixed.push(format!("Gave {} repeated node(s) fresh ids", renamed));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not repair repeated ids"),
        }
    }

    fixed
}
