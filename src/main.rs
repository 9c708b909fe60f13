//! issuetree CLI - command-line interface for the issue tree.

use clap::{Parser, Subcommand};
use colored::Colorize;
use issuetree::analysis::reference_map;
use issuetree::lint::Fixable;
use issuetree::operations::OperationStatus;
use issuetree::snapshot::title_map;
use issuetree::storage::{FsDocumentStore, stem_title};
use issuetree::tree::{self, FocusEntry};
use issuetree::{
    ApplyReport, DocumentInfo, DocumentStore, HttpPlanner, LintSeverity, NodeId, ServiceError,
    TreeService, ViewId, cancel_channel, find_workspace_root, fix_issues, init_workspace,
    lint_workspace, load_config, parse_operations, plan_and_apply,
};
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::io::Read;
use std::path::PathBuf;
use std::process;

/// Log filter environment variable.
const LOG_ENV: &str = "ISSUETREE_LOG";

#[derive(Parser)]
#[command(name = "issuetree")]
#[command(about = "A persisted issue hierarchy with move, attach, and disassociate relations")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new workspace in the current directory
    Init {
        /// Overwrite existing workspace
        #[arg(short, long)]
        force: bool,
    },

    /// Place a document in the tree as a new node
    Add {
        /// Document path, relative to the documents directory
        document: String,

        /// Parent node ID (root when omitted)
        #[arg(short, long)]
        parent: Option<String>,

        /// Focus scope the parent was picked from
        #[arg(long)]
        focus: Option<String>,

        /// Create the document with this heading if it does not exist
        #[arg(short, long)]
        title: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the tree, or the scope rooted at one node
    Tree {
        /// Node ID to use as the scope root
        #[arg(long)]
        focus: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Get a node by ID
    Get {
        /// Node ID
        id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Move a node and its subtree under another node
    Move {
        /// Node ID to move
        id: String,

        /// New parent node ID (root when omitted)
        #[arg(long)]
        to: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Place a node's document at another location as a new node
    Attach {
        /// Node ID to attach
        id: String,

        /// Parent node ID for the new placement (root when omitted)
        #[arg(long)]
        to: Option<String>,

        /// Also copy the node's descendants
        #[arg(long)]
        deep: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove one placement (and its subtree) without touching other placements
    Detach {
        /// Node ID to remove
        id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Toggle a node's expanded flag
    Toggle {
        /// Node ID
        id: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List documents placed at more than one node
    Duplicates {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List documents not placed anywhere in the tree
    Orphans {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Lint the workspace for structural issues
    Lint {
        /// Auto-fix issues where possible
        #[arg(long)]
        fix: bool,

        /// Exit with code 2 on warnings as well as errors
        #[arg(long)]
        strict: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Build the planner snapshot for an instruction
    Snapshot {
        /// Free-text instruction
        instruction: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Apply a batch of proposed operations from a JSON file
    Apply {
        /// JSON file with {"operations": [...]} or a bare array; stdin when omitted or "-"
        file: Option<PathBuf>,

        /// Exit with code 2 if any operation was skipped
        #[arg(long)]
        strict: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Ask the configured planner for operations and apply them
    Plan {
        /// Free-text instruction
        instruction: String,

        /// Validate the proposal without saving
        #[arg(long)]
        dry_run: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run as MCP server over stdio
    Mcp,

    /// Show available commands (use --json for machine-readable catalog)
    Help {
        /// Output as structured JSON for agent consumption
        #[arg(long)]
        json: bool,
    },
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn is_json(format: &str) -> bool {
    format == "json"
}

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn emit_error(format: &str, code: &str, detail: &str) -> ! {
    if is_json(format) {
        eprintln!("{}", json!({"error": code, "detail": detail}));
    } else {
        eprintln!("{}", format!("Error: {}", detail).red());
    }
    process::exit(1);
}

fn current_dir(format: &str) -> PathBuf {
    env::current_dir().unwrap_or_else(|e| emit_error(format, "io_error", &e.to_string()))
}

fn get_workspace_root(format: &str) -> PathBuf {
    let cwd = current_dir(format);
    match find_workspace_root(&cwd) {
        Some(root) => root,
        None => emit_error(format, "not_in_workspace", "Not in an issuetree workspace"),
    }
}

fn list_documents(root: &std::path::Path) -> Vec<DocumentInfo> {
    match FsDocumentStore::for_workspace(root).list_documents() {
        Ok(docs) => docs,
        Err(e) => {
            tracing::warn!(error = %e, "could not list documents");
            Vec::new()
        }
    }
}

fn title_of(titles: &HashMap<String, String>, doc_ref: &str) -> String {
    titles
        .get(doc_ref)
        .cloned()
        .unwrap_or_else(|| stem_title(doc_ref))
}

/// Print skip reasons from a report; they are always shown, not just counted.
fn print_skips(report: &ApplyReport) {
    for outcome in &report.outcomes {
        if let OperationStatus::Skipped(reason) = &outcome.status {
            println!(
                "  {} #{} {}: {}",
                "skipped".yellow(),
                outcome.index + 1,
                outcome.description,
                reason
            );
        }
    }
}

fn service_failure(format: &str, err: ServiceError) -> ! {
    match err {
        ServiceError::Rejected(reason) => emit_error(format, "rejected", &reason),
        ServiceError::CorruptTree { bytes, reason } => emit_error(
            format,
            "corrupt_tree",
            &format!(
                "tree file is corrupted ({} bytes kept): {}; repair it before editing",
                bytes, reason
            ),
        ),
        ServiceError::Load(source) => emit_error(format, "io_error", &source.to_string()),
        ServiceError::Persist { source, report } => {
            if let Some(report) = &report
                && !is_json(format)
            {
                eprintln!(
                    "{}",
                    format!("Changes were not saved ({})", report.summary()).yellow()
                );
                for warning in &report.warnings {
                    eprintln!("  {}", warning);
                }
            }
            let mut detail = source.to_string();
            if let Some(report) = report
                && is_json(format)
                && !report.warnings.is_empty()
            {
                detail = format!("{}; skipped: {}", detail, report.warnings.join("; "));
            }
            emit_error(format, "persist_error", &detail)
        }
    }
}

fn print_report(format: &str, report: &ApplyReport) {
    if is_json(format) {
        let mut value = serde_json::to_value(report).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("summary".to_string(), json!(report.summary()));
        }
        print_json(&value);
        return;
    }

    if report.nothing_to_apply() {
        println!("{}", "Nothing to apply".dimmed());
        return;
    }
    for outcome in &report.outcomes {
        if outcome.status == OperationStatus::Applied {
            println!("  {} #{} {}", "applied".green(), outcome.index + 1, outcome.description);
        }
    }
    print_skips(report);
    println!();
    let summary = format!("{} applied, {} skipped", report.applied, report.skipped);
    if report.skipped > 0 {
        println!("{}", summary.yellow().bold());
    } else {
        println!("{}", summary.green().bold());
    }
}

fn print_outline(entries: &[(usize, &str, &str, bool)], shared: &HashMap<&str, usize>, titles: &HashMap<String, String>) {
    for (depth, id, doc_ref, expanded) in entries {
        let marker = if *expanded { "-" } else { "+" };
        let shared_note = shared
            .get(doc_ref)
            .filter(|count| **count > 1)
            .map(|count| format!(" [placed {}x]", count).yellow().to_string())
            .unwrap_or_default();
        println!(
            "{}{} {} {}{}",
            "  ".repeat(*depth),
            marker.dimmed(),
            title_of(titles, doc_ref).bold(),
            format!("({})", id).dimmed(),
            shared_note
        );
    }
}

fn build_command_catalog() -> serde_json::Value {
    let param = |name: &str, typ: &str, required: bool, desc: &str| -> serde_json::Value {
        json!({
            "name": name,
            "type": typ,
            "required": required,
            "description": desc
        })
    };
    let format_param = || param("--format", "string", false, "Output format: text, json (default: text)");

    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "commands": [
            {
                "name": "init",
                "description": "Initialize a new workspace in the current directory",
                "parameters": [
                    param("--force", "bool", false, "Overwrite existing workspace")
                ],
                "examples": ["issuetree init", "issuetree init --force"]
            },
            {
                "name": "add",
                "description": "Place a document in the tree as a new node",
                "parameters": [
                    param("document", "string", true, "Document path relative to the documents directory"),
                    param("--parent", "string", false, "Parent node ID (root when omitted)"),
                    param("--focus", "string", false, "Focus scope the parent was picked from"),
                    param("--title", "string", false, "Create the document with this heading if missing"),
                    format_param()
                ],
                "examples": [
                    "issuetree add auth/login.md",
                    "issuetree add auth/reset.md --parent 2f1c... --title 'Password reset'"
                ]
            },
            {
                "name": "tree",
                "description": "Show the tree, or the scope rooted at one node",
                "parameters": [
                    param("--focus", "string", false, "Node ID to use as the scope root"),
                    format_param()
                ],
                "examples": ["issuetree tree", "issuetree tree --focus 2f1c... --format json"]
            },
            {
                "name": "get",
                "description": "Get a node by ID with its path and other placements",
                "parameters": [param("id", "string", true, "Node ID"), format_param()],
                "examples": ["issuetree get 2f1c... --format json"]
            },
            {
                "name": "move",
                "description": "Move a node and its subtree under another node",
                "parameters": [
                    param("id", "string", true, "Node ID to move"),
                    param("--to", "string", false, "New parent node ID (root when omitted)"),
                    format_param()
                ],
                "examples": ["issuetree move 2f1c... --to 9ab0...", "issuetree move 2f1c..."]
            },
            {
                "name": "attach",
                "description": "Place a node's document at another location as a new node",
                "parameters": [
                    param("id", "string", true, "Node ID to attach"),
                    param("--to", "string", false, "Parent node ID (root when omitted)"),
                    param("--deep", "bool", false, "Also copy descendants"),
                    format_param()
                ],
                "examples": ["issuetree attach 2f1c... --to 9ab0... --deep"]
            },
            {
                "name": "detach",
                "description": "Remove one placement without touching other placements of the same document",
                "parameters": [param("id", "string", true, "Node ID to remove"), format_param()],
                "examples": ["issuetree detach 2f1c..."]
            },
            {
                "name": "toggle",
                "description": "Toggle a node's expanded flag",
                "parameters": [param("id", "string", true, "Node ID"), format_param()],
                "examples": ["issuetree toggle 2f1c..."]
            },
            {
                "name": "duplicates",
                "description": "List documents placed at more than one node",
                "parameters": [format_param()],
                "examples": ["issuetree duplicates --format json"]
            },
            {
                "name": "orphans",
                "description": "List documents not placed anywhere in the tree",
                "parameters": [format_param()],
                "examples": ["issuetree orphans"]
            },
            {
                "name": "lint",
                "description": "Lint the workspace for structural issues",
                "parameters": [
                    param("--fix", "bool", false, "Auto-fix issues where possible"),
                    param("--strict", "bool", false, "Exit with code 2 on warnings"),
                    format_param()
                ],
                "examples": ["issuetree lint", "issuetree lint --fix", "issuetree lint --strict --format json"]
            },
            {
                "name": "snapshot",
                "description": "Build the size-bounded planner snapshot for an instruction",
                "parameters": [param("instruction", "string", true, "Free-text instruction"), format_param()],
                "examples": ["issuetree snapshot 'group the login issues under auth' --format json"]
            },
            {
                "name": "apply",
                "description": "Apply a batch of proposed operations (move, attach, disassociate)",
                "parameters": [
                    param("file", "string", false, "JSON file; stdin when omitted or '-'"),
                    param("--strict", "bool", false, "Exit with code 2 if any operation was skipped"),
                    format_param()
                ],
                "examples": ["issuetree apply ops.json", "cat ops.json | issuetree apply --format json"]
            },
            {
                "name": "plan",
                "description": "Ask the configured planner for operations and apply them",
                "parameters": [
                    param("instruction", "string", true, "Free-text instruction"),
                    param("--dry-run", "bool", false, "Validate the proposal without saving"),
                    format_param()
                ],
                "examples": ["issuetree plan 'merge duplicate billing issues' --dry-run"]
            },
            {
                "name": "mcp",
                "description": "Run as MCP server over stdio",
                "parameters": [],
                "examples": ["issuetree mcp"]
            },
            {
                "name": "help",
                "description": "Show available commands (use --json for machine-readable catalog)",
                "parameters": [
                    param("--json", "bool", false, "Output as structured JSON for agent consumption")
                ],
                "examples": ["issuetree help", "issuetree help --json"]
            }
        ],
        "exit_codes": {
            "0": "Success",
            "1": "Error",
            "2": "Actionable condition (lint issues, skipped operations)"
        },
        "environment": {
            "ISSUETREE_LOG": "Log filter for stderr diagnostics (default: warn)",
            "ISSUETREE_PLANNER_URL": "Planner endpoint, overrides planner.endpoint in config.yaml"
        },
        "global_flags": {
            "--format json": "Available on all read and write commands for structured output",
            "--help": "Show help for any command",
            "--version": "Show version"
        }
    })
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let cwd = current_dir("text");

            match init_workspace(&cwd, force) {
                Ok(created) => {
                    for path in &created {
                        let display = path.strip_prefix(&cwd).unwrap_or(path.as_path());
                        println!("{}", format!("Created {}", display.display()).green());
                    }
                    println!();
                    println!("{}", "Workspace initialized.".green().bold());
                    println!();
                    println!("Next steps:");
                    println!("  issuetree add notes/first.md --title 'First issue'");
                    println!("  issuetree tree");
                }
                Err(e) => {
                    eprintln!("{}", format!("Error: {}", e).red());
                    process::exit(1);
                }
            }
        }

        Commands::Add {
            document,
            parent,
            focus,
            title,
            format,
        } => {
            let root = get_workspace_root(&format);
            let documents = FsDocumentStore::for_workspace(&root);

            let parent = parent.map(|p| match &focus {
                Some(f) => ViewId::in_focus(NodeId::from(p), NodeId::from(f.as_str())),
                None => ViewId::plain(NodeId::from(p)),
            });

            let mut service = TreeService::open(&root);
            match service.create(parent.as_ref(), &document) {
                Ok(id) => {
                    // Only write the file once the node is saved.
                    if let Some(title) = &title
                        && let Err(e) = documents.create_document(document.trim(), title)
                    {
                        emit_error(
                            &format,
                            "document_error",
                            &format!("node {} was added but {}: {}", id, document.trim(), e),
                        );
                    }
                    if is_json(&format) {
                        print_json(&json!({
                            "success": true,
                            "id": id,
                            "documentRef": document.trim(),
                            "parentId": parent.as_ref().map(ViewId::base),
                        }));
                    } else {
                        println!("{}", format!("Created node: {}", id).green());
                        if !documents.exists(document.trim()) {
                            println!(
                                "{}",
                                format!("Note: {} does not exist yet", document.trim()).dimmed()
                            );
                        }
                    }
                }
                Err(e) => service_failure(&format, e),
            }
        }

        Commands::Tree { focus, format } => {
            let root = get_workspace_root(&format);
            let tree = TreeService::open(&root).tree();
            let titles = title_map(&list_documents(&root));
            let refs = reference_map(&tree);
            let shared: HashMap<&str, usize> = refs.iter().map(|(r, ids)| (*r, ids.len())).collect();

            match focus {
                Some(focus) => {
                    let focus_id = NodeId::from(focus);
                    let Some(entries) = tree::focus_view(&tree, &focus_id) else {
                        emit_error(&format, "not_found", &format!("Node not found: {}", focus_id));
                    };
                    if is_json(&format) {
                        let nodes: Vec<_> = entries
                            .iter()
                            .map(|e: &FocusEntry| {
                                json!({
                                    "view": e.view,
                                    "documentRef": e.document_ref,
                                    "title": title_of(&titles, &e.document_ref),
                                    "depth": e.depth,
                                })
                            })
                            .collect();
                        print_json(&json!({"focus": focus_id, "nodes": nodes}));
                    } else {
                        if let Some(path) = tree::breadcrumb(&tree, &focus_id) {
                            println!("{}", path.dimmed());
                        }
                        let rows: Vec<(usize, &str, &str, bool)> = entries
                            .iter()
                            .map(|e| {
                                let expanded = tree::find_by_id(&tree, e.view.base())
                                    .map(|n| n.expanded)
                                    .unwrap_or(false);
                                (e.depth, e.view.base().as_str(), e.document_ref.as_str(), expanded)
                            })
                            .collect();
                        print_outline(&rows, &shared, &titles);
                    }
                }
                None => {
                    if is_json(&format) {
                        print_json(&serde_json::to_value(&tree).unwrap_or_default());
                    } else if tree.is_empty() {
                        println!("{}", "Tree is empty".dimmed());
                    } else {
                        let visits = tree::walk(&tree);
                        let rows: Vec<(usize, &str, &str, bool)> = visits
                            .iter()
                            .map(|v| {
                                (
                                    v.depth,
                                    v.node.id.as_str(),
                                    v.node.document_ref.as_str(),
                                    v.node.expanded,
                                )
                            })
                            .collect();
                        print_outline(&rows, &shared, &titles);
                        println!();
                        println!("{}", format!("{} node(s)", tree.node_count()).dimmed());
                    }
                }
            }
        }

        Commands::Get { id, format } => {
            let root = get_workspace_root(&format);
            let tree = TreeService::open(&root).tree();
            let id = NodeId::from(id);
            let Some(node) = tree::find_by_id(&tree, &id) else {
                emit_error(&format, "not_found", &format!("Node not found: {}", id));
            };
            let titles = title_map(&list_documents(&root));
            let refs = reference_map(&tree);
            let others: Vec<&NodeId> = refs
                .get(node.document_ref.as_str())
                .map(|ids| ids.iter().filter(|o| **o != id).collect())
                .unwrap_or_default();
            let parent = tree::parent_of(&tree, &id).map(|p| &p.id);
            let path = tree::breadcrumb(&tree, &id).unwrap_or_default();

            if is_json(&format) {
                print_json(&json!({
                    "id": node.id,
                    "documentRef": node.document_ref,
                    "title": title_of(&titles, &node.document_ref),
                    "expanded": node.expanded,
                    "parentId": parent,
                    "path": path,
                    "children": node.children.iter().map(|c| &c.id).collect::<Vec<_>>(),
                    "otherPlacements": others,
                }));
            } else {
                println!("{}", title_of(&titles, &node.document_ref).bold());
                println!("  {} {}", "id:".dimmed(), node.id);
                println!("  {} {}", "document:".dimmed(), node.document_ref);
                println!("  {} {}", "path:".dimmed(), path);
                if let Some(parent) = parent {
                    println!("  {} {}", "parent:".dimmed(), parent);
                }
                if !node.children.is_empty() {
                    println!("  {}", "children:".dimmed());
                    for child in &node.children {
                        println!(
                            "    {} {}",
                            child.id.to_string().cyan(),
                            title_of(&titles, &child.document_ref)
                        );
                    }
                }
                if !others.is_empty() {
                    println!("  {}", "also placed at:".dimmed());
                    for other in &others {
                        let crumb = tree::breadcrumb(&tree, other).unwrap_or_default();
                        println!("    {} {}", other.to_string().cyan(), crumb.dimmed());
                    }
                }
            }
        }

        Commands::Move { id, to, format } => {
            let root = get_workspace_root(&format);
            let node = ViewId::plain(NodeId::from(id));
            let target = to.map(|t| ViewId::plain(NodeId::from(t)));
            let mut service = TreeService::open(&root);
            match service.move_to(&node, target.as_ref()) {
                Ok(()) => {
                    let to_label = target
                        .as_ref()
                        .map(|t| t.base().to_string())
                        .unwrap_or_else(|| "root".to_string());
                    if is_json(&format) {
                        print_json(&json!({
                            "success": true,
                            "id": node.base(),
                            "parentId": target.as_ref().map(ViewId::base),
                        }));
                    } else {
                        println!("{}", format!("Moved {} -> {}", node, to_label).green());
                    }
                }
                Err(e) => service_failure(&format, e),
            }
        }

        Commands::Attach {
            id,
            to,
            deep,
            format,
        } => {
            let root = get_workspace_root(&format);
            let node = ViewId::plain(NodeId::from(id));
            let target = to.map(|t| ViewId::plain(NodeId::from(t)));
            let mut service = TreeService::open(&root);
            match service.attach(&node, target.as_ref(), deep) {
                Ok(created) => {
                    if is_json(&format) {
                        print_json(&json!({
                            "success": true,
                            "source": node.base(),
                            "id": created,
                            "parentId": target.as_ref().map(ViewId::base),
                            "deep": deep,
                        }));
                    } else {
                        println!("{}", format!("Attached {} as {}", node, created).green());
                    }
                }
                Err(e) => service_failure(&format, e),
            }
        }

        Commands::Detach { id, format } => {
            let root = get_workspace_root(&format);
            let node = ViewId::plain(NodeId::from(id));
            let mut service = TreeService::open(&root);
            match service.disassociate(&node) {
                Ok(removed) => {
                    let removed_ids = removed.subtree_ids();
                    if is_json(&format) {
                        print_json(&json!({
                            "success": true,
                            "id": removed.id,
                            "documentRef": removed.document_ref,
                            "removed": removed_ids,
                        }));
                    } else {
                        println!(
                            "{}",
                            format!("Removed {} ({} node(s))", removed.id, removed_ids.len()).green()
                        );
                    }
                }
                Err(e) => service_failure(&format, e),
            }
        }

        Commands::Toggle { id, format } => {
            let root = get_workspace_root(&format);
            let node = ViewId::plain(NodeId::from(id));
            let mut service = TreeService::open(&root);
            match service.toggle_expanded(&node) {
                Ok(expanded) => {
                    if is_json(&format) {
                        print_json(&json!({"success": true, "id": node.base(), "expanded": expanded}));
                    } else {
                        let state = if expanded { "expanded" } else { "collapsed" };
                        println!("{}", format!("{} is now {}", node, state).green());
                    }
                }
                Err(e) => service_failure(&format, e),
            }
        }

        Commands::Duplicates { format } => {
            let root = get_workspace_root(&format);
            let groups = TreeService::open(&root).duplicates();

            if is_json(&format) {
                print_json(&json!({
                    "count": groups.len(),
                    "groups": groups.iter().map(|g| json!({
                        "documentRef": g.document_ref,
                        "count": g.count(),
                        "nodeIds": g.node_ids,
                    })).collect::<Vec<_>>(),
                }));
            } else if groups.is_empty() {
                println!("{}", "No document is placed more than once".green());
            } else {
                let tree = TreeService::open(&root).tree();
                for group in &groups {
                    println!(
                        "{} {}",
                        group.document_ref.bold(),
                        format!("({} placements)", group.count()).yellow()
                    );
                    for id in &group.node_ids {
                        let crumb = tree::breadcrumb(&tree, id).unwrap_or_default();
                        println!("  {} {}", id.to_string().cyan(), crumb.dimmed());
                    }
                }
            }
        }

        Commands::Orphans { format } => {
            let root = get_workspace_root(&format);
            let docs = list_documents(&root);
            let orphans = TreeService::open(&root).orphans(&docs);

            if is_json(&format) {
                print_json(&json!({
                    "count": orphans.len(),
                    "documents": orphans,
                }));
            } else if orphans.is_empty() {
                println!("{}", "Every document is placed in the tree".green());
            } else {
                println!("{}", format!("{} unplaced document(s):", orphans.len()).bold());
                for doc in &orphans {
                    println!("  {} {}", doc.doc_ref.cyan(), doc.title.dimmed());
                }
            }
        }

        Commands::Lint {
            fix,
            strict,
            format,
        } => {
            let root = get_workspace_root(&format);
            let report = lint_workspace(&root);

            if is_json(&format) {
                let json_issues: Vec<_> = report
                    .issues
                    .iter()
                    .map(|i| {
                        json!({
                            "file": i.file.display().to_string(),
                            "node_id": i.node_id,
                            "severity": format!("{}", i.severity),
                            "message": i.message,
                            "fixable": i.fixable == Fixable::Yes,
                        })
                    })
                    .collect();

                let mut fixed_msgs = Vec::new();
                if fix && !report.fixable().is_empty() {
                    fixed_msgs = fix_issues(&root, &report);
                }

                print_json(&json!({
                    "errors": report.errors().len(),
                    "warnings": report.warnings().len(),
                    "info": report.infos().len(),
                    "fixable": report.fixable().len(),
                    "issues": json_issues,
                    "fixed": fixed_msgs,
                }));

                if report.has_errors() && !(fix && fixed_msgs.len() == report.fixable().len()) {
                    process::exit(1);
                } else if strict && report.is_actionable() {
                    process::exit(2);
                }
            } else {
                if report.issues.is_empty() {
                    println!("{}", "No issues found".green());
                    return;
                }

                for issue in &report.issues {
                    let colored_msg = match issue.severity {
                        LintSeverity::Error => format!("{}", issue).red().to_string(),
                        LintSeverity::Warning => format!("{}", issue).yellow().to_string(),
                        LintSeverity::Info => format!("{}", issue).dimmed().to_string(),
                    };
                    println!("{}", colored_msg);
                }
                println!();

                println!(
                    "{}",
                    format!(
                        "{} error(s), {} warning(s), {} info, {} fixable",
                        report.errors().len(),
                        report.warnings().len(),
                        report.infos().len(),
                        report.fixable().len()
                    )
                    .bold()
                );

                let mut all_fixed = false;
                if fix && !report.fixable().is_empty() {
                    println!();
                    let fixed = fix_issues(&root, &report);
                    for msg in &fixed {
                        println!("{}", format!("Fixed: {}", msg).green());
                    }
                    println!(
                        "{}",
                        format!("{} issue(s) fixed", fixed.len()).green().bold()
                    );
                    all_fixed = !lint_workspace(&root).has_errors();
                }

                if report.has_errors() && !all_fixed {
                    process::exit(1);
                } else if strict && report.is_actionable() {
                    process::exit(2);
                }
            }
        }

        Commands::Snapshot {
            instruction,
            format,
        } => {
            let root = get_workspace_root(&format);
            let budget = load_config(&root).snapshot.byte_budget;
            let docs = list_documents(&root);
            let snapshot = TreeService::open(&root).snapshot(&instruction, &docs, budget);

            if is_json(&format) {
                print_json(&snapshot.to_json());
            } else {
                println!(
                    "{}",
                    format!(
                        "{} of {} node(s) included",
                        snapshot.meta.included_nodes, snapshot.meta.total_nodes
                    )
                    .bold()
                );
                println!("{} {}", "keywords:".dimmed(), snapshot.meta.keywords.join(", "));
                println!("{} {}", "note:".dimmed(), snapshot.meta.note);
                println!();
                for node in &snapshot.nodes {
                    println!(
                        "{}{} {}",
                        "  ".repeat(node.depth),
                        node.display_title,
                        format!("({})", node.id).dimmed()
                    );
                }
                if !snapshot.duplicates_by_document.is_empty() {
                    println!();
                    println!("{}", "Shared documents:".bold());
                    for dup in &snapshot.duplicates_by_document {
                        println!("  {} x{}", dup.document_ref, dup.count);
                    }
                }
            }
        }

        Commands::Apply {
            file,
            strict,
            format,
        } => {
            let root = get_workspace_root(&format);
            let input = match file.as_deref() {
                Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
                    .unwrap_or_else(|e| {
                        emit_error(&format, "io_error", &format!("{}: {}", path.display(), e))
                    }),
                _ => {
                    let mut buf = String::new();
                    if let Err(e) = std::io::stdin().read_to_string(&mut buf) {
                        emit_error(&format, "io_error", &e.to_string());
                    }
                    buf
                }
            };
            let payload: serde_json::Value = serde_json::from_str(&input)
                .unwrap_or_else(|e| emit_error(&format, "invalid_input", &e.to_string()));
            let operations = parse_operations(&payload);

            let mut service = TreeService::open(&root);
            match service.apply_batch(&operations) {
                Ok(report) => {
                    print_report(&format, &report);
                    if strict && report.skipped > 0 {
                        process::exit(2);
                    }
                }
                Err(e) => service_failure(&format, e),
            }
        }

        Commands::Plan {
            instruction,
            dry_run,
            format,
        } => {
            let root = get_workspace_root(&format);
            let config = load_config(&root);
            let planner = HttpPlanner::from_config(&config)
                .unwrap_or_else(|e| emit_error(&format, "planner_error", &e.to_string()));
            let docs = list_documents(&root);
            let mut service = TreeService::open(&root);

            let rt = tokio::runtime::Runtime::new()
                .unwrap_or_else(|e| emit_error(&format, "runtime_error", &e.to_string()));
            let result = rt.block_on(async {
                let (cancel_tx, cancel) = cancel_channel();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        let _ = cancel_tx.send(true);
                    }
                });
                plan_and_apply(
                    &mut service,
                    &planner,
                    &instruction,
                    &docs,
                    config.snapshot.byte_budget,
                    cancel,
                    dry_run,
                )
                .await
            });

            match result {
                Ok(outcome) => {
                    if is_json(&format) {
                        print_json(&serde_json::to_value(&outcome).unwrap_or_default());
                    } else {
                        println!(
                            "{}",
                            format!(
                                "Planner proposed {} operation(s) from {} snapshot node(s)",
                                outcome.operations.len(),
                                outcome.snapshot_nodes
                            )
                            .bold()
                        );
                        if dry_run {
                            println!("{}", "Dry run: nothing was saved".dimmed());
                        }
                        print_report(&format, &outcome.report);
                    }
                }
                Err(issuetree::planner::PlanError::Service(e)) => service_failure(&format, e),
                Err(e) => emit_error(&format, "planner_error", &e.to_string()),
            }
        }

        Commands::Mcp => {
            let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
                eprintln!("{}", format!("Failed to create runtime: {}", e).red());
                process::exit(1);
            });
            if let Err(e) = rt.block_on(issuetree::mcp::run_server()) {
                eprintln!("{}", format!("MCP server error: {}", e).red());
                process::exit(1);
            }
        }

        Commands::Help { json } => {
            let catalog = build_command_catalog();
            if json {
                print_json(&catalog);
            } else {
                println!(
                    "{}\n",
                    "ISSUETREE - A persisted issue hierarchy with move, attach, and disassociate relations"
                        .bold()
                );
                println!("{}", "COMMANDS:".bold());
                if let Some(commands) = catalog["commands"].as_array() {
                    for cmd in commands {
                        let name = cmd["name"].as_str().unwrap_or("");
                        let desc = cmd["description"].as_str().unwrap_or("");
                        println!("  {:<12} {}", name.cyan(), desc);
                    }
                }
                println!();
                println!("{}", "EXIT CODES:".bold());
                println!("  {}  Success", "0".cyan());
                println!("  {}  Error", "1".cyan());
                println!(
                    "  {}  Actionable condition (lint issues, skipped operations)",
                    "2".cyan()
                );
                println!();
                println!(
                    "Use {} for machine-readable command catalog.",
                    "issuetree help --json".cyan()
                );
                println!(
                    "Use {} for help on a specific command.",
                    "issuetree <command> --help".cyan()
                );
            }
        }
    }
}
