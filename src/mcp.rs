//! MCP server for issuetree.
//!
//! Exposes the tree, planner snapshots, and the batch applier over the Model
//! Context Protocol so an agent can act as the planner.

use crate::analysis::reference_map;
use crate::operations::parse_operations;
use crate::service::{ServiceError, TreeService};
use crate::storage::{
    DocumentStore, FsDocumentStore, StorageError, find_workspace_root, load_config, stem_title,
};
use crate::tree::{self, walk};
use crate::types::{DocumentInfo, NodeId};
use rmcp::ServiceExt;
use rmcp::handler::server::ServerHandler;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Content, Implementation, InitializeResult,
    ListToolsResult, PaginatedRequestParams, ServerCapabilities, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

/// MCP server bound to one workspace.
#[derive(Clone)]
pub struct IssueTreeServer {
    root: PathBuf,
    service: Arc<Mutex<TreeService>>,
}

impl IssueTreeServer {
    pub fn new(root: PathBuf) -> Self {
        let service = TreeService::open(&root);
        Self {
            root,
            service: Arc::new(Mutex::new(service)),
        }
    }

    /// Create a server using the current working directory to find the workspace root
    pub fn from_cwd() -> Result<Self, String> {
        let cwd = std::env::current_dir().map_err(|e| e.to_string())?;
        let root = find_workspace_root(&cwd).ok_or_else(|| StorageError::NotInWorkspace.to_string())?;
        Ok(Self::new(root))
    }

    fn service(&self) -> MutexGuard<'_, TreeService> {
        // A panic mid-command leaves the service usable; state lives on disk.
        self.service.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn documents(&self) -> Vec<DocumentInfo> {
        FsDocumentStore::for_workspace(&self.root)
            .list_documents()
            .unwrap_or_default()
    }

    fn titles(&self) -> std::collections::HashMap<String, String> {
        crate::snapshot::title_map(&self.documents())
    }

    fn title_for(titles: &std::collections::HashMap<String, String>, doc_ref: &str) -> String {
        titles
            .get(doc_ref)
            .cloned()
            .unwrap_or_else(|| stem_title(doc_ref))
    }

    /// Indented outline of the whole tree or of one focus scope.
    fn outline(&self, focus: Option<&str>, max_depth: Option<usize>) -> Result<Value, String> {
        let tree = self.service().tree();
        let titles = self.titles();
        let within = |depth: usize| max_depth.is_none_or(|m| depth <= m);

        let nodes: Vec<Value> = match focus {
            Some(root) => tree::focus_view(&tree, &NodeId::from(root))
                .ok_or_else(|| format!("Node not found: {}", root))?
                .into_iter()
                .filter(|e| within(e.depth))
                .map(|e| {
                    json!({
                        "id": e.view.base(),
                        "view": e.view,
                        "documentRef": e.document_ref,
                        "title": Self::title_for(&titles, &e.document_ref),
                        "depth": e.depth,
                    })
                })
                .collect(),
            None => walk(&tree)
                .into_iter()
                .filter(|v| within(v.depth))
                .map(|v| {
                    json!({
                        "id": v.node.id,
                        "documentRef": v.node.document_ref,
                        "title": Self::title_for(&titles, &v.node.document_ref),
                        "depth": v.depth,
                        "expanded": v.node.expanded,
                        "childCount": v.node.children.len(),
                    })
                })
                .collect(),
        };

        Ok(json!({
            "totalNodes": tree.node_count(),
            "nodes": nodes,
        }))
    }

    /// Details for one node, including its other placements.
    fn get(&self, id: &str) -> Result<Value, String> {
        let tree = self.service().tree();
        let id = NodeId::from(id);
        let node = tree::find_by_id(&tree, &id).ok_or_else(|| format!("Node not found: {}", id))?;
        let titles = self.titles();

        let refs = reference_map(&tree);
        let other_placements: Vec<&NodeId> = refs
            .get(node.document_ref.as_str())
            .map(|ids| ids.iter().filter(|other| **other != id).collect())
            .unwrap_or_default();

        Ok(json!({
            "id": node.id,
            "documentRef": node.document_ref,
            "title": Self::title_for(&titles, &node.document_ref),
            "expanded": node.expanded,
            "parentId": tree::parent_of(&tree, &id).map(|p| &p.id),
            "path": tree::breadcrumb(&tree, &id),
            "children": node.children.iter().map(|c| json!({
                "id": c.id,
                "documentRef": c.document_ref,
            })).collect::<Vec<_>>(),
            "otherPlacements": other_placements,
        }))
    }

    fn snapshot(&self, instruction: &str) -> Result<Value, String> {
        let budget = load_config(&self.root).snapshot.byte_budget;
        let docs = self.documents();
        let snapshot = self.service().snapshot(instruction, &docs, budget);
        serde_json::to_value(&snapshot).map_err(|e| e.to_string())
    }

    /// Validate and apply a proposed batch.
    fn apply(&self, payload: &Value) -> Result<Value, String> {
        let operations = parse_operations(payload);
        match self.service().apply_batch(&operations) {
            Ok(report) => {
                let mut value = serde_json::to_value(&report).map_err(|e| e.to_string())?;
                if let Some(map) = value.as_object_mut() {
                    map.insert("summary".to_string(), json!(report.summary()));
                }
                Ok(value)
            }
            Err(ServiceError::Persist { source, report }) => {
                let warnings = report.map(|r| r.warnings).unwrap_or_default();
                Err(format!(
                    "Failed to save tree: {}; skipped: {}",
                    source,
                    warnings.join("; ")
                ))
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn duplicates(&self) -> Result<Value, String> {
        let groups = self.service().duplicates();
        serde_json::to_value(&groups).map_err(|e| e.to_string())
    }

    fn orphans(&self) -> Result<Value, String> {
        let docs = self.documents();
        let orphans = self.service().orphans(&docs);
        serde_json::to_value(&orphans).map_err(|e| e.to_string())
    }
}

fn make_schema(properties: Value, required: Vec<&str>) -> Arc<Map<String, Value>> {
    let mut schema = Map::new();
    schema.insert("type".to_string(), json!("object"));
    schema.insert("properties".to_string(), properties);
    if !required.is_empty() {
        schema.insert(
            "required".to_string(),
            json!(required.iter().map(|s| s.to_string()).collect::<Vec<_>>()),
        );
    }
    Arc::new(schema)
}

/// Tool definitions for MCP
fn get_tools() -> Vec<Tool> {
    vec![
        Tool::new(
            "issuetree_outline",
            "List nodes of the issue tree in depth-first order with their document, \
             title, and depth. Pass focus to list only the scope rooted at that node.",
            make_schema(
                json!({
                    "focus": {
                        "type": "string",
                        "description": "Optional node id to use as the scope root"
                    },
                    "max_depth": {
                        "type": "integer",
                        "description": "Optional maximum depth to include"
                    }
                }),
                vec![],
            ),
        ),
        Tool::new(
            "issuetree_get",
            "Retrieve one node: document, title, parent, path, children, and the ids \
             of other nodes placing the same document.",
            make_schema(
                json!({
                    "id": {
                        "type": "string",
                        "description": "Node id"
                    }
                }),
                vec!["id"],
            ),
        ),
        Tool::new(
            "issuetree_snapshot",
            "Build a size-bounded snapshot of the tree relevant to an instruction. \
             Use it before proposing operations with issuetree_apply.",
            make_schema(
                json!({
                    "instruction": {
                        "type": "string",
                        "description": "What should be reorganized, in plain words"
                    }
                }),
                vec!["instruction"],
            ),
        ),
        Tool::new(
            "issuetree_apply",
            "Apply a batch of structural operations. Each entry is \
             {type: move, sourceId, targetParentId}, \
             {type: attach, sourceId, targetParentId, includeDescendants} or \
             {type: disassociate, nodeId}; a null targetParentId means the root. \
             Invalid entries are skipped with a reason; the rest are saved together.",
            make_schema(
                json!({
                    "operations": {
                        "type": "array",
                        "items": {"type": "object"},
                        "description": "Operations to apply, in order"
                    }
                }),
                vec!["operations"],
            ),
        ),
        Tool::new(
            "issuetree_duplicates",
            "List documents placed at more than one node, largest groups first.",
            make_schema(json!({}), vec![]),
        ),
        Tool::new(
            "issuetree_orphans",
            "List documents in the workspace that no node places.",
            make_schema(json!({}), vec![]),
        ),
    ]
}

fn required_str<'a>(
    arguments: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, rmcp::model::ErrorData> {
    arguments.get(key).and_then(|v| v.as_str()).ok_or_else(|| {
        rmcp::model::ErrorData::invalid_params(format!("Missing required parameter: {}", key), None)
    })
}

#[allow(clippy::manual_async_fn)]
impl ServerHandler for IssueTreeServer {
    fn get_info(&self) -> InitializeResult {
        let capabilities = ServerCapabilities::builder().enable_tools().build();

        InitializeResult {
            protocol_version: rmcp::model::ProtocolVersion::LATEST,
            capabilities,
            server_info: Implementation {
                name: "issuetree".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("Issue Tree".to_string()),
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "issuetree keeps documents in a hierarchy where one document may be placed \
                 at several nodes. Use issuetree_outline or issuetree_snapshot to see the \
                 structure, then issuetree_apply to move, attach, or disassociate nodes."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, rmcp::model::ErrorData>> + Send + '_
    {
        async move {
            Ok(ListToolsResult {
                tools: get_tools(),
                next_cursor: None,
                meta: None,
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> impl std::future::Future<Output = Result<CallToolResult, rmcp::model::ErrorData>> + Send + '_
    {
        async move {
            let name = request.name.as_ref();
            let arguments = request.arguments.unwrap_or_default();

            let result = match name {
                "issuetree_outline" => {
                    let focus = arguments.get("focus").and_then(|v| v.as_str());
                    let max_depth = arguments
                        .get("max_depth")
                        .and_then(|v| v.as_u64())
                        .map(|d| d as usize);
                    self.outline(focus, max_depth)
                }
                "issuetree_get" => self.get(required_str(&arguments, "id")?),
                "issuetree_snapshot" => self.snapshot(required_str(&arguments, "instruction")?),
                "issuetree_apply" => {
                    let payload = arguments.get("operations").cloned().ok_or_else(|| {
                        rmcp::model::ErrorData::invalid_params(
                            "Missing required parameter: operations",
                            None,
                        )
                    })?;
                    self.apply(&payload)
                }
                "issuetree_duplicates" => self.duplicates(),
                "issuetree_orphans" => self.orphans(),
                _ => {
                    return Err(rmcp::model::ErrorData::invalid_params(
                        format!("Unknown tool: {}", name),
                        None,
                    ));
                }
            };

            match result {
                Ok(value) => Ok(CallToolResult {
                    content: vec![Content::text(
                        serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
                    )],
                    is_error: None,
                    meta: None,
                    structured_content: None,
                }),
                Err(e) => Ok(CallToolResult {
                    content: vec![Content::text(e)],
                    is_error: Some(true),
                    meta: None,
                    structured_content: None,
                }),
            }
        }
    }
}

/// Run the MCP server over stdio
pub async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let server = IssueTreeServer::from_cwd()?;
    tracing::info!(root = %server.root.display(), "starting MCP server");

    server
        .serve(rmcp::transport::stdio())
        .await?
        .waiting()
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{TreeStore, init_workspace};
    use crate::types::{IssueNode, IssueTree};
    use std::fs;
    use tempfile::TempDir;

    fn setup_test_workspace() -> (TempDir, IssueTreeServer) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        init_workspace(root, false).unwrap();
        let mut tree = IssueTree::with_roots(vec![
            IssueNode::with_id("auth", "auth.md")
                .with_children(vec![IssueNode::with_id("login", "login.md")]),
            IssueNode::with_id("login-2", "login.md"),
        ]);
        TreeStore::for_workspace(root).save(&mut tree).unwrap();
        fs::write(root.join("auth.md"), "# Authentication\n").unwrap();
        fs::write(root.join("login.md"), "# Login Flow\n").unwrap();
        fs::write(root.join("billing.md"), "# Billing\n").unwrap();

        let server = IssueTreeServer::new(root.to_path_buf());
        (temp_dir, server)
    }

    #[test]
    fn test_get_tools_returns_all_tools() {
        let tools = get_tools();
        assert_eq!(tools.len(), 6);

        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        for expected in [
            "issuetree_outline",
            "issuetree_get",
            "issuetree_snapshot",
            "issuetree_apply",
            "issuetree_duplicates",
            "issuetree_orphans",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_outline_lists_all_nodes_with_titles() {
        let (_temp_dir, server) = setup_test_workspace();
        let value = server.outline(None, None).unwrap();
        assert_eq!(value["totalNodes"], 3);
        let nodes = value["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0]["title"], "Authentication");
        assert_eq!(nodes[1]["depth"], 1);

        let shallow = server.outline(None, Some(0)).unwrap();
        assert_eq!(shallow["nodes"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_outline_focus_scope() {
        let (_temp_dir, server) = setup_test_workspace();
        let value = server.outline(Some("auth"), None).unwrap();
        let nodes = value["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1]["view"]["focusRootId"], "auth");
        assert_eq!(nodes[1]["id"], "login");

        assert!(server.outline(Some("missing"), None).is_err());
    }

    #[test]
    fn test_get_node_reports_other_placements() {
        let (_temp_dir, server) = setup_test_workspace();
        let value = server.get("login").unwrap();
        assert_eq!(value["parentId"], "auth");
        assert_eq!(value["path"], "auth.md / login.md");
        assert_eq!(value["otherPlacements"], json!(["login-2"]));
    }

    #[test]
    fn test_get_nonexistent_node() {
        let (_temp_dir, server) = setup_test_workspace();
        let result = server.get("does-not-exist");
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("Node not found"));
    }

    #[test]
    fn test_snapshot_uses_document_titles() {
        let (_temp_dir, server) = setup_test_workspace();
        let value = server.snapshot("clean up the login flow").unwrap();
        assert_eq!(value["meta"]["totalNodes"], 3);
        let nodes = value["nodes"].as_array().unwrap();
        assert!(nodes.iter().any(|n| n["displayTitle"] == "Login Flow"));
        assert_eq!(value["duplicatesByDocument"][0]["documentRef"], "login.md");
    }

    #[test]
    fn test_apply_reports_skips_and_saves() {
        let (temp_dir, server) = setup_test_workspace();
        let value = server
            .apply(&json!([
                {"type": "disassociate", "nodeId": "login-2"},
                {"type": "move", "sourceId": "auth", "targetParentId": "login"},
                {"type": "nonsense"}
            ]))
            .unwrap();
        assert_eq!(value["applied"], 1);
        assert_eq!(value["skipped"], 1);
        assert!(
            value["warnings"][0]
                .as_str()
                .unwrap()
                .contains("self or descendant")
        );

        let tree = TreeStore::for_workspace(temp_dir.path()).load_or_default();
        assert_eq!(tree.node_count(), 2);
    }

    #[test]
    fn test_apply_empty_batch_is_informational() {
        let (_temp_dir, server) = setup_test_workspace();
        let value = server.apply(&json!({"operations": []})).unwrap();
        assert_eq!(value["summary"], "nothing to apply");
    }

    #[test]
    fn test_duplicates_and_orphans() {
        let (_temp_dir, server) = setup_test_workspace();
        let dups = server.duplicates().unwrap();
        assert_eq!(dups[0]["documentRef"], "login.md");
        assert_eq!(dups[0]["nodeIds"], json!(["login", "login-2"]));

        let orphans = server.orphans().unwrap();
        assert_eq!(orphans, json!([{"ref": "billing.md", "title": "Billing"}]));
    }
}
