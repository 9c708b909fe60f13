//! File-based storage for the issue tree, workspace config, and documents.

use crate::types::{DocumentInfo, IssueTree};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

pub const WORKSPACE_DIR: &str = ".issuetree";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_TREE_FILE: &str = "tree.json";

/// Environment override for the planner endpoint.
pub const PLANNER_URL_ENV: &str = "ISSUETREE_PLANNER_URL";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Not in an issuetree workspace")]
    NotInWorkspace,
    #[error("{0}")]
    AlreadyExists(String),
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_tree_file() -> String {
    DEFAULT_TREE_FILE.to_string()
}

fn default_documents_dir() -> String {
    ".".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_byte_budget() -> usize {
    48_000
}

/// Planner section of config.yaml.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PlannerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Snapshot section of config.yaml.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            byte_budget: default_byte_budget(),
        }
    }
}

/// Workspace configuration read from config.yaml.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_version")]
    pub version: String,
    /// Tree file, relative to the workspace directory.
    #[serde(default = "default_tree_file")]
    pub tree_file: String,
    /// Document root, relative to the workspace root.
    #[serde(default = "default_documents_dir")]
    pub documents_dir: String,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig {
            version: default_version(),
            tree_file: default_tree_file(),
            documents_dir: default_documents_dir(),
            planner: PlannerConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl WorkspaceConfig {
    pub fn tree_path(&self, root: &Path) -> PathBuf {
        root.join(WORKSPACE_DIR).join(&self.tree_file)
    }

    pub fn documents_path(&self, root: &Path) -> PathBuf {
        root.join(&self.documents_dir)
    }

    /// Planner endpoint, with the environment taking precedence.
    pub fn planner_endpoint(&self) -> Option<String> {
        std::env::var(PLANNER_URL_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.planner.endpoint.clone())
    }
}

/// Read config.yaml from a workspace root. Missing or malformed files yield defaults.
pub fn load_config(root: &Path) -> WorkspaceConfig {
    let config_path = root.join(WORKSPACE_DIR).join(CONFIG_FILE);
    match fs::read_to_string(&config_path) {
        Ok(content) => serde_yaml::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!(path = %config_path.display(), error = %e, "invalid config, using defaults");
            WorkspaceConfig::default()
        }),
        Err(_) => WorkspaceConfig::default(),
    }
}

/// Write config.yaml with default values, replacing any existing file.
pub fn write_default_config(root: &Path) -> Result<PathBuf, StorageError> {
    let config_path = root.join(WORKSPACE_DIR).join(CONFIG_FILE);
    let mut content = String::from("# issuetree configuration\n");
    content.push_str(&serde_yaml::to_string(&WorkspaceConfig::default())?);
    fs::write(&config_path, content)?;
    Ok(config_path)
}

/// Find the workspace root by searching upward for the .issuetree directory.
pub fn find_workspace_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        if current.join(WORKSPACE_DIR).is_dir() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

/// Initialize a new workspace in the given directory.
pub fn init_workspace(root: &Path, force: bool) -> Result<Vec<PathBuf>, StorageError> {
    let workspace_dir = root.join(WORKSPACE_DIR);

    if workspace_dir.exists() && !force {
        return Err(StorageError::AlreadyExists(
            "Workspace already initialized. Use --force to overwrite.".to_string(),
        ));
    }
    if workspace_dir.exists() && force {
        fs::remove_dir_all(&workspace_dir)?;
    }

    fs::create_dir_all(&workspace_dir)?;
    let mut created = vec![workspace_dir.clone()];

    let config = WorkspaceConfig::default();
    created.push(write_default_config(root)?);

    let mut store = TreeStore::new(config.tree_path(root));
    store.save(&mut IssueTree::empty())?;
    created.push(store.path().to_path_buf());

    Ok(created)
}

/// Result of reading the tree file.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(IssueTree),
    Missing,
    /// The file exists but could not be parsed.
    Corrupted { raw: Vec<u8>, reason: String },
}

impl LoadOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }
}

#[derive(Debug, Clone)]
struct CachedTree {
    modified: SystemTime,
    tree: IssueTree,
}

/// Loads and persists one tree file, caching the last parse by mtime.
#[derive(Debug)]
pub struct TreeStore {
    path: PathBuf,
    cache: Option<CachedTree>,
}

impl TreeStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TreeStore {
            path: path.into(),
            cache: None,
        }
    }

    /// Store for the workspace at `root`, honoring its config.
    pub fn for_workspace(root: &Path) -> Self {
        Self::new(load_config(root).tree_path(root))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    /// Read the tree file, reusing the cached parse when the mtime is unchanged.
    pub fn load(&mut self) -> Result<LoadOutcome, StorageError> {
        let modified = match fs::metadata(&self.path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cache = None;
                return Ok(LoadOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(cached) = &self.cache
            && cached.modified == modified
        {
            tracing::debug!(path = %self.path.display(), "tree cache hit");
            return Ok(LoadOutcome::Loaded(cached.tree.clone()));
        }

        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.cache = None;
                return Ok(LoadOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<IssueTree>(&raw) {
            Ok(tree) => {
                self.cache = Some(CachedTree {
                    modified,
                    tree: tree.clone(),
                });
                Ok(LoadOutcome::Loaded(tree))
            }
            Err(e) => {
                self.cache = None;
                Ok(LoadOutcome::Corrupted {
                    raw,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Load, degrading to an empty tree when the file is missing or unreadable.
    pub fn load_or_default(&mut self) -> IssueTree {
        match self.load() {
            Ok(LoadOutcome::Loaded(tree)) => tree,
            Ok(LoadOutcome::Missing) => IssueTree::empty(),
            Ok(LoadOutcome::Corrupted { raw, reason }) => {
                tracing::warn!(
                    path = %self.path.display(),
                    bytes = raw.len(),
                    %reason,
                    "tree file is corrupted, starting from an empty tree"
                );
                IssueTree::empty()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "tree file unreadable, starting from an empty tree");
                IssueTree::empty()
            }
        }
    }

    /// Stamp `last_modified` and rewrite the whole file.
    pub fn save(&mut self, tree: &mut IssueTree) -> Result<(), StorageError> {
        tree.last_modified = chrono::Utc::now().to_rfc3339();
        let content = serde_json::to_vec_pretty(tree)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&content)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        let modified = fs::metadata(&self.path)?.modified()?;
        self.cache = Some(CachedTree {
            modified,
            tree: tree.clone(),
        });
        tracing::info!(path = %self.path.display(), nodes = tree.node_count(), "tree saved");
        Ok(())
    }
}

/// Source of the documents that nodes point at.
pub trait DocumentStore {
    fn list_documents(&self) -> Result<Vec<DocumentInfo>, StorageError>;

    fn read_title(&self, doc_ref: &str) -> Option<String>;
}

/// Markdown files under a directory; refs are `/`-separated relative paths.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsDocumentStore { root: root.into() }
    }

    pub fn for_workspace(root: &Path) -> Self {
        Self::new(load_config(root).documents_path(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, doc_ref: &str) -> PathBuf {
        self.root.join(doc_ref)
    }

    pub fn exists(&self, doc_ref: &str) -> bool {
        self.resolve(doc_ref).is_file()
    }

    /// Write a stub document with a heading unless it already exists.
    pub fn create_document(&self, doc_ref: &str, title: &str) -> Result<PathBuf, StorageError> {
        let path = self.resolve(doc_ref);
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("# {}\n", title))?;
        Ok(path)
    }

    fn to_ref(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(parts.join("/"))
    }
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

/// First `# ` heading, if any.
pub fn heading_title(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Fallback title derived from the file name.
pub fn stem_title(doc_ref: &str) -> String {
    Path::new(doc_ref)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| doc_ref.to_string())
}

impl DocumentStore for FsDocumentStore {
    fn list_documents(&self) -> Result<Vec<DocumentInfo>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut docs = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|ext| ext == "md").unwrap_or(false))
        {
            let Some(doc_ref) = self.to_ref(entry.path()) else {
                continue;
            };
            let title = fs::read_to_string(entry.path())
                .ok()
                .and_then(|c| heading_title(&c))
                .unwrap_or_else(|| stem_title(&doc_ref));
            docs.push(DocumentInfo { doc_ref, title });
        }
        docs.sort_by(|a, b| a.doc_ref.cmp(&b.doc_ref));
        Ok(docs)
    }

    fn read_title(&self, doc_ref: &str) -> Option<String> {
        fs::read_to_string(self.resolve(doc_ref))
            .ok()
            .and_then(|c| heading_title(&c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueNode, NodeId};
    use filetime::FileTime;
    use tempfile::TempDir;

    fn sample_tree() -> IssueTree {
        IssueTree::with_roots(vec![
            IssueNode::with_id("a", "a.md")
                .with_children(vec![IssueNode::with_id("b", "sub/b.md")]),
        ])
    }

    #[test]
    fn test_init_workspace_creates_structure() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let created = init_workspace(root, false).unwrap();

        assert!(root.join(WORKSPACE_DIR).join(CONFIG_FILE).exists());
        assert!(root.join(WORKSPACE_DIR).join(DEFAULT_TREE_FILE).exists());
        assert_eq!(created.len(), 3);

        let mut store = TreeStore::for_workspace(root);
        let outcome = store.load().unwrap();
        match outcome {
            LoadOutcome::Loaded(tree) => assert!(tree.is_empty()),
            other => panic!("expected loaded tree, got {:?}", other),
        }
    }

    #[test]
    fn test_init_workspace_fails_if_exists() {
        let temp_dir = TempDir::new().unwrap();
        init_workspace(temp_dir.path(), false).unwrap();
        let result = init_workspace(temp_dir.path(), false);
        assert!(result.unwrap_err().to_string().contains("already initialized"));
    }

    #[test]
    fn test_init_workspace_force_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        init_workspace(root, false).unwrap();

        let marker = root.join(WORKSPACE_DIR).join("marker.txt");
        fs::write(&marker, "test").unwrap();

        init_workspace(root, true).unwrap();
        assert!(!marker.exists());
    }

    #[test]
    fn test_find_workspace_root_finds_parent() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        init_workspace(root, false).unwrap();

        let nested = root.join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_workspace_root(&nested).unwrap(), root);
    }

    #[test]
    fn test_find_workspace_root_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        assert!(find_workspace_root(temp_dir.path()).is_none());
    }

    #[test]
    fn test_load_config_defaults_and_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert_eq!(load_config(root).tree_file, DEFAULT_TREE_FILE);

        fs::create_dir_all(root.join(WORKSPACE_DIR)).unwrap();
        fs::write(
            root.join(WORKSPACE_DIR).join(CONFIG_FILE),
            "tree_file: issues.json\nplanner:\n  endpoint: http://localhost:9000/plan\n",
        )
        .unwrap();
        let config = load_config(root);
        assert_eq!(config.tree_file, "issues.json");
        assert_eq!(config.planner.timeout_secs, 120);
        assert_eq!(config.snapshot.byte_budget, 48_000);
        assert_eq!(
            config.planner.endpoint.as_deref(),
            Some("http://localhost:9000/plan")
        );
    }

    #[test]
    fn test_load_config_malformed_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join(WORKSPACE_DIR)).unwrap();
        fs::write(root.join(WORKSPACE_DIR).join(CONFIG_FILE), "tree_file: [{{").unwrap();
        assert_eq!(load_config(root).tree_file, DEFAULT_TREE_FILE);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut store = TreeStore::new(dir.path().join("tree.json"));

        let mut tree = sample_tree();
        tree.last_modified = "2000-01-01T00:00:00Z".to_string();
        store.save(&mut tree).unwrap();
        assert_ne!(tree.last_modified, "2000-01-01T00:00:00Z");

        let mut fresh = TreeStore::new(store.path());
        match fresh.load().unwrap() {
            LoadOutcome::Loaded(loaded) => assert!(loaded.same_structure(&tree)),
            other => panic!("expected loaded tree, got {:?}", other),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let mut store = TreeStore::new(dir.path().join("nope.json"));
        assert!(matches!(store.load().unwrap(), LoadOutcome::Missing));
        assert!(store.load_or_default().is_empty());
    }

    #[test]
    fn test_load_corrupted_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        fs::write(&path, "{\"formatVersion\": \"1.0\", \"rootN").unwrap();

        let mut store = TreeStore::new(&path);
        match store.load().unwrap() {
            LoadOutcome::Corrupted { raw, reason } => {
                assert!(!raw.is_empty());
                assert!(!reason.is_empty());
            }
            other => panic!("expected corrupted, got {:?}", other),
        }
        assert!(store.load_or_default().is_empty());
    }

    #[test]
    fn test_load_uses_cache_when_mtime_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        let mut store = TreeStore::new(&path);
        store.save(&mut sample_tree()).unwrap();

        let before = FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());

        // Replace the content but restore the old mtime: the cache must win.
        fs::write(&path, "garbage").unwrap();
        filetime::set_file_mtime(&path, before).unwrap();

        match store.load().unwrap() {
            LoadOutcome::Loaded(tree) => assert_eq!(tree.node_count(), 2),
            other => panic!("expected cached tree, got {:?}", other),
        }

        // A different mtime forces a re-read.
        filetime::set_file_mtime(&path, FileTime::from_unix_time(before.unix_seconds() + 10, 0))
            .unwrap();
        assert!(matches!(store.load().unwrap(), LoadOutcome::Corrupted { .. }));
    }

    #[test]
    fn test_independent_stores_do_not_share_cache() {
        let dir = TempDir::new().unwrap();
        let mut first = TreeStore::new(dir.path().join("one.json"));
        let mut second = TreeStore::new(dir.path().join("two.json"));

        first.save(&mut sample_tree()).unwrap();
        second.save(&mut IssueTree::empty()).unwrap();

        assert_eq!(first.load_or_default().node_count(), 2);
        assert_eq!(second.load_or_default().node_count(), 0);
    }

    #[test]
    fn test_saved_file_has_wire_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.json");
        let mut store = TreeStore::new(&path);
        store.save(&mut sample_tree()).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["formatVersion"], "1.0");
        assert!(value["lastModified"].is_string());
        assert_eq!(value["rootNodes"][0]["id"], "a");
        assert_eq!(value["rootNodes"][0]["children"][0]["documentRef"], "sub/b.md");
    }

    #[test]
    fn test_document_store_lists_markdown() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join(".hidden")).unwrap();
        fs::write(root.join("a.md"), "# Alpha issue\n\nbody").unwrap();
        fs::write(root.join("sub").join("b.md"), "no heading").unwrap();
        fs::write(root.join(".hidden").join("c.md"), "# Hidden").unwrap();
        fs::write(root.join("notes.txt"), "# Not markdown").unwrap();

        let store = FsDocumentStore::new(root);
        let docs = store.list_documents().unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].doc_ref, "a.md");
        assert_eq!(docs[0].title, "Alpha issue");
        assert_eq!(docs[1].doc_ref, "sub/b.md");
        assert_eq!(docs[1].title, "b");

        assert_eq!(store.read_title("a.md").as_deref(), Some("Alpha issue"));
        assert!(store.read_title("missing.md").is_none());
    }

    #[test]
    fn test_create_document_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FsDocumentStore::new(dir.path());
        let path = store.create_document("x/new.md", "New thing").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# New thing\n");

        store.create_document("x/new.md", "Other").unwrap();
        assert_eq!(store.read_title("x/new.md").as_deref(), Some("New thing"));
        assert!(store.exists("x/new.md"));
    }

    #[test]
    fn test_heading_title() {
        assert_eq!(heading_title("intro\n# Title \n").as_deref(), Some("Title"));
        assert_eq!(heading_title("## Sub only"), None);
        assert_eq!(stem_title("dir/file.md"), "file");
    }

    #[test]
    fn test_ids_stable_across_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut store = TreeStore::new(dir.path().join("t.json"));
        store.save(&mut sample_tree()).unwrap();
        let tree = store.load_or_default();
        assert_eq!(tree.root_nodes[0].id, NodeId::from("a"));
    }
}
