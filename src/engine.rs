//! Engine state machine
//!
//! Orchestrates alignment, drift capture, plan-node creation, checkout and
//! visit-history navigation over one workspace. The persisted write order
//! everywhere is: git objects, commit, refs, cache row, HEAD file, nav-log
//! append - a crash between any two steps leaves the DAG consistent and at
//! worst a lagging cache that `hydrate` restores.

use std::path::Path;

use crate::config::{Config, ConfigError, StorageBackend};
use crate::gitdb::{GitDb, GitError, Signature};
use crate::hydrator::{hydrate, HydrationReport};
use crate::navlog::NavLog;
use crate::node::{is_genesis, normalize_owner_id, Node, NodeKind};
use crate::store::{
    GitObjectStore, HistoryReader, HistoryWriter, NewNode, SqliteCacheStore, Storage, StoreError,
};
use crate::workspace::{Workspace, WorkspaceError};

/// Relation between the working tree, HEAD, and known history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Working tree equals HEAD's output tree, and HEAD is a known node.
    Clean,
    /// Working tree differs from HEAD but matches some known node.
    Dirty,
    /// Working tree matches no known node.
    Orphan,
}

impl std::fmt::Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Alignment::Clean => "CLEAN",
            Alignment::Dirty => "DIRTY",
            Alignment::Orphan => "ORPHAN",
        };
        f.write_str(s)
    }
}

/// Error type for engine operations
#[derive(Debug)]
pub enum EngineError {
    Git(GitError),
    Store(StoreError),
    Config(ConfigError),
    Workspace(WorkspaceError),
    Io(std::io::Error),
    /// Checkout refused: the working tree holds uncaptured drift.
    DirtyTree(String),
    /// A plan's input tree is neither HEAD, a known output tree, nor the
    /// genesis sentinel.
    UnknownInputTree(String),
    /// An external executor declined a confirmation prompt. Never raised by
    /// the engine itself.
    Cancelled,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Git(e) => write!(f, "{}", e),
            EngineError::Store(e) => write!(f, "{}", e),
            EngineError::Config(e) => write!(f, "{}", e),
            EngineError::Workspace(e) => write!(f, "{}", e),
            EngineError::Io(e) => write!(f, "IO error: {}", e),
            EngineError::DirtyTree(msg) => write!(
                f,
                "working tree has uncaptured changes ({}); capture the drift or force",
                msg
            ),
            EngineError::UnknownInputTree(tree) => {
                write!(f, "input tree {} is not HEAD or any known state", tree)
            }
            EngineError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<GitError> for EngineError {
    fn from(e: GitError) -> Self {
        EngineError::Git(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e)
    }
}

impl From<WorkspaceError> for EngineError {
    fn from(e: WorkspaceError) -> Self {
        EngineError::Workspace(e)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// One history engine bound to one workspace. Single-process by design;
/// concurrent writers on the same repository are out of scope.
pub struct Engine {
    workspace: Workspace,
    git: GitDb,
    storage: Storage,
    navlog: NavLog,
    config: Config,
}

impl Engine {
    /// Discover the enclosing repository upward from `root`, load the
    /// configuration, and select the storage backend. An unknown
    /// `storage.type` is fatal here.
    pub fn open(root: &Path) -> Result<Self> {
        let workspace = Workspace::discover(root)?;
        // The private index lives in the state dir, so it must exist before
        // any plumbing runs.
        workspace.ensure_state_dir()?;
        let config = Config::load(&workspace.config_path())?;
        let backend = config.storage_backend()?;

        let git = GitDb::new(workspace.root(), workspace.index_path());
        let email = git
            .config_value("user.email")?
            .unwrap_or_else(|| "quipu@localhost".to_string());
        let name = git
            .config_value("user.name")?
            .unwrap_or_else(|| "quipu".to_string());
        let owner_id = config
            .sync
            .user_id
            .clone()
            .unwrap_or_else(|| normalize_owner_id(&email));

        let inner = GitObjectStore::new(git.clone(), owner_id, Signature { name, email });
        let storage = match backend {
            StorageBackend::GitObject => Storage::GitObject(inner),
            StorageBackend::Sqlite => {
                Storage::SqliteCache(SqliteCacheStore::open(&workspace.cache_path(), inner)?)
            }
        };

        let navlog = NavLog::load(&workspace.navlog_path())?;
        Ok(Engine {
            workspace,
            git,
            storage,
            navlog,
            config,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read handle implementing the history contract.
    pub fn reader(&self) -> &dyn HistoryReader {
        self.storage.reader()
    }

    /// Write handle implementing the history contract.
    pub fn writer(&mut self) -> &mut dyn HistoryWriter {
        self.storage.writer()
    }

    /// Fingerprint of the working tree right now.
    pub fn current_tree(&self) -> Result<String> {
        Ok(self.git.get_tree_hash()?)
    }

    /// The engine's recorded HEAD fingerprint.
    pub fn head(&self) -> Result<Option<String>> {
        Ok(self.workspace.read_head()?)
    }

    // ========================================================================
    // State machine
    // ========================================================================

    /// Compare the current tree hash to HEAD and to storage. No writes.
    pub fn align(&self) -> Result<Alignment> {
        let tree = self.current_tree()?;
        let known = self.storage.get_node_position(&tree)?.is_some();
        if !known {
            return Ok(Alignment::Orphan);
        }
        if self.head()?.as_deref() == Some(tree.as_str()) {
            Ok(Alignment::Clean)
        } else {
            Ok(Alignment::Dirty)
        }
    }

    /// Record observed drift as a `capture` node whose input is HEAD and
    /// whose output is `output_tree`, then move HEAD onto it.
    pub fn capture_drift(&mut self, output_tree: &str, message: Option<&str>) -> Result<Node> {
        let input = self
            .head()?
            .unwrap_or_else(|| crate::node::GENESIS.to_string());
        let summary = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("capture drift to {}", short(output_tree)));
        let node = self.storage.create_node(
            NodeKind::Capture,
            &input,
            output_tree,
            &summary,
            &summary,
        )?;
        self.commit_position(output_tree)?;
        Ok(node)
    }

    /// Record a deliberate transition as a `plan` node. `input_tree` must be
    /// HEAD, a known node's output tree, or the genesis sentinel; an
    /// idempotent plan (input == output) is a legal event.
    pub fn create_plan_node(
        &mut self,
        input_tree: &str,
        output_tree: &str,
        content: &str,
        summary: Option<&str>,
    ) -> Result<Node> {
        let input_ok = is_genesis(input_tree)
            || self.head()?.as_deref() == Some(input_tree)
            || self.storage.get_node_position(input_tree)?.is_some();
        if !input_ok {
            return Err(EngineError::UnknownInputTree(input_tree.to_string()));
        }

        let summary = summary
            .map(str::to_string)
            .unwrap_or_else(|| default_summary(content));
        let node = self.storage.create_node_full(NewNode::new(
            NodeKind::Plan,
            input_tree,
            output_tree,
            content,
            &summary,
        ))?;
        self.commit_position(output_tree)?;
        Ok(node)
    }

    /// Materialize a recorded state into the working directory. Without
    /// `force`, uncaptured drift (a non-CLEAN alignment) refuses the
    /// checkout.
    pub fn checkout(&mut self, tree_hash: &str, force: bool) -> Result<()> {
        if !force {
            let alignment = self.align()?;
            if alignment != Alignment::Clean {
                return Err(EngineError::DirtyTree(alignment.to_string()));
            }
        }
        self.materialize(tree_hash)?;
        self.append_navlog(tree_hash)?;
        Ok(())
    }

    /// Like checkout, but always proceeds; drives the navigation journal.
    pub fn visit(&mut self, tree_hash: &str) -> Result<()> {
        self.materialize(tree_hash)?;
        self.append_navlog(tree_hash)?;
        Ok(())
    }

    /// Step back in the visit history. Returns the fingerprint now current,
    /// or `None` at the boundary. The cursor only moves after the checkout
    /// succeeded.
    pub fn back(&mut self) -> Result<Option<String>> {
        let Some(target) = self.navlog.peek_back().map(str::to_string) else {
            return Ok(None);
        };
        self.materialize(&target)?;
        self.navlog.back();
        self.navlog.save(&self.workspace.navlog_path())?;
        Ok(Some(target))
    }

    /// Step forward in the visit history. Returns the fingerprint now
    /// current, or `None` at the boundary.
    pub fn forward(&mut self) -> Result<Option<String>> {
        let Some(target) = self.navlog.peek_forward().map(str::to_string) else {
            return Ok(None);
        };
        self.materialize(&target)?;
        self.navlog.forward();
        self.navlog.save(&self.workspace.navlog_path())?;
        Ok(Some(target))
    }

    /// Rebuild the relational cache from the authoritative refs. A no-op
    /// report under the pure git backend.
    pub fn hydrate(&mut self) -> Result<HydrationReport> {
        match &self.storage {
            Storage::SqliteCache(cache) => Ok(hydrate(&self.git, cache)?),
            Storage::GitObject(_) => Ok(HydrationReport::default()),
        }
    }

    // ========================================================================
    // Remote sync
    // ========================================================================

    /// Publish local head refs under this owner's namespace on the
    /// configured remote.
    pub fn push_refs(&self) -> Result<()> {
        let owner = match &self.storage {
            Storage::GitObject(s) => s.owner_id().to_string(),
            Storage::SqliteCache(s) => s.inner().owner_id().to_string(),
        };
        crate::sync::push_refs(&self.git, &self.config.sync.remote_name, &owner)?;
        Ok(())
    }

    /// Fetch every subscribed owner's namespace from the configured remote.
    pub fn fetch_refs(&self) -> Result<()> {
        crate::sync::fetch_refs(
            &self.git,
            &self.config.sync.remote_name,
            &self.config.sync.subscriptions,
        )?;
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Checkout relative to HEAD so unchanged files keep their mtimes, then
    /// advance HEAD.
    fn materialize(&mut self, tree_hash: &str) -> Result<()> {
        let old = self.head()?;
        self.git.checkout_tree(tree_hash, old.as_deref())?;
        self.workspace.write_head(tree_hash)?;
        Ok(())
    }

    /// HEAD then nav-log, strictly after the storage write.
    fn commit_position(&mut self, output_tree: &str) -> Result<()> {
        self.workspace.write_head(output_tree)?;
        self.append_navlog(output_tree)?;
        Ok(())
    }

    fn append_navlog(&mut self, tree_hash: &str) -> Result<()> {
        self.navlog.visit(tree_hash);
        self.navlog.save(&self.workspace.navlog_path())?;
        Ok(())
    }
}

fn short(hash: &str) -> &str {
    if hash.len() >= 8 {
        &hash[..8]
    } else {
        hash
    }
}

/// First non-empty line of the plan document, clipped.
fn default_summary(content: &str) -> String {
    let line = content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("plan");
    let line = line.trim_start_matches('#').trim();
    let line = if line.is_empty() { "plan" } else { line };
    line.chars().take(72).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_summary_clips_first_line() {
        assert_eq!(default_summary("# Title\n\nbody"), "Title");
        assert_eq!(default_summary("\n\nplain line\nmore"), "plain line");
        assert_eq!(default_summary(""), "plan");
        let long = "x".repeat(100);
        assert_eq!(default_summary(&long).len(), 72);
    }

    #[test]
    fn test_alignment_display() {
        assert_eq!(Alignment::Clean.to_string(), "CLEAN");
        assert_eq!(Alignment::Dirty.to_string(), "DIRTY");
        assert_eq!(Alignment::Orphan.to_string(), "ORPHAN");
    }
}
