//! History storage backends
//!
//! Two implementations of the reader/writer contract: the git-object
//! backend, whose refs and commits are the source of truth, and a relational
//! cache backend that wraps the git writer and mirrors metadata into
//! indexed tables. Both return semantically identical results, up to cache
//! warmth of the plan document.

use std::collections::{HashMap, HashSet};

use regex::Regex;

use crate::gitdb::GitError;
use crate::node::{Edge, Node, NodeKind};

pub mod git_object;
pub mod sqlite_cache;

pub use git_object::GitObjectStore;
pub use sqlite_cache::SqliteCacheStore;

/// Minimum prefix length accepted by [`HistoryReader::resolve_tree_prefix`].
pub const MIN_PREFIX_LEN: usize = 4;

/// Error type for storage operations
#[derive(Debug)]
pub enum StoreError {
    Git(GitError),
    Cache(diesel::result::Error),
    Pool(String),
    /// The cache disagrees with authoritative storage beyond what a
    /// hydrator run can fix; rebuild it from scratch.
    CacheInconsistency(String),
    /// A node document is malformed; readers skip the node, writers report.
    Parse { commit: String, message: String },
    Regex(regex::Error),
    AmbiguousPrefix { prefix: String, matches: Vec<String> },
    Io(std::io::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Git(e) => write!(f, "git storage error: {}", e),
            StoreError::Cache(e) => write!(f, "cache query error: {}", e),
            StoreError::Pool(msg) => write!(f, "cache connection error: {}", msg),
            StoreError::CacheInconsistency(msg) => write!(f, "cache inconsistency: {}", msg),
            StoreError::Parse { commit, message } => {
                write!(f, "malformed node document in {}: {}", commit, message)
            }
            StoreError::Regex(e) => write!(f, "bad summary pattern: {}", e),
            StoreError::AmbiguousPrefix { prefix, matches } => write!(
                f,
                "prefix '{}' is ambiguous ({} matches)",
                prefix,
                matches.len()
            ),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<GitError> for StoreError {
    fn from(e: GitError) -> Self {
        StoreError::Git(e)
    }
}

impl From<diesel::result::Error> for StoreError {
    fn from(e: diesel::result::Error) -> Self {
        StoreError::Cache(e)
    }
}

impl From<regex::Error> for StoreError {
    fn from(e: regex::Error) -> Self {
        StoreError::Regex(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything needed to write one node.
#[derive(Debug, Clone)]
pub struct NewNode<'a> {
    pub kind: NodeKind,
    pub input_tree: &'a str,
    pub output_tree: &'a str,
    pub content: &'a str,
    pub summary: &'a str,
    pub parent_hint: Option<&'a str>,
    pub migration_info: Option<serde_json::Value>,
}

impl<'a> NewNode<'a> {
    pub fn new(
        kind: NodeKind,
        input_tree: &'a str,
        output_tree: &'a str,
        content: &'a str,
        summary: &'a str,
    ) -> Self {
        NewNode {
            kind,
            input_tree,
            output_tree,
            content,
            summary,
            parent_hint: None,
            migration_info: None,
        }
    }
}

/// Read side of the history contract.
pub trait HistoryReader {
    /// Load every node with parent/child links attached. Content is left
    /// cold; use [`HistoryReader::get_node_content`].
    fn load_all_nodes(&self) -> Result<Vec<Node>>;

    /// Look up one node by commit hash (links attached).
    fn get_node(&self, commit_hash: &str) -> Result<Option<Node>>;

    /// Load the node's plan document.
    fn get_node_content(&self, node: &Node) -> Result<String>;

    /// Filter nodes by summary pattern and kind, newest first.
    fn find_nodes(
        &self,
        summary_regex: Option<&str>,
        kind: Option<NodeKind>,
        limit: usize,
    ) -> Result<Vec<Node>>;

    fn get_node_count(&self) -> Result<usize>;

    /// Page through nodes ordered by descending timestamp, ties broken by
    /// commit hash.
    fn load_nodes_paginated(&self, limit: usize, offset: usize) -> Result<Vec<Node>>;

    /// Output trees of every ancestor of the node(s) producing `tree`.
    fn get_ancestor_output_trees(&self, tree: &str) -> Result<Vec<String>>;

    /// Output trees of every descendant of the node(s) producing `tree`.
    fn get_descendant_output_trees(&self, tree: &str) -> Result<Vec<String>>;

    /// Index of the newest node producing `tree` in listing order, `None`
    /// when no node produces it.
    fn get_node_position(&self, tree: &str) -> Result<Option<usize>>;

    /// Resolve a short hash (>= [`MIN_PREFIX_LEN`] chars) against output
    /// trees and commit hashes. Returns the matching output tree, `None`
    /// when nothing matches, or `AmbiguousPrefix` on multiple hits.
    fn resolve_tree_prefix(&self, prefix: &str) -> Result<Option<String>>;
}

/// Write side of the history contract. Nodes are append-only; idempotent
/// transitions (input == output) are valid events and are never collapsed.
pub trait HistoryWriter {
    fn create_node_full(&mut self, new: NewNode<'_>) -> Result<Node>;

    fn create_node(
        &mut self,
        kind: NodeKind,
        input_tree: &str,
        output_tree: &str,
        content: &str,
        summary: &str,
    ) -> Result<Node> {
        self.create_node_full(NewNode::new(kind, input_tree, output_tree, content, summary))
    }
}

/// The configured backend pair.
pub enum Storage {
    GitObject(GitObjectStore),
    SqliteCache(SqliteCacheStore),
}

impl Storage {
    pub fn reader(&self) -> &dyn HistoryReader {
        match self {
            Storage::GitObject(s) => s,
            Storage::SqliteCache(s) => s,
        }
    }

    pub fn writer(&mut self) -> &mut dyn HistoryWriter {
        match self {
            Storage::GitObject(s) => s,
            Storage::SqliteCache(s) => s,
        }
    }
}

impl HistoryReader for Storage {
    fn load_all_nodes(&self) -> Result<Vec<Node>> {
        self.reader().load_all_nodes()
    }

    fn get_node(&self, commit_hash: &str) -> Result<Option<Node>> {
        self.reader().get_node(commit_hash)
    }

    fn get_node_content(&self, node: &Node) -> Result<String> {
        self.reader().get_node_content(node)
    }

    fn find_nodes(
        &self,
        summary_regex: Option<&str>,
        kind: Option<NodeKind>,
        limit: usize,
    ) -> Result<Vec<Node>> {
        self.reader().find_nodes(summary_regex, kind, limit)
    }

    fn get_node_count(&self) -> Result<usize> {
        self.reader().get_node_count()
    }

    fn load_nodes_paginated(&self, limit: usize, offset: usize) -> Result<Vec<Node>> {
        self.reader().load_nodes_paginated(limit, offset)
    }

    fn get_ancestor_output_trees(&self, tree: &str) -> Result<Vec<String>> {
        self.reader().get_ancestor_output_trees(tree)
    }

    fn get_descendant_output_trees(&self, tree: &str) -> Result<Vec<String>> {
        self.reader().get_descendant_output_trees(tree)
    }

    fn get_node_position(&self, tree: &str) -> Result<Option<usize>> {
        self.reader().get_node_position(tree)
    }

    fn resolve_tree_prefix(&self, prefix: &str) -> Result<Option<String>> {
        self.reader().resolve_tree_prefix(prefix)
    }
}

impl HistoryWriter for Storage {
    fn create_node_full(&mut self, new: NewNode<'_>) -> Result<Node> {
        self.writer().create_node_full(new)
    }
}

// ============================================================================
// Shared graph helpers
// ============================================================================

/// Fill `parent`/`children` from an edge set. Self-loop edges are dropped,
/// edges pointing outside the node set are ignored, and only the first
/// parent edge per child is honored (authoritative storage writes at most
/// one).
pub(crate) fn attach_links(nodes: &mut [Node], edges: &[Edge]) {
    let index: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.commit_hash.clone(), i))
        .collect();
    for node in nodes.iter_mut() {
        node.parent = None;
        node.children.clear();
    }
    for edge in edges {
        if edge.child_hash == edge.parent_hash {
            tracing::warn!(commit = %edge.child_hash, "dropping self-loop edge");
            continue;
        }
        let (Some(&child_idx), Some(&parent_idx)) =
            (index.get(&edge.child_hash), index.get(&edge.parent_hash))
        else {
            continue;
        };
        if nodes[child_idx].parent.is_some() {
            continue;
        }
        nodes[child_idx].parent = Some(edge.parent_hash.clone());
        nodes[parent_idx].children.push(edge.child_hash.clone());
    }
}

fn by_hash(nodes: &[Node]) -> HashMap<&str, &Node> {
    nodes.iter().map(|n| (n.commit_hash.as_str(), n)).collect()
}

/// Nodes producing `tree`, newest first.
fn producers<'a>(nodes: &'a [Node], tree: &str) -> Vec<&'a Node> {
    let mut found: Vec<&Node> = nodes.iter().filter(|n| n.output_tree == tree).collect();
    found.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.commit_hash.cmp(&b.commit_hash))
    });
    found
}

/// Walk parent links upward from every producer of `tree`, collecting
/// ancestor output trees. Cycle-safe via a visited set keyed by commit hash.
pub(crate) fn ancestor_output_trees(nodes: &[Node], tree: &str) -> Vec<String> {
    let index = by_hash(nodes);
    let mut visited: HashSet<&str> = HashSet::new();
    let mut seen_trees: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for start in producers(nodes, tree) {
        let mut current = start;
        visited.insert(current.commit_hash.as_str());
        while let Some(parent_hash) = current.parent.as_deref() {
            let Some(parent) = index.get(parent_hash) else { break };
            if !visited.insert(parent.commit_hash.as_str()) {
                break;
            }
            if parent.output_tree != tree && seen_trees.insert(parent.output_tree.as_str()) {
                out.push(parent.output_tree.clone());
            }
            current = parent;
        }
    }
    out
}

/// Walk child links downward from every producer of `tree`, collecting
/// descendant output trees. Cycle-safe via a visited set.
pub(crate) fn descendant_output_trees(nodes: &[Node], tree: &str) -> Vec<String> {
    let index = by_hash(nodes);
    let mut visited: HashSet<&str> = HashSet::new();
    let mut seen_trees: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    let mut queue: Vec<&Node> = producers(nodes, tree);
    for start in &queue {
        visited.insert(start.commit_hash.as_str());
    }
    while let Some(node) = queue.pop() {
        for child_hash in &node.children {
            let Some(child) = index.get(child_hash.as_str()) else { continue };
            if !visited.insert(child.commit_hash.as_str()) {
                continue;
            }
            if child.output_tree != tree && seen_trees.insert(child.output_tree.as_str()) {
                out.push(child.output_tree.clone());
            }
            queue.push(child);
        }
    }
    out
}

/// Shared `find_nodes` semantics for backends that filter in memory.
pub(crate) fn filter_nodes(
    mut nodes: Vec<Node>,
    summary_regex: Option<&str>,
    kind: Option<NodeKind>,
    limit: usize,
) -> Result<Vec<Node>> {
    let pattern = match summary_regex {
        Some(p) => Some(Regex::new(p)?),
        None => None,
    };
    crate::node::sort_for_listing(&mut nodes);
    let filtered = nodes
        .into_iter()
        .filter(|n| kind.map(|k| n.kind == k).unwrap_or(true))
        .filter(|n| {
            pattern
                .as_ref()
                .map(|p| p.is_match(&n.summary))
                .unwrap_or(true)
        })
        .take(limit)
        .collect();
    Ok(filtered)
}

/// Shared short-hash resolution: a unique output-tree or commit-hash prefix
/// resolves to that node's output tree.
pub(crate) fn resolve_prefix(nodes: &[Node], prefix: &str) -> Result<Option<String>> {
    if prefix.len() < MIN_PREFIX_LEN {
        return Ok(None);
    }
    let mut matches: Vec<String> = Vec::new();
    let mut matched_trees: HashSet<&str> = HashSet::new();
    for node in nodes {
        if node.output_tree.starts_with(prefix) || node.commit_hash.starts_with(prefix) {
            if matched_trees.insert(node.output_tree.as_str()) {
                matches.push(node.output_tree.clone());
            }
        }
    }
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches.remove(0))),
        _ => Err(StoreError::AmbiguousPrefix {
            prefix: prefix.to_string(),
            matches,
        }),
    }
}
