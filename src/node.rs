//! History node and edge model
//!
//! A node records one state-transition event: the tree fingerprint it
//! consumed, the fingerprint it produced, and who/when/why. Nodes are
//! identified by the hash of the Git commit object that stores them and are
//! append-only in authoritative storage.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Canonical hash of the empty Git tree.
pub const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// Sentinel accepted interchangeably with [`EMPTY_TREE`] to mean "no parent".
pub const GENESIS: &str = "genesis";

/// Current version of the `metadata.json` document format.
pub const META_VERSION: u32 = 1;

/// Kind of history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// A deliberate, planned transition.
    Plan,
    /// Observed drift: unrecorded changes captured after the fact.
    Capture,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Plan => "plan",
            NodeKind::Capture => "capture",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(NodeKind::Plan),
            "capture" => Some(NodeKind::Capture),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generator identity embedded in node metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generator {
    pub id: String,
}

/// The `metadata.json` document stored inside every node commit.
///
/// `input_tree` and `output_tree` live here (not in the commit header)
/// because the commit's own tree is the synthetic document tree, not the
/// workspace snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub meta_version: u32,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub summary: String,
    pub owner_id: String,
    /// RFC 3339 UTC with nanosecond precision; lexicographic order equals
    /// chronological order.
    pub timestamp: String,
    pub input_tree: String,
    pub output_tree: String,
    pub generator: Generator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration_info: Option<serde_json::Value>,
}

impl NodeMetadata {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// One recorded history event.
///
/// `parent` and `children` are views derived during load; they hold commit
/// hashes rather than owning references so the graph stays an arena keyed
/// by `commit_hash`.
#[derive(Debug, Clone)]
pub struct Node {
    /// Hash of the Git commit object recording this event. Unique.
    pub commit_hash: String,
    /// Tree fingerprint consumed by the event.
    pub input_tree: String,
    /// Tree fingerprint produced by the event.
    pub output_tree: String,
    pub kind: NodeKind,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    /// Opaque body (typically the plan document). Loaded lazily; `None`
    /// means "not loaded yet", not "empty".
    pub content: Option<String>,
    pub owner_id: String,
    pub parent_hint: Option<String>,
    /// Commit hash of the parent node, if any.
    pub parent: Option<String>,
    /// Commit hashes of child nodes.
    pub children: Vec<String>,
}

impl Node {
    /// Reconstruct a node from its metadata document.
    pub fn from_metadata(commit_hash: String, meta: &NodeMetadata) -> Option<Self> {
        let timestamp = DateTime::parse_from_rfc3339(&meta.timestamp)
            .ok()?
            .with_timezone(&Utc);
        Some(Node {
            commit_hash,
            input_tree: meta.input_tree.clone(),
            output_tree: meta.output_tree.clone(),
            kind: meta.kind,
            timestamp,
            summary: meta.summary.clone(),
            content: None,
            owner_id: meta.owner_id.clone(),
            parent_hint: meta.parent_hint.clone(),
            parent: None,
            children: Vec::new(),
        })
    }

    /// True when this node's input is the no-parent sentinel.
    pub fn is_root(&self) -> bool {
        is_genesis(&self.input_tree)
    }
}

/// Directed edge `child -> parent` between node commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub child_hash: String,
    pub parent_hash: String,
}

/// True for either spelling of "no parent".
pub fn is_genesis(tree: &str) -> bool {
    tree == GENESIS || tree == EMPTY_TREE
}

/// Format a timestamp the way every persisted surface stores it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Derive an owner ID from an email address.
///
/// Lowercase; `@` becomes `-at-`; `.` becomes `-dot-`; everything outside
/// `[a-z0-9-]` is stripped. Empty input yields the empty string.
pub fn normalize_owner_id(email: &str) -> String {
    let mut out = String::with_capacity(email.len() + 8);
    for ch in email.to_lowercase().chars() {
        match ch {
            '@' => out.push_str("-at-"),
            '.' => out.push_str("-dot-"),
            'a'..='z' | '0'..='9' | '-' => out.push(ch),
            _ => {}
        }
    }
    out
}

/// Sort nodes the way every reader presents them: newest first, ties broken
/// by commit hash so pagination is stable.
pub fn sort_for_listing(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.commit_hash.cmp(&b.commit_hash))
    });
}
