//! Git-object history backend
//!
//! The source of truth. Nodes are commits whose tree is a synthetic document
//! tree (`plan.md` + `metadata.json`); leaves carry refs under
//! `refs/quipu/local/heads/`. Reads walk the refs; writes create commits and
//! advance the head refs so that exactly the leaves keep one.

use chrono::{DateTime, Duration, Utc};

use crate::gitdb::{GitDb, GitError, Signature, TreeEntry};
use crate::node::{
    format_timestamp, is_genesis, Edge, Generator, Node, NodeKind, NodeMetadata, EMPTY_TREE,
    GENESIS, META_VERSION,
};
use crate::store::{
    ancestor_output_trees, attach_links, descendant_output_trees, filter_nodes, resolve_prefix,
    HistoryReader, HistoryWriter, NewNode, Result, StoreError,
};

/// Ref namespace holding one head per leaf node.
pub const LOCAL_HEADS_PREFIX: &str = "refs/quipu/local/heads";

/// Aggregate tip written by old migrations; import-only.
pub const HISTORY_REF: &str = "refs/quipu/history";

/// Default generator identity stamped into new node metadata.
pub const DEFAULT_GENERATOR_ID: &str = "quipu";

/// History backend reading and writing the git object store directly.
pub struct GitObjectStore {
    git: GitDb,
    owner_id: String,
    signature: Signature,
    generator_id: String,
    /// Last timestamp handed out; writes clamp to `last + 1ns` when the
    /// clock stalls so per-writer timestamps strictly increase.
    last_timestamp: Option<DateTime<Utc>>,
}

impl GitObjectStore {
    pub fn new(git: GitDb, owner_id: String, signature: Signature) -> Self {
        GitObjectStore {
            git,
            owner_id,
            signature,
            generator_id: DEFAULT_GENERATOR_ID.to_string(),
            last_timestamp: None,
        }
    }

    pub fn with_generator(mut self, generator_id: impl Into<String>) -> Self {
        self.generator_id = generator_id.into();
        self
    }

    pub fn git(&self) -> &GitDb {
        &self.git
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn generator_id(&self) -> &str {
        &self.generator_id
    }

    fn head_ref(commit_hash: &str) -> String {
        format!("{}/{}", LOCAL_HEADS_PREFIX, commit_hash)
    }

    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::nanoseconds(1);
            }
        }
        self.last_timestamp = Some(now);
        now
    }

    /// Read and parse one node commit's metadata document.
    pub fn read_metadata(git: &GitDb, commit_hash: &str) -> Result<NodeMetadata> {
        let bytes = git.cat_file(&format!("{}:metadata.json", commit_hash), "blob")?;
        NodeMetadata::from_json(&bytes).map_err(|e| StoreError::Parse {
            commit: commit_hash.to_string(),
            message: e.to_string(),
        })
    }

    /// Walk every local head and reconstruct nodes plus first-parent edges.
    /// Commits with missing or malformed documents are logged and skipped.
    fn load_raw(&self) -> Result<(Vec<Node>, Vec<Edge>)> {
        let tips: Vec<String> = self
            .git
            .list_refs(LOCAL_HEADS_PREFIX)?
            .into_iter()
            .map(|(_, hash)| hash)
            .collect();
        let commits = self.git.rev_list_with_parents(&tips)?;

        let mut nodes = Vec::with_capacity(commits.len());
        let mut edges = Vec::new();
        for (hash, parents) in commits {
            let meta = match Self::read_metadata(&self.git, &hash) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(commit = %hash, error = %e, "skipping unreadable node commit");
                    continue;
                }
            };
            let Some(node) = Node::from_metadata(hash.clone(), &meta) else {
                tracing::warn!(commit = %hash, "skipping node with unparseable timestamp");
                continue;
            };
            nodes.push(node);
            if let Some(parent) = parents.first() {
                if *parent != hash {
                    edges.push(Edge {
                        child_hash: hash.clone(),
                        parent_hash: parent.clone(),
                    });
                }
            }
        }
        Ok((nodes, edges))
    }

    fn load_linked(&self) -> Result<Vec<Node>> {
        let (mut nodes, edges) = self.load_raw()?;
        attach_links(&mut nodes, &edges);
        crate::node::sort_for_listing(&mut nodes);
        Ok(nodes)
    }

    /// Parent determination: the newest node whose output tree equals the
    /// new node's input tree. The genesis sentinel always means "no parent".
    fn find_parent_commit(&self, input_tree: &str) -> Result<Option<String>> {
        if input_tree == GENESIS {
            return Ok(None);
        }
        let (mut nodes, _) = self.load_raw()?;
        crate::node::sort_for_listing(&mut nodes);
        Ok(nodes
            .into_iter()
            .find(|n| n.output_tree == input_tree)
            .map(|n| n.commit_hash))
    }
}

impl HistoryReader for GitObjectStore {
    fn load_all_nodes(&self) -> Result<Vec<Node>> {
        self.load_linked()
    }

    fn get_node(&self, commit_hash: &str) -> Result<Option<Node>> {
        Ok(self
            .load_linked()?
            .into_iter()
            .find(|n| n.commit_hash == commit_hash))
    }

    fn get_node_content(&self, node: &Node) -> Result<String> {
        let bytes = self
            .git
            .cat_file(&format!("{}:plan.md", node.commit_hash), "blob")?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    fn find_nodes(
        &self,
        summary_regex: Option<&str>,
        kind: Option<NodeKind>,
        limit: usize,
    ) -> Result<Vec<Node>> {
        filter_nodes(self.load_linked()?, summary_regex, kind, limit)
    }

    fn get_node_count(&self) -> Result<usize> {
        Ok(self.load_raw()?.0.len())
    }

    fn load_nodes_paginated(&self, limit: usize, offset: usize) -> Result<Vec<Node>> {
        Ok(self
            .load_linked()?
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn get_ancestor_output_trees(&self, tree: &str) -> Result<Vec<String>> {
        Ok(ancestor_output_trees(&self.load_linked()?, tree))
    }

    fn get_descendant_output_trees(&self, tree: &str) -> Result<Vec<String>> {
        Ok(descendant_output_trees(&self.load_linked()?, tree))
    }

    fn get_node_position(&self, tree: &str) -> Result<Option<usize>> {
        Ok(self
            .load_linked()?
            .iter()
            .position(|n| n.output_tree == tree))
    }

    fn resolve_tree_prefix(&self, prefix: &str) -> Result<Option<String>> {
        resolve_prefix(&self.load_linked()?, prefix)
    }
}

impl HistoryWriter for GitObjectStore {
    fn create_node_full(&mut self, new: NewNode<'_>) -> Result<Node> {
        let timestamp = self.next_timestamp();
        // The sentinel spelling is normalized before persisting; metadata
        // always carries a concrete tree hash.
        let input_tree = if is_genesis(new.input_tree) {
            EMPTY_TREE.to_string()
        } else {
            new.input_tree.to_string()
        };

        let parent_commit = self.find_parent_commit(new.input_tree)?;

        let meta = NodeMetadata {
            meta_version: META_VERSION,
            kind: new.kind,
            summary: new.summary.to_string(),
            owner_id: self.owner_id.clone(),
            timestamp: format_timestamp(&timestamp),
            input_tree: input_tree.clone(),
            output_tree: new.output_tree.to_string(),
            generator: Generator {
                id: self.generator_id.clone(),
            },
            parent_hint: new.parent_hint.map(str::to_string),
            migration_info: new.migration_info.clone(),
        };
        let meta_json = meta.to_json().map_err(|e| StoreError::Parse {
            commit: String::new(),
            message: e.to_string(),
        })?;

        // Persisted order: blobs and tree, then the commit, then refs.
        let plan_blob = self.git.hash_blob(new.content.as_bytes())?;
        let meta_blob = self.git.hash_blob(meta_json.as_bytes())?;
        let doc_tree = self.git.mktree(&[
            TreeEntry::blob(meta_blob, "metadata.json"),
            TreeEntry::blob(plan_blob, "plan.md"),
        ])?;

        let parents: Vec<&str> = parent_commit.iter().map(String::as_str).collect();
        let commit_hash = self.git.commit_tree(
            &doc_tree,
            &parents,
            &self.signature,
            &timestamp,
            new.summary,
        )?;

        self.git
            .update_ref(&Self::head_ref(&commit_hash), &commit_hash)?;
        if let Some(parent) = &parent_commit {
            // The parent is no longer a leaf. Siblings created later simply
            // add their own head; this delete is a tolerated no-op then.
            self.git.delete_ref(&Self::head_ref(parent))?;
        }

        let mut node = Node::from_metadata(commit_hash, &meta).ok_or_else(|| StoreError::Parse {
            commit: String::new(),
            message: "freshly written metadata did not round-trip".to_string(),
        })?;
        node.content = Some(new.content.to_string());
        node.parent = parent_commit;
        Ok(node)
    }
}

impl GitObjectStore {
    /// Expose the tolerant head-ref move for migration tooling.
    pub fn import_head(&self, commit_hash: &str) -> std::result::Result<(), GitError> {
        self.git
            .update_ref(&Self::head_ref(commit_hash), commit_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn scratch_store() -> (TempDir, GitObjectStore) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            assert!(Command::new("git")
                .current_dir(&root)
                .args(&args)
                .status()
                .unwrap()
                .success());
        }
        let index = root.join(".quipu").join("index");
        std::fs::create_dir_all(index.parent().unwrap()).unwrap();
        let git = GitDb::new(root, index);
        let store = GitObjectStore::new(
            git,
            "test-at-example-dot-com".to_string(),
            Signature {
                name: "Test".to_string(),
                email: "test@example.com".to_string(),
            },
        );
        (temp, store)
    }

    fn tree(seed: u8) -> String {
        format!("{:02x}", seed).repeat(20)
    }

    fn head_hashes(store: &GitObjectStore) -> Vec<String> {
        store
            .git()
            .list_refs(LOCAL_HEADS_PREFIX)
            .unwrap()
            .into_iter()
            .map(|(_, h)| h)
            .collect()
    }

    #[test]
    fn test_genesis_node_round_trip() {
        let (_t, mut store) = scratch_store();
        let node = store
            .create_node(NodeKind::Capture, GENESIS, &tree(1), "# first", "first capture")
            .unwrap();
        assert_eq!(node.input_tree, EMPTY_TREE);
        assert_eq!(node.output_tree, tree(1));
        assert_eq!(node.kind, NodeKind::Capture);
        assert_eq!(node.parent, None);

        let loaded = store.load_all_nodes().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].commit_hash, node.commit_hash);
        assert_eq!(loaded[0].owner_id, "test-at-example-dot-com");
        assert_eq!(loaded[0].content, None);
        assert_eq!(store.get_node_content(&loaded[0]).unwrap(), "# first");
        assert_eq!(head_hashes(&store), vec![node.commit_hash]);
    }

    #[test]
    fn test_child_consumes_parent_head() {
        let (_t, mut store) = scratch_store();
        let a = store
            .create_node(NodeKind::Plan, GENESIS, &tree(1), "a", "root")
            .unwrap();
        let b = store
            .create_node(NodeKind::Plan, &tree(1), &tree(2), "b", "child")
            .unwrap();

        assert_eq!(b.parent.as_deref(), Some(a.commit_hash.as_str()));
        assert_eq!(head_hashes(&store), vec![b.commit_hash.clone()]);

        let nodes = store.load_all_nodes().unwrap();
        let loaded_a = nodes.iter().find(|n| n.commit_hash == a.commit_hash).unwrap();
        assert_eq!(loaded_a.children, vec![b.commit_hash]);
    }

    #[test]
    fn test_branching_keeps_both_leaves() {
        let (_t, mut store) = scratch_store();
        let a = store
            .create_node(NodeKind::Plan, GENESIS, &tree(1), "a", "root")
            .unwrap();
        let b = store
            .create_node(NodeKind::Plan, &tree(1), &tree(2), "b", "left")
            .unwrap();
        let c = store
            .create_node(NodeKind::Plan, &tree(1), &tree(3), "c", "right")
            .unwrap();

        let mut heads = head_hashes(&store);
        heads.sort();
        let mut expected = vec![b.commit_hash.clone(), c.commit_hash.clone()];
        expected.sort();
        assert_eq!(heads, expected);

        let nodes = store.load_all_nodes().unwrap();
        assert_eq!(nodes.len(), 3);
        let loaded_a = nodes.iter().find(|n| n.commit_hash == a.commit_hash).unwrap();
        assert_eq!(loaded_a.children.len(), 2);
        for child in [&b, &c] {
            let loaded = nodes
                .iter()
                .find(|n| n.commit_hash == child.commit_hash)
                .unwrap();
            assert_eq!(loaded.parent.as_deref(), Some(a.commit_hash.as_str()));
        }
    }

    #[test]
    fn test_idempotent_plan_is_a_new_event() {
        let (_t, mut store) = scratch_store();
        store
            .create_node(NodeKind::Plan, GENESIS, &tree(1), "seed", "seed")
            .unwrap();
        let before = store.get_node_count().unwrap();
        let n1 = store
            .create_node(NodeKind::Plan, &tree(1), &tree(1), "noop", "noop")
            .unwrap();
        let n2 = store
            .create_node(NodeKind::Plan, &tree(1), &tree(1), "noop", "noop")
            .unwrap();
        // Identical input/output/content still produce distinct nodes
        assert_ne!(n1.commit_hash, n2.commit_hash);
        assert_eq!(store.get_node_count().unwrap(), before + 2);
    }

    #[test]
    fn test_reader_skips_commit_without_metadata() {
        let (_t, mut store) = scratch_store();
        let good = store
            .create_node(NodeKind::Plan, GENESIS, &tree(1), "ok", "ok")
            .unwrap();

        // Hand-craft a commit whose tree has no metadata.json and register
        // it as a head.
        let blob = store.git().hash_blob(b"junk").unwrap();
        let bad_tree = store.git().mktree(&[TreeEntry::blob(blob, "junk.txt")]).unwrap();
        let bad_commit = store
            .git()
            .commit_tree(
                &bad_tree,
                &[],
                &Signature {
                    name: "Test".to_string(),
                    email: "test@example.com".to_string(),
                },
                &Utc::now(),
                "corrupt",
            )
            .unwrap();
        store.import_head(&bad_commit).unwrap();

        let nodes = store.load_all_nodes().unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].commit_hash, good.commit_hash);
    }

    #[test]
    fn test_paginated_listing_and_position() {
        let (_t, mut store) = scratch_store();
        store
            .create_node(NodeKind::Plan, GENESIS, &tree(1), "1", "one")
            .unwrap();
        store
            .create_node(NodeKind::Plan, &tree(1), &tree(2), "2", "two")
            .unwrap();
        store
            .create_node(NodeKind::Plan, &tree(2), &tree(3), "3", "three")
            .unwrap();

        let page = store.load_nodes_paginated(2, 0).unwrap();
        assert_eq!(page.len(), 2);
        // Newest first
        assert_eq!(page[0].output_tree, tree(3));
        assert_eq!(page[1].output_tree, tree(2));
        let rest = store.load_nodes_paginated(2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].output_tree, tree(1));

        assert_eq!(store.get_node_position(&tree(3)).unwrap(), Some(0));
        assert_eq!(store.get_node_position(&tree(1)).unwrap(), Some(2));
        assert_eq!(store.get_node_position("ffff").unwrap(), None);
    }

    #[test]
    fn test_ancestors_descendants_and_prefix() {
        let (_t, mut store) = scratch_store();
        store
            .create_node(NodeKind::Plan, GENESIS, &tree(1), "1", "one")
            .unwrap();
        store
            .create_node(NodeKind::Plan, &tree(1), &tree(2), "2", "two")
            .unwrap();

        assert_eq!(store.get_ancestor_output_trees(&tree(2)).unwrap(), vec![tree(1)]);
        assert_eq!(store.get_descendant_output_trees(&tree(1)).unwrap(), vec![tree(2)]);

        let resolved = store.resolve_tree_prefix(&tree(2)[..8]).unwrap();
        assert_eq!(resolved.as_deref(), Some(tree(2).as_str()));
    }
}
