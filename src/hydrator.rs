//! Cache hydration
//!
//! One-way rebuild of the relational cache from the authoritative ref
//! graph. Walks every commit reachable from the local heads (plus the
//! migrated aggregate tip when present), inserts cold rows for commits the
//! cache does not know, and is idempotent: re-running after a no-op yields
//! zero inserts.

use crate::gitdb::GitDb;
use crate::store::git_object::{GitObjectStore, HISTORY_REF, LOCAL_HEADS_PREFIX};
use crate::store::{Result, SqliteCacheStore};

/// Counters from one hydration run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HydrationReport {
    /// Commits enumerated from the refs.
    pub commits_seen: usize,
    /// Node rows inserted this run.
    pub nodes_inserted: usize,
    /// Edge rows inserted this run.
    pub edges_inserted: usize,
    /// Commits whose documents failed to parse; logged and skipped.
    pub commits_skipped: usize,
}

/// Populate the cache with every node commit missing from it.
///
/// Edges are written only for commits with exactly one parent that is not
/// the commit itself; nodes whose parent is unknown still get a row with no
/// edge. A bad commit object never aborts the run.
pub fn hydrate(git: &GitDb, cache: &SqliteCacheStore) -> Result<HydrationReport> {
    let mut tips: Vec<String> = git
        .list_refs(LOCAL_HEADS_PREFIX)?
        .into_iter()
        .map(|(_, hash)| hash)
        .collect();
    // The aggregate history ref is an import source only; per-leaf heads
    // stay authoritative.
    if git.ref_exists(HISTORY_REF)? {
        tips.push(HISTORY_REF.to_string());
    }

    let commits = git.rev_list_with_parents(&tips)?;
    let known = cache.known_commits()?;

    let mut report = HydrationReport {
        commits_seen: commits.len(),
        ..Default::default()
    };

    for (hash, parents) in &commits {
        if known.contains(hash) {
            continue;
        }
        let meta = match GitObjectStore::read_metadata(git, hash) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(commit = %hash, error = %e, "hydration skipping bad commit");
                report.commits_skipped += 1;
                continue;
            }
        };
        let meta_json = serde_json::to_string_pretty(&meta).unwrap_or_default();
        let parent = match parents.as_slice() {
            [parent] if parent != hash => Some(parent.as_str()),
            _ => None,
        };
        let (node_inserted, edge_inserted) = cache.insert_cold(hash, &meta, &meta_json, parent)?;
        if node_inserted {
            report.nodes_inserted += 1;
        }
        if edge_inserted {
            report.edges_inserted += 1;
        }
    }

    tracing::info!(
        seen = report.commits_seen,
        nodes = report.nodes_inserted,
        edges = report.edges_inserted,
        skipped = report.commits_skipped,
        "hydration complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitdb::{GitDb, Signature, TreeEntry};
    use crate::node::{NodeKind, GENESIS};
    use crate::store::{HistoryReader, HistoryWriter};
    use std::process::Command;
    use tempfile::TempDir;

    fn signature() -> Signature {
        Signature {
            name: "Test".to_string(),
            email: "test@example.com".to_string(),
        }
    }

    fn scratch() -> (TempDir, GitDb, SqliteCacheStore) {
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
        let state = root.join(".quipu");
        std::fs::create_dir_all(&state).unwrap();
        let git = GitDb::new(root, state.join("index"));
        let inner = GitObjectStore::new(git.clone(), "tester".to_string(), signature());
        let cache = SqliteCacheStore::open(&state.join("cache.sqlite"), inner).unwrap();
        (temp, git, cache)
    }

    fn tree(seed: u8) -> String {
        format!("{:02x}", seed).repeat(20)
    }

    /// Write nodes straight to git, bypassing the cache mirror.
    fn write_chain(git: &GitDb, count: u8) {
        let mut writer = GitObjectStore::new(git.clone(), "tester".to_string(), signature());
        let mut input = GENESIS.to_string();
        for i in 1..=count {
            let output = tree(i);
            writer
                .create_node(NodeKind::Plan, &input, &output, "body", &format!("step {}", i))
                .unwrap();
            input = output;
        }
    }

    #[test]
    fn test_hydrate_fills_empty_cache() {
        let (_t, git, cache) = scratch();
        write_chain(&git, 3);
        assert_eq!(cache.node_row_count().unwrap(), 0);

        let report = hydrate(&git, &cache).unwrap();
        assert_eq!(report.commits_seen, 3);
        assert_eq!(report.nodes_inserted, 3);
        assert_eq!(report.edges_inserted, 2);
        assert_eq!(report.commits_skipped, 0);

        // Hydrated rows are cold and linked
        let nodes = cache.load_all_nodes().unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(nodes.iter().all(|n| n.content.is_none()));
        assert_eq!(nodes.iter().filter(|n| n.parent.is_some()).count(), 2);
        // Cold content resolves through the git fallback
        let newest = &nodes[0];
        assert_eq!(cache.get_node_content(newest).unwrap(), "body");
    }

    #[test]
    fn test_hydrate_is_idempotent() {
        let (_t, git, cache) = scratch();
        write_chain(&git, 3);

        let first = hydrate(&git, &cache).unwrap();
        assert_eq!(first.nodes_inserted, 3);
        let rows_after_first = cache.node_row_count().unwrap();

        let second = hydrate(&git, &cache).unwrap();
        assert_eq!(second.nodes_inserted, 0);
        assert_eq!(second.edges_inserted, 0);
        assert_eq!(cache.node_row_count().unwrap(), rows_after_first);
        assert_eq!(cache.edge_row_count().unwrap(), 2);
    }

    #[test]
    fn test_hydrate_picks_up_incremental_writes() {
        let (_t, git, cache) = scratch();
        write_chain(&git, 2);
        hydrate(&git, &cache).unwrap();

        let mut writer = GitObjectStore::new(git.clone(), "tester".to_string(), signature());
        writer
            .create_node(NodeKind::Plan, &tree(2), &tree(3), "body", "step 3")
            .unwrap();

        let report = hydrate(&git, &cache).unwrap();
        assert_eq!(report.nodes_inserted, 1);
        assert_eq!(report.edges_inserted, 1);
        assert_eq!(cache.node_row_count().unwrap(), 3);
    }

    #[test]
    fn test_hydrate_skips_bad_commit_and_continues() {
        let (_t, git, cache) = scratch();
        write_chain(&git, 2);

        // A head pointing at a commit with no metadata document
        let blob = git.hash_blob(b"junk").unwrap();
        let bad_tree = git.mktree(&[TreeEntry::blob(blob, "junk.txt")]).unwrap();
        let bad = git
            .commit_tree(&bad_tree, &[], &signature(), &chrono::Utc::now(), "bad")
            .unwrap();
        git.update_ref(&format!("{}/{}", LOCAL_HEADS_PREFIX, bad), &bad)
            .unwrap();

        let report = hydrate(&git, &cache).unwrap();
        assert_eq!(report.commits_seen, 3);
        assert_eq!(report.nodes_inserted, 2);
        assert_eq!(report.commits_skipped, 1);
    }

    #[test]
    fn test_hydrate_imports_history_ref() {
        let (_t, git, cache) = scratch();
        write_chain(&git, 2);

        // Simulate a migrated aggregate tip whose chain lost its head refs.
        let mut writer = GitObjectStore::new(git.clone(), "tester".to_string(), signature());
        let orphan = writer
            .create_node(NodeKind::Plan, &tree(9), "aa".repeat(20).as_str(), "m", "migrated")
            .unwrap();
        git.update_ref(HISTORY_REF, &orphan.commit_hash).unwrap();
        git.delete_ref(&format!("{}/{}", LOCAL_HEADS_PREFIX, orphan.commit_hash))
            .unwrap();

        let report = hydrate(&git, &cache).unwrap();
        assert_eq!(report.nodes_inserted, 3);
    }
}
