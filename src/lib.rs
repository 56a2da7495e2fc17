//! Quipu - a local history engine for working-tree lineage
//!
//! Quipu records every distinct directory state a project has visited or
//! produced as a content-addressed DAG layered on top of the Git object
//! database. Unlike a branch, which tracks one moving head, the DAG keeps
//! every state reachable and linked by declared input/output relationships,
//! so it can answer "what was the tree at state X", "how did we get from X
//! to Y", and "which state matches this short hash".
//!
//! # Architecture
//!
//! | Component | Role |
//! |-----------|------|
//! | [`gitdb::GitDb`] | plumbing over the git object store; no history semantics |
//! | [`node::Node`] | one recorded transition event (`plan` or `capture`) |
//! | [`store`] | reader/writer contract with git-object and SQLite-cache backends |
//! | [`hydrator`] | one-way rebuild of the cache from authoritative refs |
//! | [`engine::Engine`] | alignment, drift capture, checkout, back/forward |
//! | [`navlog::NavLog`] | linear visit journal independent of the DAG |
//!
//! All engine state lives under `.quipu/` next to the repository's `.git/`;
//! history commits live in the object store under the private
//! `refs/quipu/**` namespace, so user branches are never touched.
//!
//! # Quick start
//!
//! ```no_run
//! use quipu::{Engine, NodeKind};
//!
//! let mut engine = Engine::open(std::path::Path::new(".")).unwrap();
//!
//! // Observe the working tree and record it if it drifted
//! let tree = engine.current_tree().unwrap();
//! let node = engine.capture_drift(&tree, Some("checkpoint")).unwrap();
//! assert_eq!(node.kind, NodeKind::Capture);
//!
//! // Navigate the visit history
//! if let Some(previous) = engine.back().unwrap() {
//!     println!("now at {}", previous);
//! }
//! ```

pub mod config;
pub mod engine;
pub mod gitdb;
pub mod hydrator;
pub mod navlog;
pub mod node;
pub mod schema;
pub mod store;
pub mod sync;
pub mod workspace;

pub use config::{Config, ConfigError, StorageBackend};
pub use engine::{Alignment, Engine, EngineError};
pub use gitdb::{GitDb, GitError, Signature, TreeEntry};
pub use hydrator::{hydrate, HydrationReport};
pub use navlog::NavLog;
pub use node::{
    normalize_owner_id, Edge, Node, NodeKind, NodeMetadata, EMPTY_TREE, GENESIS,
};
pub use store::{
    GitObjectStore, HistoryReader, HistoryWriter, NewNode, SqliteCacheStore, Storage, StoreError,
};
pub use workspace::{Workspace, WorkspaceError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Core constants are re-exported from the crate root
        assert_eq!(EMPTY_TREE.len(), 40);
        assert_eq!(GENESIS, "genesis");
    }
}
