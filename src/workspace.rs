//! Workspace discovery and engine state directory
//!
//! A workspace is the enclosing Git repository plus quipu's own state
//! directory (`.quipu/` by default, overridable with `QUIPU_DIR`). The state
//! directory holds the HEAD pointer, the navigation journal, the config
//! file, the private index, the optional relational cache, and the
//! free-form memory log.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::node::format_timestamp;

/// Error type for workspace discovery and state-file IO
#[derive(Debug)]
pub enum WorkspaceError {
    /// No enclosing `.git` was found walking up from the start path.
    NotARepository(PathBuf),
    Io(std::io::Error),
}

impl std::fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceError::NotARepository(path) => {
                write!(f, "no git repository found at or above {}", path.display())
            }
            WorkspaceError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for WorkspaceError {}

impl From<std::io::Error> for WorkspaceError {
    fn from(e: std::io::Error) -> Self {
        WorkspaceError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// A discovered project root and its state directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    state_dir: PathBuf,
}

impl Workspace {
    /// Walk up from `start` to the first directory containing `.git` (a
    /// directory, or a file for linked worktrees). The state directory is
    /// `<root>/.quipu` unless the `QUIPU_DIR` env var points elsewhere.
    pub fn discover(start: &Path) -> Result<Self> {
        let start = if start.is_absolute() {
            start.to_path_buf()
        } else {
            std::env::current_dir()?.join(start)
        };
        let mut dir = start.as_path();
        loop {
            if dir.join(".git").exists() {
                return Ok(Self::at_root(dir.to_path_buf()));
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        Err(WorkspaceError::NotARepository(start))
    }

    /// Build a workspace for a known repository root without walking up.
    pub fn at_root(root: PathBuf) -> Self {
        let state_dir = match std::env::var("QUIPU_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => root.join(".quipu"),
        };
        Workspace { root, state_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn head_path(&self) -> PathBuf {
        self.state_dir.join("HEAD")
    }

    pub fn navlog_path(&self) -> PathBuf {
        self.state_dir.join("nav.log")
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.yml")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join("cache.sqlite")
    }

    pub fn memory_path(&self) -> PathBuf {
        self.state_dir.join("memory.md")
    }

    /// Private index file handed to the plumbing adapter.
    pub fn index_path(&self) -> PathBuf {
        self.state_dir.join("index")
    }

    /// Create the state directory if it is missing. First mutation calls
    /// this; reads never do.
    pub fn ensure_state_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        Ok(())
    }

    /// Read the engine's HEAD fingerprint. Missing or empty file is `None`.
    pub fn read_head(&self) -> Result<Option<String>> {
        let path = self.head_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let head = content.trim();
        if head.is_empty() {
            return Ok(None);
        }
        Ok(Some(head.to_string()))
    }

    /// Write the engine's HEAD fingerprint with a trailing newline.
    pub fn write_head(&self, tree: &str) -> Result<()> {
        self.ensure_state_dir()?;
        std::fs::write(self.head_path(), format!("{}\n", tree))?;
        Ok(())
    }

    /// Append a timestamped section to the free-form memory log.
    pub fn append_memory(&self, text: &str) -> Result<()> {
        use std::io::Write;
        self.ensure_state_dir()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.memory_path())?;
        writeln!(file, "## {}\n\n{}\n", format_timestamp(&Utc::now()), text.trim_end())?;
        Ok(())
    }
}
