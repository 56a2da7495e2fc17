//! Git plumbing adapter
//!
//! Wraps a Git working directory with the low-level primitives the history
//! engine needs: hashing blobs, composing trees, reading and writing refs in
//! a private namespace, and materializing trees into the working directory.
//! Pure plumbing; no history semantics live here.
//!
//! Every index-touching operation runs against a private index file
//! (`GIT_INDEX_FILE`), so the user's staging area is never observed or
//! mutated.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use chrono::{DateTime, Utc};

/// Error type for plumbing operations
#[derive(Debug)]
pub enum GitError {
    /// An external git invocation exited non-zero.
    PlumbingFailure { command: String, stderr: String },
    /// A requested object is not in the object store.
    ObjectNotFound(String),
    /// Checkout cannot proceed even with a forced index reset.
    DirtyTreeConflict(String),
    Io(std::io::Error),
}

impl std::fmt::Display for GitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GitError::PlumbingFailure { command, stderr } => {
                write!(f, "git command '{}' failed: {}", command, stderr)
            }
            GitError::ObjectNotFound(spec) => write!(f, "object not found: {}", spec),
            GitError::DirtyTreeConflict(msg) => {
                write!(f, "checkout cannot proceed: {}", msg)
            }
            GitError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for GitError {}

impl From<std::io::Error> for GitError {
    fn from(e: std::io::Error) -> Self {
        GitError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, GitError>;

/// One entry fed to `mktree`.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub mode: String,
    pub kind: String,
    pub hash: String,
    pub name: String,
}

impl TreeEntry {
    /// Regular-file blob entry.
    pub fn blob(hash: impl Into<String>, name: impl Into<String>) -> Self {
        TreeEntry {
            mode: "100644".to_string(),
            kind: "blob".to_string(),
            hash: hash.into(),
            name: name.into(),
        }
    }
}

/// Author/committer identity for commit objects.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    pub email: String,
}

/// Handle on a Git working directory plus a private index file.
#[derive(Debug, Clone)]
pub struct GitDb {
    root: PathBuf,
    index_file: PathBuf,
}

impl GitDb {
    pub fn new(root: impl Into<PathBuf>, index_file: impl Into<PathBuf>) -> Self {
        GitDb {
            root: root.into(),
            index_file: index_file.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn command(&self, indexed: bool) -> Command {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root);
        if indexed {
            cmd.env("GIT_INDEX_FILE", &self.index_file);
        }
        cmd
    }

    /// Run git and demand success. Non-zero exits are classified by stderr:
    /// missing objects become `ObjectNotFound`, everything else
    /// `PlumbingFailure` with argv and captured stderr.
    fn run(&self, args: &[&str], indexed: bool) -> Result<Output> {
        tracing::debug!(args = ?args, "git");
        let output = self.command(indexed).args(args).output()?;
        self.check(args, output)
    }

    /// Run git with bytes piped to stdin.
    fn run_with_stdin(&self, args: &[&str], input: &[u8], indexed: bool) -> Result<Output> {
        tracing::debug!(args = ?args, stdin_bytes = input.len(), "git");
        let mut child = self
            .command(indexed)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        self.check(args, output)
    }

    /// Run git and hand back the raw output, treating non-zero exit as data.
    fn run_unchecked(&self, args: &[&str], indexed: bool) -> Result<Output> {
        tracing::debug!(args = ?args, "git (unchecked)");
        Ok(self.command(indexed).args(args).output()?)
    }

    fn check(&self, args: &[&str], output: Output) -> Result<Output> {
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let command = format!("git {}", args.join(" "));
        if stderr.contains("Not a valid object name")
            || stderr.contains("not a valid object name")
            || stderr.contains("does not exist in")
            || stderr.contains("bad object")
        {
            return Err(GitError::ObjectNotFound(format!("{} ({})", command, stderr.trim())));
        }
        Err(GitError::PlumbingFailure { command, stderr })
    }

    fn stdout_line(output: &Output) -> String {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    // ========================================================================
    // Object store
    // ========================================================================

    /// Write a blob object, returning its content hash. Idempotent.
    pub fn hash_blob(&self, bytes: &[u8]) -> Result<String> {
        let output = self.run_with_stdin(&["hash-object", "-w", "--stdin"], bytes, false)?;
        Ok(Self::stdout_line(&output))
    }

    /// Create a tree object from entries. Entries are sorted by name before
    /// being fed to `git mktree`, which expects canonical order.
    pub fn mktree(&self, entries: &[TreeEntry]) -> Result<String> {
        let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        let mut input = String::new();
        for entry in sorted {
            input.push_str(&format!(
                "{} {} {}\t{}\n",
                entry.mode, entry.kind, entry.hash, entry.name
            ));
        }
        let output = self.run_with_stdin(&["mktree"], input.as_bytes(), false)?;
        Ok(Self::stdout_line(&output))
    }

    /// Read an object's bytes. `spec` may be a hash or a rev expression such
    /// as `<commit>:metadata.json`.
    pub fn cat_file(&self, spec: &str, kind: &str) -> Result<Vec<u8>> {
        let output = self.run(&["cat-file", kind, spec], false)?;
        Ok(output.stdout)
    }

    /// Compose a tree hash from the current working directory, ignoring the
    /// user's index. Equivalent to add-everything-then-write-tree against the
    /// private index; honors `.gitignore`, excludes `.git/` and `.quipu/`,
    /// and never alters file mtimes.
    pub fn get_tree_hash(&self) -> Result<String> {
        self.run(&["add", "-A", "--", ".", ":(exclude).quipu"], true)?;
        let output = self.run(&["write-tree"], true)?;
        Ok(Self::stdout_line(&output))
    }

    /// Create a commit object with explicit parents. Moves no refs.
    pub fn commit_tree(
        &self,
        tree: &str,
        parents: &[&str],
        signature: &Signature,
        timestamp: &DateTime<Utc>,
        message: &str,
    ) -> Result<String> {
        let mut args: Vec<String> = vec!["commit-tree".to_string(), tree.to_string()];
        for parent in parents {
            args.push("-p".to_string());
            args.push((*parent).to_string());
        }
        args.push("-m".to_string());
        args.push(message.to_string());

        // Git's internal date format: seconds since epoch plus offset.
        let date = format!("{} +0000", timestamp.timestamp());
        tracing::debug!(tree, ?parents, "git commit-tree");
        let output = self
            .command(false)
            .args(&args)
            .env("GIT_AUTHOR_NAME", &signature.name)
            .env("GIT_AUTHOR_EMAIL", &signature.email)
            .env("GIT_AUTHOR_DATE", &date)
            .env("GIT_COMMITTER_NAME", &signature.name)
            .env("GIT_COMMITTER_EMAIL", &signature.email)
            .env("GIT_COMMITTER_DATE", &date)
            .output()?;
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.check(&arg_refs, output)?;
        Ok(Self::stdout_line(&output))
    }

    // ========================================================================
    // Refs
    // ========================================================================

    pub fn update_ref(&self, name: &str, hash: &str) -> Result<()> {
        self.run(&["update-ref", name, hash], false)?;
        Ok(())
    }

    /// Delete a ref. Returns `false` (not an error) when the ref did not
    /// exist.
    pub fn delete_ref(&self, name: &str) -> Result<bool> {
        if !self.ref_exists(name)? {
            return Ok(false);
        }
        self.run(&["update-ref", "-d", name], false)?;
        Ok(true)
    }

    pub fn ref_exists(&self, name: &str) -> Result<bool> {
        let output = self.run_unchecked(&["show-ref", "--verify", "--quiet", name], false)?;
        Ok(output.status.success())
    }

    /// List `(refname, hash)` pairs under a prefix.
    pub fn list_refs(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let output = self.run(
            &["for-each-ref", "--format=%(refname) %(objectname)", prefix],
            false,
        )?;
        let mut refs = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Some((name, hash)) = line.trim().split_once(' ') {
                refs.push((name.to_string(), hash.to_string()));
            }
        }
        Ok(refs)
    }

    /// Commits reachable from a ref, newest first.
    pub fn log_ref(&self, name: &str) -> Result<Vec<String>> {
        let output = self.run(&["rev-list", name], false)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Every commit reachable from the given tips, with its parent hashes.
    /// Returns an empty list for an empty tip set.
    pub fn rev_list_with_parents(&self, tips: &[String]) -> Result<Vec<(String, Vec<String>)>> {
        if tips.is_empty() {
            return Ok(Vec::new());
        }
        let mut args: Vec<&str> = vec!["rev-list", "--parents"];
        args.extend(tips.iter().map(String::as_str));
        let output = self.run(&args, false)?;
        let mut commits = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut parts = line.split_whitespace().map(str::to_string);
            if let Some(hash) = parts.next() {
                commits.push((hash, parts.collect()));
            }
        }
        Ok(commits)
    }

    /// Read a config value, `None` when unset.
    pub fn config_value(&self, key: &str) -> Result<Option<String>> {
        let output = self.run_unchecked(&["config", "--get", key], false)?;
        if !output.status.success() {
            return Ok(None);
        }
        let value = Self::stdout_line(&output);
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    /// Push one refspec to a remote.
    pub fn push(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run(&["push", "--quiet", remote, refspec], false)?;
        Ok(())
    }

    /// Fetch one refspec from a remote.
    pub fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        self.run(&["fetch", "--quiet", remote, refspec], false)?;
        Ok(())
    }

    // ========================================================================
    // Working-directory materialization
    // ========================================================================

    /// Materialize `new_tree` into the working directory.
    ///
    /// When `old_tree` is known, only paths that differ between the two
    /// trees are touched: unchanged files keep their mtimes, and paths that
    /// disappear in `new_tree` are removed (with empty parent directories
    /// pruned). When `old_tree` is unknown, the whole tree is written out
    /// and nothing is removed.
    pub fn checkout_tree(&self, new_tree: &str, old_tree: Option<&str>) -> Result<()> {
        // Prime the private index with the target; this also resets any
        // stale staged entries from a previous run.
        self.run(&["read-tree", new_tree], true)?;

        let old = match old_tree {
            Some(old) if old != new_tree => old,
            Some(_) => return Ok(()),
            None => {
                self.checkout_index(&["checkout-index", "-a", "-f", "-u"], &[])?;
                return Ok(());
            }
        };

        let output = self.run(
            &["diff-tree", "-r", "-z", "--name-status", old, new_tree],
            false,
        )?;
        let mut upserts: Vec<String> = Vec::new();
        let mut deletions: Vec<String> = Vec::new();
        let raw = String::from_utf8_lossy(&output.stdout);
        let mut fields = raw.split('\0').filter(|f| !f.is_empty());
        while let Some(status) = fields.next() {
            let Some(path) = fields.next() else { break };
            if status.starts_with('D') {
                deletions.push(path.to_string());
            } else {
                upserts.push(path.to_string());
            }
        }

        if !upserts.is_empty() {
            let mut stdin = Vec::new();
            for path in &upserts {
                stdin.extend_from_slice(path.as_bytes());
                stdin.push(0);
            }
            self.checkout_index(
                &["checkout-index", "-f", "-u", "-z", "--stdin"],
                &stdin,
            )?;
        }

        for path in &deletions {
            let target = self.root.join(path);
            match std::fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(GitError::DirtyTreeConflict(format!(
                        "cannot remove {}: {}",
                        target.display(),
                        e
                    )));
                }
            }
            self.prune_empty_dirs(&target);
        }

        Ok(())
    }

    /// Run checkout-index, translating filesystem-level failures into
    /// `DirtyTreeConflict`.
    fn checkout_index(&self, args: &[&str], stdin: &[u8]) -> Result<()> {
        let result = if stdin.is_empty() {
            self.run(args, true)
        } else {
            self.run_with_stdin(args, stdin, true)
        };
        match result {
            Ok(_) => Ok(()),
            Err(GitError::PlumbingFailure { stderr, command }) => {
                if stderr.contains("Permission denied")
                    || stderr.contains("unable to create file")
                    || stderr.contains("unable to write file")
                {
                    Err(GitError::DirtyTreeConflict(stderr))
                } else {
                    Err(GitError::PlumbingFailure { command, stderr })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Remove now-empty parent directories of a deleted path, stopping at
    /// the repository root.
    fn prune_empty_dirs(&self, deleted: &Path) {
        let mut dir = deleted.parent();
        while let Some(d) = dir {
            if d == self.root.as_path() || !d.starts_with(&self.root) {
                break;
            }
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}
