//! Navigation journal
//!
//! A linear, truncatable visit history independent of the DAG: an ordered
//! list of tree fingerprints plus a cursor. Going back may hop between
//! sibling branches when that matches the user's actual visit sequence.
//!
//! Persisted as a small file: one fingerprint per line, then a trailing
//! `cursor: <n>` line (`-1` when the journal is empty).

use std::path::Path;

/// In-memory navigation journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavLog {
    entries: Vec<String>,
    /// Index into `entries`, `None` while the journal is empty.
    cursor: Option<usize>,
}

impl NavLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Fingerprint at the cursor, if any.
    pub fn current(&self) -> Option<&str> {
        self.cursor.map(|c| self.entries[c].as_str())
    }

    /// Record a visit. A no-op when `h` is already at the cursor; otherwise
    /// the forward tail is truncated, `h` is appended, and the cursor
    /// advances onto it.
    pub fn visit(&mut self, h: &str) {
        if self.current() == Some(h) {
            return;
        }
        match self.cursor {
            Some(c) => self.entries.truncate(c + 1),
            None => self.entries.clear(),
        }
        self.entries.push(h.to_string());
        self.cursor = Some(self.entries.len() - 1);
    }

    /// Fingerprint one step back, without moving the cursor.
    pub fn peek_back(&self) -> Option<&str> {
        match self.cursor {
            Some(c) if c > 0 => Some(self.entries[c - 1].as_str()),
            _ => None,
        }
    }

    /// Fingerprint one step forward, without moving the cursor.
    pub fn peek_forward(&self) -> Option<&str> {
        match self.cursor {
            Some(c) if c + 1 < self.entries.len() => Some(self.entries[c + 1].as_str()),
            _ => None,
        }
    }

    /// Move the cursor one step back and return the fingerprint there.
    /// Returns `None` at the boundary.
    pub fn back(&mut self) -> Option<String> {
        match self.cursor {
            Some(c) if c > 0 => {
                self.cursor = Some(c - 1);
                Some(self.entries[c - 1].clone())
            }
            _ => None,
        }
    }

    /// Move the cursor one step forward and return the fingerprint there.
    /// Returns `None` at the boundary.
    pub fn forward(&mut self) -> Option<String> {
        match self.cursor {
            Some(c) if c + 1 < self.entries.len() => {
                self.cursor = Some(c + 1);
                Some(self.entries[c + 1].clone())
            }
            _ => None,
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Load a journal from disk. A missing file is an empty journal; a
    /// malformed cursor clamps into range rather than failing.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        let mut cursor_value: i64 = -1;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("cursor:") {
                cursor_value = rest.trim().parse().unwrap_or(-1);
            } else {
                entries.push(line.to_string());
            }
        }
        let cursor = if entries.is_empty() || cursor_value < 0 {
            None
        } else {
            Some((cursor_value as usize).min(entries.len() - 1))
        };
        Ok(NavLog { entries, cursor })
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(entry);
            out.push('\n');
        }
        let cursor = self.cursor.map(|c| c as i64).unwrap_or(-1);
        out.push_str(&format!("cursor: {}\n", cursor));
        std::fs::write(path, out)
    }
}
