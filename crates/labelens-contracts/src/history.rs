use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How many entries the intent stage reads per session.
pub const HISTORY_READ_LIMIT: usize = 5;
/// How many entries a session file retains on disk.
pub const HISTORY_RETAIN_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub scanned_at: String,
    pub product_name: Option<String>,
    pub ingredients: Vec<String>,
    pub persona: String,
    pub context_bias: String,
}

/// Best-effort session history. Both operations are infallible at the
/// signature level: a broken store degrades to "no history", it never
/// surfaces an error to the scan.
pub trait HistoryStore: Send + Sync {
    /// Most-recent-first, at most `limit` entries.
    fn recent(&self, session_id: &str, limit: usize) -> Vec<HistoryEntry>;
    /// Returns false when the write was lost.
    fn append(&self, session_id: &str, entry: HistoryEntry) -> bool;
}

/// One JSONL file per session under a root directory, append-only, trimmed
/// back to [`HISTORY_RETAIN_LIMIT`] lines when it grows past the cap.
#[derive(Debug, Clone)]
pub struct JsonlHistoryStore {
    root: PathBuf,
}

impl JsonlHistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_path(&self, session_id: &str) -> Option<PathBuf> {
        let safe: String = session_id
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
            .collect();
        if safe.is_empty() {
            return None;
        }
        Some(self.root.join(format!("{safe}.jsonl")))
    }

    fn read_all(&self, session_id: &str) -> Vec<HistoryEntry> {
        let Some(path) = self.session_path(session_id) else {
            return Vec::new();
        };
        let Ok(raw) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        raw.lines()
            .filter_map(|line| serde_json::from_str::<HistoryEntry>(line).ok())
            .collect()
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn recent(&self, session_id: &str, limit: usize) -> Vec<HistoryEntry> {
        let mut entries = self.read_all(session_id);
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    fn append(&self, session_id: &str, entry: HistoryEntry) -> bool {
        let Some(path) = self.session_path(session_id) else {
            return false;
        };
        if fs::create_dir_all(&self.root).is_err() {
            return false;
        }

        let mut entries = self.read_all(session_id);
        entries.push(entry);
        if entries.len() > HISTORY_RETAIN_LIMIT {
            let drop = entries.len() - HISTORY_RETAIN_LIMIT;
            entries.drain(..drop);
        }

        let mut lines = Vec::with_capacity(entries.len());
        for row in &entries {
            match serde_json::to_string(row) {
                Ok(line) => lines.push(line),
                Err(_) => return false,
            }
        }

        let Ok(mut file) = fs::File::create(&path) else {
            return false;
        };
        for line in lines {
            if file.write_all(line.as_bytes()).is_err() || file.write_all(b"\n").is_err() {
                return false;
            }
        }
        true
    }
}

/// Used when no history root is configured.
#[derive(Debug, Clone, Default)]
pub struct NoHistory;

impl HistoryStore for NoHistory {
    fn recent(&self, _session_id: &str, _limit: usize) -> Vec<HistoryEntry> {
        Vec::new()
    }

    fn append(&self, _session_id: &str, _entry: HistoryEntry) -> bool {
        true
    }
}
