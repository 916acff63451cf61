//! Durable subscriber cursors
//!
//! A cursor is the last position a consumer took from a `(topic, subscriber)`
//! pair; `Resume` subscriptions replay the flow log from it.
//!
//! Detaching one subscriber commits one cursor, while flush and release
//! checkpoint the whole set. The file store keeps a JSON-lines journal:
//! `commit` appends a line, `checkpoint` rewrites the file with one line per
//! key, and `load` folds the lines with the last write winning.

use crate::error::{HubError, Result};
use crate::flow::Position;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key under which a subscriber's cursor is stored
pub fn cursor_key(topic: &str, subscriber: &str) -> String {
    format!("{}/{}", topic, subscriber)
}

/// Persistence for subscriber cursors
pub trait CursorStore: Send + Sync {
    /// All stored cursors
    fn load(&self) -> Result<HashMap<String, Position>>;

    /// Record a single cursor
    fn commit(&self, key: &str, position: Position) -> Result<()>;

    /// Replace the stored set with `cursors`
    fn checkpoint(&self, cursors: &HashMap<String, Position>) -> Result<()>;
}

/// One journal line
#[derive(Debug, Serialize, Deserialize)]
struct CursorEntry {
    key: String,
    position: Position,
}

/// JSON-lines cursor journal
pub struct FileCursorStore {
    path: PathBuf,
    /// Append handle, reopened lazily after a checkpoint replaces the file
    journal: Mutex<Option<File>>,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            journal: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn open_journal(&self) -> Result<File> {
        self.ensure_parent()?;
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?)
    }
}

fn entry_line(key: &str, position: Position) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&CursorEntry {
        key: key.to_string(),
        position,
    })?;
    line.push(b'\n');
    Ok(line)
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<HashMap<String, Position>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let complete = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();

        let mut cursors = HashMap::new();
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CursorEntry>(line) {
                Ok(entry) => {
                    cursors.insert(entry.key, entry.position);
                }
                // Crash mid-append leaves an unterminated last line
                Err(e) if !complete && index + 1 == lines.len() => {
                    tracing::warn!(path = %self.path.display(), error = %e, "Ignoring torn cursor entry");
                }
                Err(e) => {
                    return Err(HubError::Config(format!(
                        "Corrupt cursor journal {} at line {}: {}",
                        self.path.display(),
                        index + 1,
                        e
                    )))
                }
            }
        }

        tracing::debug!(path = %self.path.display(), count = cursors.len(), "Cursors loaded");
        Ok(cursors)
    }

    fn commit(&self, key: &str, position: Position) -> Result<()> {
        let line = entry_line(key, position)?;
        let mut journal = self.journal.lock().map_err(HubError::lock)?;
        let file = match journal.take() {
            Some(file) => file,
            None => self.open_journal()?,
        };
        let file = journal.insert(file);
        file.write_all(&line)?;
        file.sync_data()?;

        tracing::debug!(key = %key, position = %position, "Cursor committed");
        Ok(())
    }

    fn checkpoint(&self, cursors: &HashMap<String, Position>) -> Result<()> {
        let mut entries: Vec<(&String, &Position)> = cursors.iter().collect();
        entries.sort();
        let mut content = Vec::new();
        for (key, position) in entries {
            content.extend_from_slice(&entry_line(key, *position)?);
        }

        let mut journal = self.journal.lock().map_err(HubError::lock)?;
        self.ensure_parent()?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&content)?;
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        // The old handle points at the replaced file
        *journal = None;

        tracing::debug!(path = %self.path.display(), count = cursors.len(), "Cursor checkpoint written");
        Ok(())
    }
}

/// In-memory cursor store for non-durable hubs and tests
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<String, Position>,
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Result<HashMap<String, Position>> {
        Ok(self
            .cursors
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect())
    }

    fn commit(&self, key: &str, position: Position) -> Result<()> {
        self.cursors.insert(key.to_string(), position);
        Ok(())
    }

    fn checkpoint(&self, cursors: &HashMap<String, Position>) -> Result<()> {
        self.cursors.clear();
        for (key, position) in cursors {
            self.cursors.insert(key.clone(), *position);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cursors() -> HashMap<String, Position> {
        let mut map = HashMap::new();
        map.insert(cursor_key("ticks", "analyst"), Position::new(0, 12));
        map.insert(cursor_key("orders", "audit"), Position::new(3, 1));
        map
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    #[test]
    fn test_cursor_key() {
        assert_eq!(cursor_key("ticks", "analyst"), "ticks/analyst");
    }

    #[test]
    fn test_memory_store_commit_and_checkpoint() {
        let store = MemoryCursorStore::default();
        assert!(store.load().unwrap().is_empty());

        store.commit("ticks/analyst", Position::new(0, 1)).unwrap();
        store.checkpoint(&sample_cursors()).unwrap();
        store.commit("ticks/late", Position::new(1, 1)).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded["ticks/analyst"], Position::new(0, 12));
    }

    #[test]
    fn test_commit_appends_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("cursors.jsonl");
        let store = FileCursorStore::new(&path);

        store.commit("ticks/a", Position::new(0, 1)).unwrap();
        store.commit("ticks/b", Position::new(0, 4)).unwrap();
        store.commit("ticks/a", Position::new(0, 9)).unwrap();
        assert_eq!(line_count(&path), 3);

        // Last write wins
        let loaded = FileCursorStore::new(&path).load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["ticks/a"], Position::new(0, 9));
        assert_eq!(loaded["ticks/b"], Position::new(0, 4));
    }

    #[test]
    fn test_checkpoint_compacts_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.jsonl");
        let store = FileCursorStore::new(&path);

        for seq in 1..=5 {
            store.commit("ticks/analyst", Position::new(0, seq)).unwrap();
        }
        store.checkpoint(&sample_cursors()).unwrap();
        assert_eq!(line_count(&path), 2);
        assert!(!path.with_extension("tmp").exists());

        // Appends continue on the rewritten file
        store.commit("orders/audit", Position::new(3, 2)).unwrap();
        assert_eq!(line_count(&path), 3);
        let loaded = store.load().unwrap();
        assert_eq!(loaded["orders/audit"], Position::new(3, 2));
        assert_eq!(loaded["ticks/analyst"], Position::new(0, 12));
    }

    #[test]
    fn test_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCursorStore::new(dir.path().join("none.jsonl"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_torn_last_line_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.jsonl");
        let store = FileCursorStore::new(&path);
        store.commit("ticks/a", Position::new(0, 2)).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"key":"ticks/a","posi"#).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded["ticks/a"], Position::new(0, 2));
    }

    #[test]
    fn test_corrupt_middle_line_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.jsonl");
        std::fs::write(
            &path,
            "not json\n{\"key\":\"t/s\",\"position\":{\"epoch\":0,\"sequence\":1}}\n",
        )
        .unwrap();

        let err = FileCursorStore::new(&path).load().unwrap_err();
        assert!(matches!(err, HubError::Config(_)));
    }
}
